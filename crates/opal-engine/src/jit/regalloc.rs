//! Virtual-register allocation for the template emitter
//!
//! Two pools, general-purpose and floating-point, each with a caller-saved
//! main set and a callee-saved aux reserve that is only touched when the
//! main set runs dry, so straight-line sequences never pay for saving
//! callee-saved registers beyond the fixed prologue. `rax`/`rdx` and
//! `xmm0`/`xmm1` stay out of the pools: they are the scratch and argument
//! registers the emitter uses freely.
//!
//! Transient spills around native callbacks go to the fixed slots
//! `TMP_REG_0..TMP_REG_5` and `TMP_XMM_0..TMP_XMM_2` below the activation
//! record; a callback that would need more live registers than the slots
//! can hold aborts compilation and the method falls back to interpretation.

/// General-purpose registers by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GpReg {
    /// Scratch / return register; never pooled.
    Rax = 0,
    /// Pooled; also the shift-count register.
    Rcx = 1,
    /// Scratch (division remainder, byte-compare temp); never pooled.
    Rdx = 2,
    /// Aux pool (callee-saved).
    Rbx = 3,
    /// Stack pointer; never pooled.
    Rsp = 4,
    /// Frame base; never pooled.
    Rbp = 5,
    /// Pooled.
    Rsi = 6,
    /// Pooled.
    Rdi = 7,
    /// Pooled.
    R8 = 8,
    /// Pooled.
    R9 = 9,
    /// Pooled.
    R10 = 10,
    /// Pooled.
    R11 = 11,
    /// Aux pool (callee-saved).
    R12 = 12,
    /// Aux pool (callee-saved).
    R13 = 13,
    /// Aux pool (callee-saved).
    R14 = 14,
    /// Aux pool (callee-saved).
    R15 = 15,
}

impl GpReg {
    /// Hardware encoding (REX extension bit included in bit 3).
    #[inline(always)]
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// Whether a call following the System-V convention may clobber this
    /// register.
    pub fn caller_saved(self) -> bool {
        !matches!(self, GpReg::Rbx | GpReg::R12 | GpReg::R13 | GpReg::R14 | GpReg::R15)
    }
}

/// SSE registers by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XmmReg {
    /// Argument/result scratch; never pooled.
    Xmm0 = 0,
    /// Argument scratch; never pooled.
    Xmm1 = 1,
    /// Pooled.
    Xmm2 = 2,
    /// Pooled.
    Xmm3 = 3,
    /// Pooled.
    Xmm4 = 4,
    /// Pooled.
    Xmm5 = 5,
    /// Pooled.
    Xmm6 = 6,
    /// Pooled.
    Xmm7 = 7,
    /// Aux pool.
    Xmm8 = 8,
    /// Aux pool.
    Xmm9 = 9,
    /// Aux pool.
    Xmm10 = 10,
    /// Aux pool.
    Xmm11 = 11,
}

impl XmmReg {
    /// Hardware encoding.
    #[inline(always)]
    pub fn enc(self) -> u8 {
        self as u8
    }
}

/// Pool of general-purpose registers.
pub struct GpPool {
    avail: Vec<GpReg>,
    aux: Vec<GpReg>,
}

impl GpPool {
    /// A fresh pool with every allocatable register available.
    pub fn new() -> Self {
        Self {
            avail: vec![
                GpReg::Rcx,
                GpReg::Rsi,
                GpReg::Rdi,
                GpReg::R8,
                GpReg::R9,
                GpReg::R10,
                GpReg::R11,
            ],
            aux: vec![GpReg::Rbx, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15],
        }
    }

    /// Take a register, preferring the main pool. With `prefer_low_byte`
    /// the classic byte-addressable registers are tried first, for byte
    /// stores and flag materialization.
    pub fn get(&mut self, prefer_low_byte: bool) -> Option<GpReg> {
        if prefer_low_byte {
            for candidate in [GpReg::Rcx, GpReg::Rsi, GpReg::Rdi] {
                if let Some(at) = self.avail.iter().position(|&r| r == candidate) {
                    return Some(self.avail.remove(at));
                }
            }
        }
        if let Some(reg) = self.avail.pop() {
            return Some(reg);
        }
        self.aux.pop()
    }

    /// Return a register to the head of its pool.
    pub fn release(&mut self, reg: GpReg) {
        debug_assert!(!self.avail.contains(&reg) && !self.aux.contains(&reg));
        if reg.caller_saved() {
            self.avail.push(reg);
        } else {
            self.aux.push(reg);
        }
    }

    /// Registers currently handed out.
    pub fn outstanding(&self) -> usize {
        (7 + 5) - self.avail.len() - self.aux.len()
    }
}

/// Pool of SSE registers.
pub struct XmmPool {
    avail: Vec<XmmReg>,
    aux: Vec<XmmReg>,
}

impl XmmPool {
    /// A fresh pool with every allocatable register available.
    pub fn new() -> Self {
        Self {
            avail: vec![
                XmmReg::Xmm2,
                XmmReg::Xmm3,
                XmmReg::Xmm4,
                XmmReg::Xmm5,
                XmmReg::Xmm6,
                XmmReg::Xmm7,
            ],
            aux: vec![XmmReg::Xmm8, XmmReg::Xmm9, XmmReg::Xmm10, XmmReg::Xmm11],
        }
    }

    /// Take a register, preferring the main pool.
    pub fn get(&mut self) -> Option<XmmReg> {
        self.avail.pop().or_else(|| self.aux.pop())
    }

    /// Return a register to its pool.
    pub fn release(&mut self, reg: XmmReg) {
        debug_assert!(!self.avail.contains(&reg) && !self.aux.contains(&reg));
        if (reg.enc()) >= 8 {
            self.aux.push(reg);
        } else {
            self.avail.push(reg);
        }
    }

    /// Registers currently handed out.
    pub fn outstanding(&self) -> usize {
        (6 + 4) - self.avail.len() - self.aux.len()
    }
}
