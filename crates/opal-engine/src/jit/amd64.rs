//! One-pass x86-64 (System-V) template emitter
//!
//! Each bytecode instruction either emits machine code realizing its effect
//! or defers by pushing an operand onto the compile-time working stack, a
//! mirror of the runtime operand stack. Values flow to the real stack only
//! at call boundaries and returns; simple expression chains stay in
//! registers.
//!
//! The emitted frame extends the interpreter contract: below the saved
//! callee-saved area sit the named slots (`CLS_ID` through `JIT_OFFSET`),
//! the transient spill slots, and the method's local words. The prologue
//! publishes the local area through the activation frame's
//! `jit_mem`/`jit_offset` fields so the collector can walk native locals
//! while the method is suspended in a callback.
//!
//! Failure exits share four stubs behind the common epilogue, returning
//! −1 (nil dereference), −2 (index below zero), −3 (index at or above
//! size), and −4 (zero divisor); their jump displacements are patched in a
//! second pass together with label jumps.

use std::collections::VecDeque;

use opal_sdk::ValueKind;

use super::pages;
use super::regalloc::{GpPool, GpReg, XmmPool, XmmReg};
use super::NativeCode;
use crate::program::{Instruction, MemRef, Method, Opcode};

// Named frame slots, byte offsets from rbp. The five callee-saved pushes
// occupy rbp-8..rbp-40; everything below is inside the sub'd local space.
const CLS_ID: i32 = -48;
const MTHD_ID: i32 = -56;
const CLASS_MEM: i32 = -64;
const INSTANCE_MEM: i32 = -72;
const OP_STACK: i32 = -80;
const STACK_POS: i32 = -88;
const CALL_STACK: i32 = -96;
const CALL_STACK_POS: i32 = -104;
const JIT_MEM: i32 = -112;
const JIT_OFFSET: i32 = -120;

const TMP_REG_0: i32 = -128;
const TMP_REG_COUNT: usize = 6;
const TMP_XMM_0: i32 = -176;
const TMP_XMM_COUNT: usize = 3;

// Bytes from rbp down to the first local word.
const LOCALS_BASE: i32 = 200;
// Bytes of fixed area inside the sub'd space (from rbp-48 to rbp-192).
const FIXED_AREA: i32 = 192;
const SAVED_REGS_BYTES: i32 = 40;

// Condition codes; inverting a comparison toggles the low bit.
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_L: u8 = 0xC;
const CC_GE: u8 = 0xD;
const CC_LE: u8 = 0xE;
const CC_G: u8 = 0xF;
const CC_A: u8 = 0x7;
const CC_AE: u8 = 0x3;
const CC_P: u8 = 0xA;
const CC_NP: u8 = 0xB;

// ALU opcode bytes: op r/m64, r64.
const ALU_ADD: u8 = 0x01;
const ALU_SUB: u8 = 0x29;
const ALU_AND: u8 = 0x21;
const ALU_OR: u8 = 0x09;
const ALU_XOR: u8 = 0x31;
const ALU_CMP: u8 = 0x39;

// ALU opcode bytes: op r64, r/m64.
const ALUM_ADD: u8 = 0x03;
const ALUM_SUB: u8 = 0x2B;
const ALUM_AND: u8 = 0x23;
const ALUM_OR: u8 = 0x0B;
const ALUM_XOR: u8 = 0x33;
const ALUM_CMP: u8 = 0x3B;

// /digit extensions for the 0x81 immediate group.
const EXT_ADD: u8 = 0;
const EXT_OR: u8 = 1;
const EXT_AND: u8 = 4;
const EXT_SUB: u8 = 5;
const EXT_XOR: u8 = 6;
const EXT_CMP: u8 = 7;

// /digit extensions for the shift group.
const EXT_SHL: u8 = 4;
const EXT_SAR: u8 = 7;

// SSE arithmetic second opcode bytes (F2 0F xx).
const SSE_ADD: u8 = 0x58;
const SSE_SUB: u8 = 0x5C;
const SSE_MUL: u8 = 0x59;
const SSE_DIV: u8 = 0x5E;

const MAX_FLOATS: usize = 256;

/// Why a method could not be compiled. Never fatal; the caller falls back
/// to interpretation.
#[derive(Debug, thiserror::Error)]
pub(crate) enum JitError {
    #[error("unsupported instruction {0:?}")]
    Unsupported(Opcode),
    #[error("register pressure exceeds the spill area")]
    RegisterPressure,
    #[error("float-constant table overflow")]
    FloatTable,
    #[error("working stack shape not supported")]
    StackShape,
    #[error("unresolved jump label {0}")]
    Label(i64),
    #[error("executable pages unavailable")]
    Pages,
}

/// Compile-time operand-stack entry.
#[derive(Debug, Clone, Copy)]
enum Operand {
    /// Integer immediate, foldable.
    ImmInt(i64),
    /// Index into the interned float table.
    ImmFloat(usize),
    /// Integer word at an rbp-relative offset.
    MemInt(i32),
    /// Double at an rbp-relative offset.
    MemFloat(i32),
    /// Live general-purpose register.
    RegInt(GpReg),
    /// Live SSE register.
    RegFloat(XmmReg),
}

struct JumpPatch {
    pos: usize,
    label: i64,
}

enum Spill {
    Gp(GpReg, i32),
    Xmm(XmmReg, i32),
}

struct JitCompiler {
    method: &'static Method,
    code: Vec<u8>,
    floats: Box<[f64]>,
    float_count: usize,
    working: VecDeque<Operand>,
    gp: GpPool,
    xmm: XmmPool,
    instr_offsets: Vec<usize>,
    instr_index: usize,
    jump_patches: Vec<JumpPatch>,
    epilog_patches: Vec<usize>,
    nil_patches: Vec<usize>,
    lower_patches: Vec<usize>,
    upper_patches: Vec<usize>,
    div_zero_patches: Vec<usize>,
    locals_words: usize,
}

/// Compile one method to native code.
pub(crate) fn compile_method(method: &'static Method) -> Result<NativeCode, JitError> {
    let instructions = method.instructions();
    match instructions.last() {
        Some(last) if last.opcode() == Opcode::Rtrn => {}
        _ => return Err(JitError::StackShape),
    }

    let mut compiler = JitCompiler {
        method,
        code: Vec::with_capacity(instructions.len() * 24),
        floats: vec![0.0f64; MAX_FLOATS].into_boxed_slice(),
        float_count: 0,
        working: VecDeque::new(),
        gp: GpPool::new(),
        xmm: XmmPool::new(),
        instr_offsets: vec![0; instructions.len()],
        instr_index: 0,
        jump_patches: Vec::new(),
        epilog_patches: Vec::new(),
        nil_patches: Vec::new(),
        lower_patches: Vec::new(),
        upper_patches: Vec::new(),
        div_zero_patches: Vec::new(),
        locals_words: method.mem_size().max(1),
    };
    compiler.compile()
}

impl JitCompiler {
    fn compile(mut self) -> Result<NativeCode, JitError> {
        self.prolog();
        self.process_parameters()?;
        self.process_instructions()?;

        self.emit_epilog_and_stubs();
        self.patch_labels()?;

        let len = self.code.len();
        let ptr = pages::install(&self.code).ok_or(JitError::Pages)?;
        Ok(NativeCode::new(ptr, len, self.floats))
    }

    // ---- frame setup -----------------------------------------------------

    fn local_space(&self) -> i32 {
        let mut space = FIXED_AREA - SAVED_REGS_BYTES + (self.locals_words as i32) * 8;
        // keep rsp 16-byte aligned after the five callee-saved pushes
        if space % 16 != 8 {
            space += 8;
        }
        space
    }

    fn local_offset(&self, operand: i64) -> i32 {
        -(LOCALS_BASE + (operand as i32) * 8)
    }

    fn prolog(&mut self) {
        // push rbp; mov rbp, rsp
        self.emit(0x55);
        self.emit_slice(&[0x48, 0x89, 0xE5]);
        for reg in [GpReg::Rbx, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15] {
            self.push_reg(reg);
        }
        // sub rsp, local_space
        let space = self.local_space();
        self.emit_slice(&[0x48, 0x81, 0xEC]);
        self.emit_i32(space);

        // spill the ten entry arguments into their named slots
        self.mov_reg_mem(GpReg::Rdi, CLS_ID, GpReg::Rbp);
        self.mov_reg_mem(GpReg::Rsi, MTHD_ID, GpReg::Rbp);
        self.mov_reg_mem(GpReg::Rdx, CLASS_MEM, GpReg::Rbp);
        self.mov_reg_mem(GpReg::Rcx, INSTANCE_MEM, GpReg::Rbp);
        self.mov_reg_mem(GpReg::R8, OP_STACK, GpReg::Rbp);
        self.mov_reg_mem(GpReg::R9, STACK_POS, GpReg::Rbp);
        for (arg_disp, slot) in [(16, CALL_STACK), (24, CALL_STACK_POS), (32, JIT_MEM), (40, JIT_OFFSET)] {
            self.mov_mem_reg(arg_disp, GpReg::Rbp, GpReg::Rax);
            self.mov_reg_mem(GpReg::Rax, slot, GpReg::Rbp);
        }

        // publish the native local area for the collector's root walk
        let low = FIXED_AREA + (self.locals_words as i32) * 8;
        self.mov_mem_reg(JIT_MEM, GpReg::Rbp, GpReg::Rax);
        self.lea(-low, GpReg::Rbp, GpReg::Rdx);
        self.mov_reg_mem(GpReg::Rdx, 0, GpReg::Rax);
        self.mov_mem_reg(JIT_OFFSET, GpReg::Rbp, GpReg::Rax);
        self.mov_imm_mem((low - SAVED_REGS_BYTES) / 8, 0, GpReg::Rax);
    }

    fn emit_epilog_and_stubs(&mut self) {
        let epilog = self.code.len();
        // lea rsp, [rbp-40]; pop callee-saved; pop rbp; ret
        self.lea(-SAVED_REGS_BYTES, GpReg::Rbp, GpReg::Rsp);
        for reg in [GpReg::R15, GpReg::R14, GpReg::R13, GpReg::R12, GpReg::Rbx] {
            self.pop_reg(reg);
        }
        self.emit(0x5D);
        self.emit(0xC3);

        // failure stubs fall back into the shared epilogue
        for (status, list) in [
            (super::STATUS_NIL, std::mem::take(&mut self.nil_patches)),
            (super::STATUS_BOUNDS_LOW, std::mem::take(&mut self.lower_patches)),
            (super::STATUS_BOUNDS_HIGH, std::mem::take(&mut self.upper_patches)),
            (super::STATUS_DIV_ZERO, std::mem::take(&mut self.div_zero_patches)),
        ] {
            let stub = self.code.len();
            self.mov_imm_reg(status, GpReg::Rax);
            let jump = self.jmp32();
            self.patch_rel32(jump, epilog);
            for pos in list {
                self.patch_rel32(pos, stub);
            }
        }

        for pos in std::mem::take(&mut self.epilog_patches) {
            self.patch_rel32(pos, epilog);
        }
    }

    fn patch_labels(&mut self) -> Result<(), JitError> {
        let patches = std::mem::take(&mut self.jump_patches);
        for patch in patches {
            let index = self
                .method
                .label_index(patch.label)
                .ok_or(JitError::Label(patch.label))?;
            let target_instr = index + 1;
            if target_instr >= self.instr_offsets.len() {
                return Err(JitError::Label(patch.label));
            }
            let target = self.instr_offsets[target_instr];
            self.patch_rel32(patch.pos, target);
        }
        Ok(())
    }

    fn patch_rel32(&mut self, pos: usize, target: usize) {
        let rel = (target as i64 - (pos as i64 + 4)) as i32;
        self.code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
    }

    // ---- byte emission ---------------------------------------------------

    #[inline]
    fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn emit_slice(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_i64(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn rex(&mut self, wide: bool, reg: u8, rm: u8) {
        self.emit(0x40 | (wide as u8) << 3 | ((reg >> 3) & 1) << 2 | ((rm >> 3) & 1));
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.emit(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    fn modrm_mem(&mut self, reg: u8, base: u8, disp: i32) {
        self.emit(0x80 | ((reg & 7) << 3) | (base & 7));
        if base & 7 == 4 {
            self.emit(0x24);
        }
        self.emit_i32(disp);
    }

    // ---- integer instructions --------------------------------------------

    fn mov_reg_reg(&mut self, src: GpReg, dst: GpReg) {
        self.rex(true, src.enc(), dst.enc());
        self.emit(0x89);
        self.modrm_reg(src.enc(), dst.enc());
    }

    fn mov_mem_reg(&mut self, disp: i32, base: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), base.enc());
        self.emit(0x8B);
        self.modrm_mem(dst.enc(), base.enc(), disp);
    }

    fn mov_reg_mem(&mut self, src: GpReg, disp: i32, base: GpReg) {
        self.rex(true, src.enc(), base.enc());
        self.emit(0x89);
        self.modrm_mem(src.enc(), base.enc(), disp);
    }

    fn mov_imm_reg(&mut self, imm: i64, dst: GpReg) {
        self.rex(true, 0, dst.enc());
        self.emit(0xB8 + (dst.enc() & 7));
        self.emit_i64(imm);
    }

    fn mov_imm_mem(&mut self, imm: i32, disp: i32, base: GpReg) {
        self.rex(true, 0, base.enc());
        self.emit(0xC7);
        self.modrm_mem(0, base.enc(), disp);
        self.emit_i32(imm);
    }

    fn movzx8_mem_reg(&mut self, disp: i32, base: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), base.enc());
        self.emit_slice(&[0x0F, 0xB6]);
        self.modrm_mem(dst.enc(), base.enc(), disp);
    }

    fn mov_reg8_mem(&mut self, src: GpReg, disp: i32, base: GpReg) {
        self.rex(false, src.enc(), base.enc());
        self.emit(0x88);
        self.modrm_mem(src.enc(), base.enc(), disp);
    }

    fn mov32_mem_reg(&mut self, disp: i32, base: GpReg, dst: GpReg) {
        self.rex(false, dst.enc(), base.enc());
        self.emit(0x8B);
        self.modrm_mem(dst.enc(), base.enc(), disp);
    }

    fn mov32_reg_mem(&mut self, src: GpReg, disp: i32, base: GpReg) {
        self.rex(false, src.enc(), base.enc());
        self.emit(0x89);
        self.modrm_mem(src.enc(), base.enc(), disp);
    }

    fn alu_reg_reg(&mut self, op: u8, src: GpReg, dst: GpReg) {
        self.rex(true, src.enc(), dst.enc());
        self.emit(op);
        self.modrm_reg(src.enc(), dst.enc());
    }

    fn alu_mem_reg(&mut self, op: u8, disp: i32, base: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), base.enc());
        self.emit(op);
        self.modrm_mem(dst.enc(), base.enc(), disp);
    }

    fn alu_imm_reg(&mut self, ext: u8, imm: i32, dst: GpReg) {
        self.rex(true, 0, dst.enc());
        self.emit(0x81);
        self.modrm_reg(ext, dst.enc());
        self.emit_i32(imm);
    }

    fn imul_reg_reg(&mut self, src: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), src.enc());
        self.emit_slice(&[0x0F, 0xAF]);
        self.modrm_reg(dst.enc(), src.enc());
    }

    fn imul_mem_reg(&mut self, disp: i32, base: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), base.enc());
        self.emit_slice(&[0x0F, 0xAF]);
        self.modrm_mem(dst.enc(), base.enc(), disp);
    }

    fn shift_imm_reg(&mut self, ext: u8, amount: u8, reg: GpReg) {
        self.rex(true, 0, reg.enc());
        self.emit(0xC1);
        self.modrm_reg(ext, reg.enc());
        self.emit(amount);
    }

    fn shift_cl_reg(&mut self, ext: u8, reg: GpReg) {
        self.rex(true, 0, reg.enc());
        self.emit(0xD3);
        self.modrm_reg(ext, reg.enc());
    }

    fn cqo(&mut self) {
        self.emit_slice(&[0x48, 0x99]);
    }

    fn idiv_reg(&mut self, reg: GpReg) {
        self.rex(true, 0, reg.enc());
        self.emit(0xF7);
        self.modrm_reg(7, reg.enc());
    }

    fn inc_mem(&mut self, disp: i32, base: GpReg) {
        self.rex(true, 0, base.enc());
        self.emit(0xFF);
        self.modrm_mem(0, base.enc(), disp);
    }

    fn dec_mem(&mut self, disp: i32, base: GpReg) {
        self.rex(true, 0, base.enc());
        self.emit(0xFF);
        self.modrm_mem(1, base.enc(), disp);
    }

    fn lea(&mut self, disp: i32, base: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), base.enc());
        self.emit(0x8D);
        self.modrm_mem(dst.enc(), base.enc(), disp);
    }

    fn push_reg(&mut self, reg: GpReg) {
        if reg.enc() >= 8 {
            self.emit(0x41);
        }
        self.emit(0x50 + (reg.enc() & 7));
    }

    fn pop_reg(&mut self, reg: GpReg) {
        if reg.enc() >= 8 {
            self.emit(0x41);
        }
        self.emit(0x58 + (reg.enc() & 7));
    }

    fn push_mem(&mut self, disp: i32, base: GpReg) {
        if base.enc() >= 8 {
            self.emit(0x41);
        }
        self.emit(0xFF);
        self.modrm_mem(6, base.enc(), disp);
    }

    fn push_imm32(&mut self, imm: i32) {
        self.emit(0x68);
        self.emit_i32(imm);
    }

    fn call_reg(&mut self, reg: GpReg) {
        if reg.enc() >= 8 {
            self.emit(0x41);
        }
        self.emit(0xFF);
        self.modrm_reg(2, reg.enc());
    }

    fn cmov(&mut self, cc: u8, src: GpReg, dst: GpReg) {
        self.rex(true, dst.enc(), src.enc());
        self.emit_slice(&[0x0F, 0x40 + cc]);
        self.modrm_reg(dst.enc(), src.enc());
    }

    fn setcc_al(&mut self, cc: u8) {
        self.emit_slice(&[0x0F, 0x90 + cc, 0xC0]);
    }

    fn setcc_dl(&mut self, cc: u8) {
        self.emit_slice(&[0x0F, 0x90 + cc, 0xC2]);
    }

    fn and_al_dl(&mut self) {
        self.emit_slice(&[0x20, 0xD0]);
    }

    fn or_al_dl(&mut self) {
        self.emit_slice(&[0x08, 0xD0]);
    }

    fn movzx8_al_reg(&mut self, dst: GpReg) {
        self.rex(true, dst.enc(), GpReg::Rax.enc());
        self.emit_slice(&[0x0F, 0xB6]);
        self.modrm_reg(dst.enc(), GpReg::Rax.enc());
    }

    /// Emit a jump with a zeroed rel32 and return the displacement position.
    fn jmp32(&mut self) -> usize {
        self.emit(0xE9);
        let pos = self.code.len();
        self.emit_i32(0);
        pos
    }

    fn jcc32(&mut self, cc: u8) -> usize {
        self.emit_slice(&[0x0F, 0x80 + cc]);
        let pos = self.code.len();
        self.emit_i32(0);
        pos
    }

    // ---- SSE instructions ------------------------------------------------

    fn sse_reg(&mut self, prefix: u8, op: u8, reg: u8, rm: u8, wide: bool) {
        self.emit(prefix);
        if wide || reg >= 8 || rm >= 8 {
            self.rex(wide, reg, rm);
        }
        self.emit_slice(&[0x0F, op]);
        self.modrm_reg(reg, rm);
    }

    fn sse_mem(&mut self, prefix: u8, op: u8, reg: u8, base: u8, disp: i32, wide: bool) {
        self.emit(prefix);
        if wide || reg >= 8 || base >= 8 {
            self.rex(wide, reg, base);
        }
        self.emit_slice(&[0x0F, op]);
        self.modrm_mem(reg, base, disp);
    }

    fn movsd_mem_xreg(&mut self, disp: i32, base: GpReg, dst: XmmReg) {
        self.sse_mem(0xF2, 0x10, dst.enc(), base.enc(), disp, false);
    }

    fn movsd_xreg_mem(&mut self, src: XmmReg, disp: i32, base: GpReg) {
        self.sse_mem(0xF2, 0x11, src.enc(), base.enc(), disp, false);
    }

    fn movsd_xreg_xreg(&mut self, src: XmmReg, dst: XmmReg) {
        self.sse_reg(0xF2, 0x10, dst.enc(), src.enc(), false);
    }

    fn sse_arith(&mut self, op: u8, src: XmmReg, dst: XmmReg) {
        self.sse_reg(0xF2, op, dst.enc(), src.enc(), false);
    }

    fn comisd(&mut self, a: XmmReg, b: XmmReg) {
        self.sse_reg(0x66, 0x2F, a.enc(), b.enc(), false);
    }

    fn cvtsi2sd(&mut self, src: GpReg, dst: XmmReg) {
        self.sse_reg(0xF2, 0x2A, dst.enc(), src.enc(), true);
    }

    fn cvttsd2si(&mut self, src: XmmReg, dst: GpReg) {
        self.sse_reg(0xF2, 0x2C, dst.enc(), src.enc(), true);
    }

    fn roundsd(&mut self, src: XmmReg, dst: XmmReg, mode: u8) {
        self.emit(0x66);
        if src.enc() >= 8 || dst.enc() >= 8 {
            self.rex(false, dst.enc(), src.enc());
        }
        self.emit_slice(&[0x0F, 0x3A, 0x0B]);
        self.modrm_reg(dst.enc(), src.enc());
        self.emit(mode);
    }

    // ---- working-stack plumbing ------------------------------------------

    fn get_reg(&mut self) -> Result<GpReg, JitError> {
        self.gp.get(false).ok_or(JitError::RegisterPressure)
    }

    fn get_xmm(&mut self) -> Result<XmmReg, JitError> {
        self.xmm.get().ok_or(JitError::RegisterPressure)
    }

    fn pop_working(&mut self) -> Result<Operand, JitError> {
        self.working.pop_front().ok_or(JitError::StackShape)
    }

    fn release_op(&mut self, op: Operand) {
        match op {
            Operand::RegInt(r) => self.gp.release(r),
            Operand::RegFloat(x) => self.xmm.release(x),
            _ => {}
        }
    }

    fn intern_float(&mut self, value: f64) -> Result<usize, JitError> {
        for i in 0..self.float_count {
            if self.floats[i].to_bits() == value.to_bits() {
                return Ok(i);
            }
        }
        if self.float_count >= MAX_FLOATS {
            return Err(JitError::FloatTable);
        }
        self.floats[self.float_count] = value;
        self.float_count += 1;
        Ok(self.float_count - 1)
    }

    fn float_addr(&self, index: usize) -> i64 {
        self.floats[index..].as_ptr() as i64
    }

    fn materialize_int(&mut self, op: Operand) -> Result<GpReg, JitError> {
        match op {
            Operand::ImmInt(v) => {
                let reg = self.get_reg()?;
                self.mov_imm_reg(v, reg);
                Ok(reg)
            }
            Operand::MemInt(off) => {
                let reg = self.get_reg()?;
                self.mov_mem_reg(off, GpReg::Rbp, reg);
                Ok(reg)
            }
            Operand::RegInt(reg) => Ok(reg),
            _ => Err(JitError::StackShape),
        }
    }

    fn materialize_float(&mut self, op: Operand) -> Result<XmmReg, JitError> {
        match op {
            Operand::ImmFloat(index) => {
                let reg = self.get_xmm()?;
                self.mov_imm_reg(self.float_addr(index), GpReg::Rax);
                self.movsd_mem_xreg(0, GpReg::Rax, reg);
                Ok(reg)
            }
            Operand::MemFloat(off) => {
                let reg = self.get_xmm()?;
                self.movsd_mem_xreg(off, GpReg::Rbp, reg);
                Ok(reg)
            }
            Operand::RegFloat(reg) => Ok(reg),
            _ => Err(JitError::StackShape),
        }
    }

    /// Load a float operand into a fixed argument register.
    fn load_float_into(&mut self, op: Operand, target: XmmReg) -> Result<(), JitError> {
        match op {
            Operand::ImmFloat(index) => {
                self.mov_imm_reg(self.float_addr(index), GpReg::Rax);
                self.movsd_mem_xreg(0, GpReg::Rax, target);
            }
            Operand::MemFloat(off) => self.movsd_mem_xreg(off, GpReg::Rbp, target),
            Operand::RegFloat(reg) => {
                self.movsd_xreg_xreg(reg, target);
                self.xmm.release(reg);
            }
            _ => return Err(JitError::StackShape),
        }
        Ok(())
    }

    fn nil_check(&mut self, reg: GpReg) {
        self.alu_imm_reg(EXT_CMP, 0, reg);
        let pos = self.jcc32(CC_E);
        self.nil_patches.push(pos);
    }

    // ---- real-stack transfer ---------------------------------------------

    /// Point rax at the next free operand-stack slot (for a push).
    fn addr_of_stack_top(&mut self) {
        self.mov_mem_reg(STACK_POS, GpReg::Rbp, GpReg::Rdx);
        self.mov_mem_reg(0, GpReg::Rdx, GpReg::Rax);
        self.shift_imm_reg(EXT_SHL, 3, GpReg::Rax);
        self.alu_mem_reg(ALUM_ADD, OP_STACK, GpReg::Rbp, GpReg::Rax);
    }

    /// Move the top `params` working entries to the real operand stack,
    /// oldest first, releasing their registers. Negative `params` flushes
    /// everything.
    fn flush_to_op_stack(&mut self, params: i64) {
        let count = if params < 0 {
            self.working.len()
        } else {
            (params as usize).min(self.working.len())
        };
        for i in (0..count).rev() {
            let op = self.working[i];
            self.addr_of_stack_top();
            match op {
                Operand::ImmInt(v) => {
                    if let Ok(imm) = i32::try_from(v) {
                        self.mov_imm_mem(imm, 0, GpReg::Rax);
                    } else {
                        self.mov_imm_reg(v, GpReg::Rdx);
                        self.mov_reg_mem(GpReg::Rdx, 0, GpReg::Rax);
                    }
                }
                Operand::ImmFloat(index) => {
                    let bits = self.floats[index].to_bits() as i64;
                    self.mov_imm_reg(bits, GpReg::Rdx);
                    self.mov_reg_mem(GpReg::Rdx, 0, GpReg::Rax);
                }
                Operand::MemInt(off) | Operand::MemFloat(off) => {
                    self.mov_mem_reg(off, GpReg::Rbp, GpReg::Rdx);
                    self.mov_reg_mem(GpReg::Rdx, 0, GpReg::Rax);
                }
                Operand::RegInt(reg) => self.mov_reg_mem(reg, 0, GpReg::Rax),
                Operand::RegFloat(reg) => self.movsd_xreg_mem(reg, 0, GpReg::Rax),
            }
            self.mov_mem_reg(STACK_POS, GpReg::Rbp, GpReg::Rdx);
            self.inc_mem(0, GpReg::Rdx);
        }
        for _ in 0..count {
            let op = self.working.pop_front().expect("counted above");
            self.release_op(op);
        }
    }

    /// Pull one integer result from the real operand stack into a register.
    fn pull_int_result(&mut self) -> Result<(), JitError> {
        self.mov_mem_reg(STACK_POS, GpReg::Rbp, GpReg::Rdx);
        self.dec_mem(0, GpReg::Rdx);
        self.mov_mem_reg(0, GpReg::Rdx, GpReg::Rax);
        self.shift_imm_reg(EXT_SHL, 3, GpReg::Rax);
        self.alu_mem_reg(ALUM_ADD, OP_STACK, GpReg::Rbp, GpReg::Rax);
        let dest = self.get_reg()?;
        self.mov_mem_reg(0, GpReg::Rax, dest);
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    fn pull_float_result(&mut self) -> Result<(), JitError> {
        self.mov_mem_reg(STACK_POS, GpReg::Rbp, GpReg::Rdx);
        self.dec_mem(0, GpReg::Rdx);
        self.mov_mem_reg(0, GpReg::Rdx, GpReg::Rax);
        self.shift_imm_reg(EXT_SHL, 3, GpReg::Rax);
        self.alu_mem_reg(ALUM_ADD, OP_STACK, GpReg::Rbp, GpReg::Rax);
        let dest = self.get_xmm()?;
        self.movsd_mem_xreg(0, GpReg::Rax, dest);
        self.working.push_front(Operand::RegFloat(dest));
        Ok(())
    }

    fn pull_result(&mut self, kind: ValueKind) -> Result<(), JitError> {
        match kind {
            ValueKind::Int | ValueKind::Byte | ValueKind::Char => self.pull_int_result(),
            ValueKind::Float => self.pull_float_result(),
            ValueKind::Func => {
                self.pull_int_result()?;
                self.pull_int_result()?;
                self.working.swap(0, 1);
                Ok(())
            }
            ValueKind::Nil => Ok(()),
        }
    }

    // ---- callback bridge -------------------------------------------------

    fn spill_live(&mut self) -> Result<Vec<Spill>, JitError> {
        let live: Vec<Operand> = self.working.iter().copied().collect();
        let mut spills = Vec::new();
        let mut gp_used = 0usize;
        let mut xmm_used = 0usize;
        for op in live {
            match op {
                Operand::RegInt(reg) => {
                    if gp_used >= TMP_REG_COUNT {
                        return Err(JitError::RegisterPressure);
                    }
                    let slot = TMP_REG_0 - (gp_used as i32) * 8;
                    self.mov_reg_mem(reg, slot, GpReg::Rbp);
                    spills.push(Spill::Gp(reg, slot));
                    gp_used += 1;
                }
                Operand::RegFloat(reg) => {
                    if xmm_used >= TMP_XMM_COUNT {
                        return Err(JitError::RegisterPressure);
                    }
                    let slot = TMP_XMM_0 - (xmm_used as i32) * 8;
                    self.movsd_xreg_mem(reg, slot, GpReg::Rbp);
                    spills.push(Spill::Xmm(reg, slot));
                    xmm_used += 1;
                }
                _ => {}
            }
        }
        Ok(spills)
    }

    fn restore_live(&mut self, spills: &[Spill]) {
        for spill in spills.iter().rev() {
            match *spill {
                Spill::Gp(reg, slot) => self.mov_mem_reg(slot, GpReg::Rbp, reg),
                Spill::Xmm(reg, slot) => self.movsd_mem_xreg(slot, GpReg::Rbp, reg),
            }
        }
    }

    /// Flush `params` stack arguments, marshal the runtime callback's
    /// argument list, and call it. Live registers not consumed as
    /// parameters ride out the call in the fixed spill slots.
    fn stack_callback(&mut self, instr: &Instruction, params: i64) -> Result<(), JitError> {
        self.flush_to_op_stack(params);
        let spills = self.spill_live()?;

        self.mov_imm_reg(instr.opcode() as i64, GpReg::Rdi);
        self.mov_imm_reg(instr as *const Instruction as i64, GpReg::Rsi);
        self.mov_mem_reg(CLS_ID, GpReg::Rbp, GpReg::Rdx);
        self.mov_mem_reg(MTHD_ID, GpReg::Rbp, GpReg::Rcx);
        self.mov_mem_reg(INSTANCE_MEM, GpReg::Rbp, GpReg::R8);
        self.mov_mem_reg(OP_STACK, GpReg::Rbp, GpReg::R9);
        self.push_imm32((self.instr_index - 1) as i32);
        self.push_mem(CALL_STACK_POS, GpReg::Rbp);
        self.push_mem(CALL_STACK, GpReg::Rbp);
        self.push_mem(STACK_POS, GpReg::Rbp);
        self.mov_imm_reg(super::jit_stack_callback as usize as i64, GpReg::Rax);
        self.call_reg(GpReg::Rax);
        self.alu_imm_reg(EXT_ADD, 32, GpReg::Rsp);

        self.restore_live(&spills);
        Ok(())
    }

    /// Call a unary or binary platform math routine through xmm0/xmm1.
    fn math_call(&mut self, addr: usize, args: &[Operand]) -> Result<(), JitError> {
        let spills = self.spill_live()?;
        match args {
            [a] => self.load_float_into(*a, XmmReg::Xmm0)?,
            [a, b] => {
                self.load_float_into(*b, XmmReg::Xmm1)?;
                self.load_float_into(*a, XmmReg::Xmm0)?;
            }
            _ => {}
        }
        self.mov_imm_reg(addr as i64, GpReg::Rax);
        self.call_reg(GpReg::Rax);
        self.restore_live(&spills);

        let dest = self.get_xmm()?;
        self.movsd_xreg_xreg(XmmReg::Xmm0, dest);
        self.working.push_front(Operand::RegFloat(dest));
        Ok(())
    }

    // ---- parameters ------------------------------------------------------

    /// Pop the caller's arguments from the real operand stack into locals,
    /// driven by the method's leading store instructions.
    fn process_parameters(&mut self) -> Result<(), JitError> {
        for _ in 0..self.method.param_count() {
            let index = self.instr_index;
            if index >= self.method.instructions().len() {
                return Err(JitError::StackShape);
            }
            self.instr_offsets[index] = self.code.len();
            let instr = &self.method.instructions()[index];
            self.instr_index += 1;

            match instr.opcode() {
                Opcode::StorIntVar | Opcode::CopyIntVar => {
                    self.pull_int_result()?;
                    self.process_store(instr)?;
                }
                Opcode::StorFloatVar => {
                    self.pull_float_result()?;
                    self.process_store(instr)?;
                }
                Opcode::StorFuncVar => {
                    self.pull_int_result()?;
                    self.pull_int_result()?;
                    self.working.swap(0, 1);
                    self.process_store(instr)?;
                }
                other => return Err(JitError::Unsupported(other)),
            }
        }
        Ok(())
    }

    // ---- main translation loop -------------------------------------------

    fn process_instructions(&mut self) -> Result<(), JitError> {
        use Opcode::*;

        while self.instr_index < self.method.instructions().len() {
            let index = self.instr_index;
            self.instr_offsets[index] = self.code.len();
            let instr = &self.method.instructions()[index];
            self.instr_index += 1;

            match instr.opcode() {
                LoadIntLit | LoadCharLit => {
                    self.working.push_front(Operand::ImmInt(instr.operand()));
                }
                LoadFloatLit => {
                    let index = self.intern_float(instr.float_operand())?;
                    self.working.push_front(Operand::ImmFloat(index));
                }
                LoadInstMem => self.working.push_front(Operand::MemInt(INSTANCE_MEM)),
                LoadClsMem => self.working.push_front(Operand::MemInt(CLASS_MEM)),

                LoadIntVar | LoadFloatVar | LoadFuncVar => self.process_load(instr)?,
                StorIntVar | StorFloatVar | StorFuncVar => self.process_store(instr)?,
                CopyIntVar | CopyFloatVar => self.process_copy(instr)?,

                AddInt => self.process_int_arith(ALU_ADD, ALUM_ADD, EXT_ADD, |l, r| l.wrapping_add(r))?,
                SubInt => self.process_int_arith(ALU_SUB, ALUM_SUB, EXT_SUB, |l, r| l.wrapping_sub(r))?,
                MulInt => self.process_int_mul()?,
                DivInt => self.process_int_div(false)?,
                ModInt => self.process_int_div(true)?,
                BitAndInt => self.process_int_arith(ALU_AND, ALUM_AND, EXT_AND, |l, r| l & r)?,
                BitOrInt => self.process_int_arith(ALU_OR, ALUM_OR, EXT_OR, |l, r| l | r)?,
                BitXorInt => self.process_int_arith(ALU_XOR, ALUM_XOR, EXT_XOR, |l, r| l ^ r)?,
                AndInt => self.process_logical(true)?,
                OrInt => self.process_logical(false)?,
                ShlInt => self.process_shift(EXT_SHL)?,
                ShrInt => self.process_shift(EXT_SAR)?,

                LesInt => self.process_int_cmp(CC_L, |l, r| l < r)?,
                GtrInt => self.process_int_cmp(CC_G, |l, r| l > r)?,
                EqlInt => self.process_int_cmp(CC_E, |l, r| l == r)?,
                NeqlInt => self.process_int_cmp(CC_NE, |l, r| l != r)?,
                LesEqlInt => self.process_int_cmp(CC_LE, |l, r| l <= r)?,
                GtrEqlInt => self.process_int_cmp(CC_GE, |l, r| l >= r)?,

                AddFloat => self.process_float_arith(SSE_ADD, |l, r| l + r)?,
                SubFloat => self.process_float_arith(SSE_SUB, |l, r| l - r)?,
                MulFloat => self.process_float_arith(SSE_MUL, |l, r| l * r)?,
                DivFloat => self.process_float_arith(SSE_DIV, |l, r| l / r)?,

                LesFloat => self.process_float_cmp(instr.opcode())?,
                GtrFloat => self.process_float_cmp(instr.opcode())?,
                LesEqlFloat => self.process_float_cmp(instr.opcode())?,
                GtrEqlFloat => self.process_float_cmp(instr.opcode())?,
                EqlFloat => self.process_float_cmp(instr.opcode())?,
                NeqlFloat => self.process_float_cmp(instr.opcode())?,

                FlorFloat => self.process_round(1)?,
                CeilFloat => self.process_round(2)?,
                SinFloat => self.process_math1(super::mathfn::sin as usize)?,
                CosFloat => self.process_math1(super::mathfn::cos as usize)?,
                TanFloat => self.process_math1(super::mathfn::tan as usize)?,
                AsinFloat => self.process_math1(super::mathfn::asin as usize)?,
                AcosFloat => self.process_math1(super::mathfn::acos as usize)?,
                AtanFloat => self.process_math1(super::mathfn::atan as usize)?,
                LogFloat => self.process_math1(super::mathfn::log as usize)?,
                SqrtFloat => self.process_math1(super::mathfn::sqrt as usize)?,
                Atan2Float => self.process_math2(super::mathfn::atan2 as usize)?,
                PowFloat => self.process_math2(super::mathfn::pow as usize)?,
                RandFloat => {
                    let spills = self.spill_live()?;
                    self.mov_imm_reg(super::mathfn::rand as usize as i64, GpReg::Rax);
                    self.call_reg(GpReg::Rax);
                    self.restore_live(&spills);
                    let dest = self.get_xmm()?;
                    self.movsd_xreg_xreg(XmmReg::Xmm0, dest);
                    self.working.push_front(Operand::RegFloat(dest));
                }

                I2F => {
                    let op = self.pop_working()?;
                    if let Operand::ImmInt(v) = op {
                        let index = self.intern_float(v as f64)?;
                        self.working.push_front(Operand::ImmFloat(index));
                    } else {
                        let src = self.materialize_int(op)?;
                        let dest = self.get_xmm()?;
                        self.cvtsi2sd(src, dest);
                        self.gp.release(src);
                        self.working.push_front(Operand::RegFloat(dest));
                    }
                }
                F2I => {
                    let op = self.pop_working()?;
                    if let Operand::ImmFloat(index) = op {
                        let value = self.floats[index] as i64;
                        self.working.push_front(Operand::ImmInt(value));
                    } else {
                        let src = self.materialize_float(op)?;
                        let dest = self.get_reg()?;
                        self.cvttsd2si(src, dest);
                        self.xmm.release(src);
                        self.working.push_front(Operand::RegInt(dest));
                    }
                }

                S2I => {
                    self.stack_callback(instr, 2)?;
                    self.pull_int_result()?;
                }
                S2F => {
                    self.stack_callback(instr, 1)?;
                    self.pull_float_result()?;
                }
                I2S => self.stack_callback(instr, 3)?,
                F2S => self.stack_callback(instr, 2)?,

                SwapInt => {
                    if self.working.len() < 2 {
                        return Err(JitError::StackShape);
                    }
                    self.working.swap(0, 1);
                }
                PopInt | PopFloat => {
                    if let Some(op) = self.working.pop_front() {
                        self.release_op(op);
                    } else {
                        self.mov_mem_reg(STACK_POS, GpReg::Rbp, GpReg::Rdx);
                        self.dec_mem(0, GpReg::Rdx);
                    }
                }

                NewByteAry | NewCharAry | NewIntAry | NewFloatAry => {
                    self.stack_callback(instr, instr.operand())?;
                    self.pull_int_result()?;
                }
                NewObjInst | NewFuncInst => {
                    self.stack_callback(instr, 0)?;
                    self.pull_int_result()?;
                }

                LoadByteAryElm => self.process_load_elem(instr, ElemKind::Byte)?,
                LoadCharAryElm => self.process_load_elem(instr, ElemKind::Char)?,
                LoadIntAryElm => self.process_load_elem(instr, ElemKind::Int)?,
                LoadFloatAryElm => self.process_load_elem(instr, ElemKind::Float)?,
                StorByteAryElm => self.process_store_elem(instr, ElemKind::Byte)?,
                StorCharAryElm => self.process_store_elem(instr, ElemKind::Char)?,
                StorIntAryElm => self.process_store_elem(instr, ElemKind::Int)?,
                StorFloatAryElm => self.process_store_elem(instr, ElemKind::Float)?,

                LoadArySize => {
                    let op = self.pop_working()?;
                    let arr = self.materialize_int(op)?;
                    self.nil_check(arr);
                    self.mov_mem_reg(0, arr, arr);
                    self.working.push_front(Operand::RegInt(arr));
                }

                CpyByteAry | CpyCharAry | CpyIntAry | CpyFloatAry => {
                    self.stack_callback(instr, 5)?;
                    self.pull_int_result()?;
                }

                ObjTypeOf => {
                    self.stack_callback(instr, 1)?;
                    self.pull_int_result()?;
                }
                ObjInstCast => {
                    self.stack_callback(instr, 1)?;
                    self.pull_int_result()?;
                }

                Jmp => self.process_jump(instr)?,
                Lbl | EndStmts => {
                    if !self.working.is_empty() {
                        return Err(JitError::StackShape);
                    }
                }

                Rtrn => {
                    self.flush_to_op_stack(-1);
                    self.mov_imm_reg(super::STATUS_OK, GpReg::Rax);
                    let pos = self.jmp32();
                    self.epilog_patches.push(pos);
                }

                MthdCall => {
                    let program = crate::program::Program::global();
                    let called = program
                        .class(instr.operand())
                        .and_then(|c| c.method(instr.operand2()))
                        .ok_or(JitError::Unsupported(MthdCall))?;
                    self.stack_callback(instr, called.param_count() as i64 + 1)?;
                    self.pull_result(called.rtrn_type())?;
                }
                DynMthdCall => {
                    // argument slots plus the packed pair and the receiver
                    self.stack_callback(instr, instr.operand() + 2)?;
                    self.pull_result(ValueKind::from_i64(instr.operand2()))?;
                }

                ThreadJoin => self.stack_callback(instr, 0)?,
                ThreadSleep => self.stack_callback(instr, 1)?,
                ThreadMutex => self.stack_callback(instr, 0)?,
                CriticalStart => self.stack_callback(instr, 1)?,
                CriticalEnd => self.stack_callback(instr, 1)?,

                Trap => self.stack_callback(instr, instr.operand2())?,
                TrapRtrn => {
                    self.stack_callback(instr, instr.operand2())?;
                    self.pull_int_result()?;
                }

                // per-thread state the bridge cannot reconstruct
                AsyncMthdCall | DllLoad | DllUnload | DllFuncCall => {
                    return Err(JitError::Unsupported(instr.opcode()));
                }
            }
        }
        Ok(())
    }

    // ---- loads, stores, copies -------------------------------------------

    fn process_load(&mut self, instr: &Instruction) -> Result<(), JitError> {
        let operand = instr.operand();
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => match instr.opcode() {
                Opcode::LoadIntVar => {
                    self.working.push_front(Operand::MemInt(self.local_offset(operand)));
                }
                Opcode::LoadFloatVar => {
                    self.working.push_front(Operand::MemFloat(self.local_offset(operand)));
                }
                Opcode::LoadFuncVar => {
                    self.working.push_front(Operand::MemInt(self.local_offset(operand + 1)));
                    self.working.push_front(Operand::MemInt(self.local_offset(operand)));
                }
                other => return Err(JitError::Unsupported(other)),
            },
            MemRef::Inst | MemRef::Cls => {
                let addr_op = self.pop_working()?;
                let addr = self.materialize_int(addr_op)?;
                self.nil_check(addr);
                // instance/class offsets index from the object base
                let disp = (operand * 8) as i32;
                match instr.opcode() {
                    Opcode::LoadIntVar => {
                        self.mov_mem_reg(disp, addr, addr);
                        self.working.push_front(Operand::RegInt(addr));
                    }
                    Opcode::LoadFloatVar => {
                        let dest = self.get_xmm()?;
                        self.movsd_mem_xreg(disp, addr, dest);
                        self.gp.release(addr);
                        self.working.push_front(Operand::RegFloat(dest));
                    }
                    Opcode::LoadFuncVar => {
                        let second = self.get_reg()?;
                        self.mov_mem_reg(disp + 8, addr, second);
                        self.mov_mem_reg(disp, addr, addr);
                        self.working.push_front(Operand::RegInt(second));
                        self.working.push_front(Operand::RegInt(addr));
                    }
                    other => return Err(JitError::Unsupported(other)),
                }
            }
        }
        Ok(())
    }

    fn store_int_to(&mut self, value: Operand, disp: i32, base: GpReg) -> Result<(), JitError> {
        match value {
            Operand::ImmInt(v) => {
                if let Ok(imm) = i32::try_from(v) {
                    self.mov_imm_mem(imm, disp, base);
                } else {
                    let reg = self.materialize_int(value)?;
                    self.mov_reg_mem(reg, disp, base);
                    self.gp.release(reg);
                }
            }
            _ => {
                let reg = self.materialize_int(value)?;
                self.mov_reg_mem(reg, disp, base);
                self.gp.release(reg);
            }
        }
        Ok(())
    }

    fn store_float_to(&mut self, value: Operand, disp: i32, base: GpReg) -> Result<(), JitError> {
        match value {
            Operand::ImmFloat(index) => {
                let bits = self.floats[index].to_bits() as i64;
                self.mov_imm_reg(bits, GpReg::Rax);
                self.mov_reg_mem(GpReg::Rax, disp, base);
            }
            _ => {
                let reg = self.materialize_float(value)?;
                self.movsd_xreg_mem(reg, disp, base);
                self.xmm.release(reg);
            }
        }
        Ok(())
    }

    fn process_store(&mut self, instr: &Instruction) -> Result<(), JitError> {
        let operand = instr.operand();
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => match instr.opcode() {
                Opcode::StorIntVar | Opcode::CopyIntVar => {
                    let value = self.pop_working()?;
                    self.store_int_to(value, self.local_offset(operand), GpReg::Rbp)
                }
                Opcode::StorFloatVar => {
                    let value = self.pop_working()?;
                    self.store_float_to(value, self.local_offset(operand), GpReg::Rbp)
                }
                Opcode::StorFuncVar => {
                    let first = self.pop_working()?;
                    let second = self.pop_working()?;
                    self.store_int_to(first, self.local_offset(operand), GpReg::Rbp)?;
                    self.store_int_to(second, self.local_offset(operand + 1), GpReg::Rbp)
                }
                other => Err(JitError::Unsupported(other)),
            },
            MemRef::Inst | MemRef::Cls => {
                let addr_op = self.pop_working()?;
                let addr = self.materialize_int(addr_op)?;
                self.nil_check(addr);
                let disp = (operand * 8) as i32;
                let result = match instr.opcode() {
                    Opcode::StorIntVar | Opcode::CopyIntVar => {
                        let value = self.pop_working()?;
                        self.store_int_to(value, disp, addr)
                    }
                    Opcode::StorFloatVar => {
                        let value = self.pop_working()?;
                        self.store_float_to(value, disp, addr)
                    }
                    Opcode::StorFuncVar => {
                        let first = self.pop_working()?;
                        let second = self.pop_working()?;
                        self.store_int_to(first, disp, addr)?;
                        self.store_int_to(second, disp + 8, addr)
                    }
                    other => Err(JitError::Unsupported(other)),
                };
                self.gp.release(addr);
                result
            }
        }
    }

    fn process_copy(&mut self, instr: &Instruction) -> Result<(), JitError> {
        let operand = instr.operand();
        match MemRef::from_i64(instr.operand2()) {
            MemRef::Local => {
                let value = *self.working.front().ok_or(JitError::StackShape)?;
                match instr.opcode() {
                    Opcode::CopyIntVar => {
                        match value {
                            Operand::ImmInt(_) => {
                                self.store_int_to(value, self.local_offset(operand), GpReg::Rbp)?
                            }
                            _ => {
                                let reg = self.materialize_int(value)?;
                                self.mov_reg_mem(reg, self.local_offset(operand), GpReg::Rbp);
                                self.working[0] = Operand::RegInt(reg);
                            }
                        }
                        Ok(())
                    }
                    Opcode::CopyFloatVar => {
                        match value {
                            Operand::ImmFloat(_) => {
                                self.store_float_to(value, self.local_offset(operand), GpReg::Rbp)?
                            }
                            _ => {
                                let reg = self.materialize_float(value)?;
                                self.movsd_xreg_mem(reg, self.local_offset(operand), GpReg::Rbp);
                                self.working[0] = Operand::RegFloat(reg);
                            }
                        }
                        Ok(())
                    }
                    other => Err(JitError::Unsupported(other)),
                }
            }
            MemRef::Inst | MemRef::Cls => {
                let addr_op = self.pop_working()?;
                let addr = self.materialize_int(addr_op)?;
                self.nil_check(addr);
                let disp = (operand * 8) as i32;
                let value = *self.working.front().ok_or(JitError::StackShape)?;
                match instr.opcode() {
                    Opcode::CopyIntVar => match value {
                        Operand::ImmInt(_) => self.store_int_to(value, disp, addr)?,
                        _ => {
                            let reg = self.materialize_int(value)?;
                            self.mov_reg_mem(reg, disp, addr);
                            self.working[0] = Operand::RegInt(reg);
                        }
                    },
                    Opcode::CopyFloatVar => match value {
                        Operand::ImmFloat(_) => self.store_float_to(value, disp, addr)?,
                        _ => {
                            let reg = self.materialize_float(value)?;
                            self.movsd_xreg_mem(reg, disp, addr);
                            self.working[0] = Operand::RegFloat(reg);
                        }
                    },
                    other => return Err(JitError::Unsupported(other)),
                }
                self.gp.release(addr);
                Ok(())
            }
        }
    }

    // ---- integer arithmetic ----------------------------------------------

    fn process_int_arith(
        &mut self,
        op_rr: u8,
        op_rm: u8,
        ext: u8,
        fold: fn(i64, i64) -> i64,
    ) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmInt(l), Operand::ImmInt(r)) = (left, right) {
            self.working.push_front(Operand::ImmInt(fold(l, r)));
            return Ok(());
        }

        let dest = self.materialize_int(left)?;
        match right {
            Operand::ImmInt(v) => {
                if let Ok(imm) = i32::try_from(v) {
                    self.alu_imm_reg(ext, imm, dest);
                } else {
                    let reg = self.materialize_int(right)?;
                    self.alu_reg_reg(op_rr, reg, dest);
                    self.gp.release(reg);
                }
            }
            Operand::MemInt(off) => self.alu_mem_reg(op_rm, off, GpReg::Rbp, dest),
            _ => {
                let reg = self.materialize_int(right)?;
                self.alu_reg_reg(op_rr, reg, dest);
                self.gp.release(reg);
            }
        }
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    fn process_int_mul(&mut self) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmInt(l), Operand::ImmInt(r)) = (left, right) {
            self.working.push_front(Operand::ImmInt(l.wrapping_mul(r)));
            return Ok(());
        }

        let dest = self.materialize_int(left)?;
        match right {
            Operand::MemInt(off) => self.imul_mem_reg(off, GpReg::Rbp, dest),
            _ => {
                let reg = self.materialize_int(right)?;
                self.imul_reg_reg(reg, dest);
                self.gp.release(reg);
            }
        }
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    fn process_int_div(&mut self, modulo: bool) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmInt(l), Operand::ImmInt(r)) = (left, right) {
            if r != 0 {
                let value = if modulo { l.wrapping_rem(r) } else { l.wrapping_div(r) };
                self.working.push_front(Operand::ImmInt(value));
                return Ok(());
            }
            // constant zero divisor still fails at run time
            let pos = self.jmp32();
            self.div_zero_patches.push(pos);
            self.working.push_front(Operand::ImmInt(0));
            return Ok(());
        }

        let dest = self.materialize_int(left)?;
        let divisor = self.materialize_int(right)?;
        self.alu_imm_reg(EXT_CMP, 0, divisor);
        let pos = self.jcc32(CC_E);
        self.div_zero_patches.push(pos);

        self.mov_reg_reg(dest, GpReg::Rax);
        self.cqo();
        self.idiv_reg(divisor);
        if modulo {
            self.mov_reg_reg(GpReg::Rdx, dest);
        } else {
            self.mov_reg_reg(GpReg::Rax, dest);
        }
        self.gp.release(divisor);
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    fn process_logical(&mut self, and: bool) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmInt(l), Operand::ImmInt(r)) = (left, right) {
            let value = if and {
                (l != 0 && r != 0) as i64
            } else {
                (l != 0 || r != 0) as i64
            };
            self.working.push_front(Operand::ImmInt(value));
            return Ok(());
        }

        let l = self.materialize_int(left)?;
        let r = self.materialize_int(right)?;
        self.alu_imm_reg(EXT_CMP, 0, l);
        self.setcc_al(CC_NE);
        self.alu_imm_reg(EXT_CMP, 0, r);
        self.setcc_dl(CC_NE);
        if and {
            self.and_al_dl();
        } else {
            self.or_al_dl();
        }
        self.movzx8_al_reg(l);
        self.gp.release(r);
        self.working.push_front(Operand::RegInt(l));
        Ok(())
    }

    fn process_shift(&mut self, ext: u8) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmInt(l), Operand::ImmInt(r)) = (left, right) {
            let amount = (r & 63) as u32;
            let value = if ext == EXT_SHL {
                l.wrapping_shl(amount)
            } else {
                l.wrapping_shr(amount)
            };
            self.working.push_front(Operand::ImmInt(value));
            return Ok(());
        }

        let dest = self.materialize_int(left)?;
        match right {
            Operand::ImmInt(v) => self.shift_imm_reg(ext, (v & 63) as u8, dest),
            _ => {
                let count = self.materialize_int(right)?;
                if count == GpReg::Rcx {
                    self.shift_cl_reg(ext, dest);
                } else if dest == GpReg::Rcx {
                    self.mov_reg_reg(dest, GpReg::Rax);
                    self.mov_reg_reg(count, GpReg::Rcx);
                    self.shift_cl_reg(ext, GpReg::Rax);
                    self.mov_reg_reg(GpReg::Rax, dest);
                } else {
                    // rcx may be live in another operand
                    self.mov_reg_reg(GpReg::Rcx, GpReg::Rax);
                    self.mov_reg_reg(count, GpReg::Rcx);
                    self.shift_cl_reg(ext, dest);
                    self.mov_reg_reg(GpReg::Rax, GpReg::Rcx);
                }
                self.gp.release(count);
            }
        }
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    // ---- comparisons and branches ----------------------------------------

    fn process_int_cmp(&mut self, cc: u8, fold: fn(i64, i64) -> bool) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmInt(l), Operand::ImmInt(r)) = (left, right) {
            self.working.push_front(Operand::ImmInt(fold(l, r) as i64));
            return Ok(());
        }

        let dest = self.materialize_int(left)?;
        match right {
            Operand::ImmInt(v) if i32::try_from(v).is_ok() => {
                self.alu_imm_reg(EXT_CMP, v as i32, dest);
            }
            Operand::MemInt(off) => self.alu_mem_reg(ALUM_CMP, off, GpReg::Rbp, dest),
            _ => {
                let reg = self.materialize_int(right)?;
                self.alu_reg_reg(ALU_CMP, reg, dest);
                self.gp.release(reg);
            }
        }

        if self.fuse_branch(cc)? {
            self.gp.release(dest);
            return Ok(());
        }

        self.mov_imm_reg(0, dest);
        self.mov_imm_reg(1, GpReg::Rax);
        self.cmov(cc, GpReg::Rax, dest);
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    /// If the next instruction is a conditional jump on this comparison's
    /// result, emit the fused `jcc` and consume it. Flags must already be
    /// set.
    fn fuse_branch(&mut self, cc: u8) -> Result<bool, JitError> {
        let next_index = self.instr_index;
        let Some(next) = self.method.instructions().get(next_index) else {
            return Ok(false);
        };
        if next.opcode() != Opcode::Jmp || next.operand2() < 0 {
            return Ok(false);
        }
        if !self.working.is_empty() {
            return Err(JitError::StackShape);
        }

        // jump taken when the popped value equals operand2
        let cc = if next.operand2() == 1 { cc } else { cc ^ 1 };
        let pos = self.jcc32(cc);
        self.jump_patches.push(JumpPatch {
            pos,
            label: next.operand(),
        });
        self.instr_offsets[next_index] = self.code.len();
        self.instr_index += 1;
        Ok(true)
    }

    fn process_float_cmp(&mut self, opcode: Opcode) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmFloat(li), Operand::ImmFloat(ri)) = (left, right) {
            let (l, r) = (self.floats[li], self.floats[ri]);
            let value = match opcode {
                Opcode::LesFloat => l < r,
                Opcode::GtrFloat => l > r,
                Opcode::LesEqlFloat => l <= r,
                Opcode::GtrEqlFloat => l >= r,
                Opcode::EqlFloat => l == r,
                Opcode::NeqlFloat => l != r,
                _ => return Err(JitError::Unsupported(opcode)),
            };
            self.working.push_front(Operand::ImmInt(value as i64));
            return Ok(());
        }

        let lx = self.materialize_float(left)?;
        let rx = self.materialize_float(right)?;
        let dest = self.get_reg()?;

        match opcode {
            // the operand order makes every unordered comparison false
            Opcode::LesFloat => {
                self.comisd(rx, lx);
                self.mov_imm_reg(0, dest);
                self.mov_imm_reg(1, GpReg::Rax);
                self.cmov(CC_A, GpReg::Rax, dest);
            }
            Opcode::LesEqlFloat => {
                self.comisd(rx, lx);
                self.mov_imm_reg(0, dest);
                self.mov_imm_reg(1, GpReg::Rax);
                self.cmov(CC_AE, GpReg::Rax, dest);
            }
            Opcode::GtrFloat => {
                self.comisd(lx, rx);
                self.mov_imm_reg(0, dest);
                self.mov_imm_reg(1, GpReg::Rax);
                self.cmov(CC_A, GpReg::Rax, dest);
            }
            Opcode::GtrEqlFloat => {
                self.comisd(lx, rx);
                self.mov_imm_reg(0, dest);
                self.mov_imm_reg(1, GpReg::Rax);
                self.cmov(CC_AE, GpReg::Rax, dest);
            }
            Opcode::EqlFloat => {
                self.comisd(lx, rx);
                self.setcc_al(CC_E);
                self.setcc_dl(CC_NP);
                self.and_al_dl();
                self.movzx8_al_reg(dest);
            }
            Opcode::NeqlFloat => {
                self.comisd(lx, rx);
                self.setcc_al(CC_NE);
                self.setcc_dl(CC_P);
                self.or_al_dl();
                self.movzx8_al_reg(dest);
            }
            other => return Err(JitError::Unsupported(other)),
        }

        self.xmm.release(lx);
        self.xmm.release(rx);
        self.working.push_front(Operand::RegInt(dest));
        Ok(())
    }

    fn process_jump(&mut self, instr: &Instruction) -> Result<(), JitError> {
        if instr.operand2() < 0 {
            if !self.working.is_empty() {
                return Err(JitError::StackShape);
            }
            let pos = self.jmp32();
            self.jump_patches.push(JumpPatch {
                pos,
                label: instr.operand(),
            });
            return Ok(());
        }

        let cond = self.pop_working()?;
        if !self.working.is_empty() {
            return Err(JitError::StackShape);
        }
        match cond {
            Operand::ImmInt(v) => {
                if v == instr.operand2() {
                    let pos = self.jmp32();
                    self.jump_patches.push(JumpPatch {
                        pos,
                        label: instr.operand(),
                    });
                }
            }
            other => {
                let reg = self.materialize_int(other)?;
                self.alu_imm_reg(EXT_CMP, instr.operand2() as i32, reg);
                let pos = self.jcc32(CC_E);
                self.jump_patches.push(JumpPatch {
                    pos,
                    label: instr.operand(),
                });
                self.gp.release(reg);
            }
        }
        Ok(())
    }

    // ---- floats ----------------------------------------------------------

    fn process_float_arith(&mut self, op: u8, fold: fn(f64, f64) -> f64) -> Result<(), JitError> {
        let left = self.pop_working()?;
        let right = self.pop_working()?;

        if let (Operand::ImmFloat(li), Operand::ImmFloat(ri)) = (left, right) {
            let value = fold(self.floats[li], self.floats[ri]);
            let index = self.intern_float(value)?;
            self.working.push_front(Operand::ImmFloat(index));
            return Ok(());
        }

        let dest = self.materialize_float(left)?;
        match right {
            Operand::MemFloat(off) => {
                self.sse_mem(0xF2, op, dest.enc(), GpReg::Rbp.enc(), off, false);
            }
            _ => {
                let reg = self.materialize_float(right)?;
                self.sse_arith(op, reg, dest);
                self.xmm.release(reg);
            }
        }
        self.working.push_front(Operand::RegFloat(dest));
        Ok(())
    }

    fn process_round(&mut self, mode: u8) -> Result<(), JitError> {
        let op = self.pop_working()?;
        if let Operand::ImmFloat(index) = op {
            let v = self.floats[index];
            let rounded = if mode == 1 { v.floor() } else { v.ceil() };
            let interned = self.intern_float(rounded)?;
            self.working.push_front(Operand::ImmFloat(interned));
            return Ok(());
        }
        let reg = self.materialize_float(op)?;
        self.roundsd(reg, reg, mode);
        self.working.push_front(Operand::RegFloat(reg));
        Ok(())
    }

    fn process_math1(&mut self, addr: usize) -> Result<(), JitError> {
        let op = self.pop_working()?;
        self.math_call(addr, &[op])
    }

    fn process_math2(&mut self, addr: usize) -> Result<(), JitError> {
        let right = self.pop_working()?;
        let left = self.pop_working()?;
        self.math_call(addr, &[left, right])
    }

    // ---- arrays ----------------------------------------------------------

    /// Lower the row-major index rule over the working-stack index operands,
    /// leaving the linear element index in the returned register.
    fn compute_index(&mut self, arr: GpReg, dim: i64) -> Result<GpReg, JitError> {
        let first = self.pop_working()?;
        let idx = self.materialize_int(first)?;
        for k in 1..dim {
            self.imul_mem_reg(((2 + k) * 8) as i32, arr, idx);
            let next = self.pop_working()?;
            match next {
                Operand::ImmInt(v) if i32::try_from(v).is_ok() => {
                    self.alu_imm_reg(EXT_ADD, v as i32, idx);
                }
                Operand::MemInt(off) => self.alu_mem_reg(ALUM_ADD, off, GpReg::Rbp, idx),
                _ => {
                    let reg = self.materialize_int(next)?;
                    self.alu_reg_reg(ALU_ADD, reg, idx);
                    self.gp.release(reg);
                }
            }
        }
        Ok(idx)
    }

    fn bounds_check(&mut self, idx: GpReg, arr: GpReg) {
        self.alu_imm_reg(EXT_CMP, 0, idx);
        let low = self.jcc32(CC_L);
        self.lower_patches.push(low);
        self.alu_mem_reg(ALUM_CMP, 0, arr, idx);
        let high = self.jcc32(CC_GE);
        self.upper_patches.push(high);
    }

    /// Scale the checked index and fold in the array base, leaving the
    /// payload-relative element address in `idx`.
    fn element_address(&mut self, idx: GpReg, arr: GpReg, kind: ElemKind) {
        match kind {
            ElemKind::Byte => {}
            ElemKind::Char => self.shift_imm_reg(EXT_SHL, 2, idx),
            ElemKind::Int | ElemKind::Float => self.shift_imm_reg(EXT_SHL, 3, idx),
        }
        self.alu_reg_reg(ALU_ADD, arr, idx);
    }

    fn process_load_elem(&mut self, instr: &Instruction, kind: ElemKind) -> Result<(), JitError> {
        let arr_op = self.pop_working()?;
        let arr = self.materialize_int(arr_op)?;
        self.nil_check(arr);
        let idx = self.compute_index(arr, instr.operand())?;
        self.bounds_check(idx, arr);
        self.element_address(idx, arr, kind);
        let payload = ((2 + instr.operand()) * 8) as i32;

        match kind {
            ElemKind::Byte => {
                self.movzx8_mem_reg(payload, idx, idx);
                self.gp.release(arr);
                self.working.push_front(Operand::RegInt(idx));
            }
            ElemKind::Char => {
                self.mov32_mem_reg(payload, idx, idx);
                self.gp.release(arr);
                self.working.push_front(Operand::RegInt(idx));
            }
            ElemKind::Int => {
                self.mov_mem_reg(payload, idx, idx);
                self.gp.release(arr);
                self.working.push_front(Operand::RegInt(idx));
            }
            ElemKind::Float => {
                let dest = self.get_xmm()?;
                self.movsd_mem_xreg(payload, idx, dest);
                self.gp.release(arr);
                self.gp.release(idx);
                self.working.push_front(Operand::RegFloat(dest));
            }
        }
        Ok(())
    }

    fn process_store_elem(&mut self, instr: &Instruction, kind: ElemKind) -> Result<(), JitError> {
        let arr_op = self.pop_working()?;
        let arr = self.materialize_int(arr_op)?;
        self.nil_check(arr);
        let idx = self.compute_index(arr, instr.operand())?;
        self.bounds_check(idx, arr);
        self.element_address(idx, arr, kind);
        self.gp.release(arr);
        let payload = ((2 + instr.operand()) * 8) as i32;

        let value = self.pop_working()?;
        match kind {
            ElemKind::Byte => {
                let reg = self.materialize_int(value)?;
                self.mov_reg8_mem(reg, payload, idx);
                self.gp.release(reg);
            }
            ElemKind::Char => {
                let reg = self.materialize_int(value)?;
                self.mov32_reg_mem(reg, payload, idx);
                self.gp.release(reg);
            }
            ElemKind::Int => self.store_int_to(value, payload, idx)?,
            ElemKind::Float => self.store_float_to(value, payload, idx)?,
        }
        self.gp.release(idx);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElemKind {
    Byte,
    Char,
    Int,
    Float,
}
