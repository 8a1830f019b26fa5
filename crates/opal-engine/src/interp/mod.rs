//! Stack interpreter
//!
//! A switch-dispatch execution engine over the installed program image.
//! Each interpreter owns one thread's call stack and current-frame cell;
//! the operand stack is passed in so native code, trap handlers, and
//! re-entrant interpreters all mutate the same slots.
//!
//! Two construction modes mirror the two ways execution enters the loop:
//! [`Interpreter::new`] owns its call stack and registers a frame monitor
//! with the memory interface (thread entry points), while
//! [`Interpreter::with_stack`] borrows the stacks of a suspended native
//! caller (the JIT callback bridge). When a frame marked `jit_called`
//! unwinds, the loop returns so the native caller resumes.

pub(crate) mod arrays;
pub(crate) mod calls;
pub(crate) mod concurrency;
pub(crate) mod convert;
pub(crate) mod native;
pub(crate) mod objects;
mod variables;

pub use calls::dispatch_cache_stats;
pub use native::LIB_PATH_ENV;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::frame::{Frame, FrameMonitor, FramePool, CALL_STACK_SIZE};
use crate::memory::MemoryManager;
use crate::program::{Instruction, Method, Opcode, Program};
use crate::stack::{pop_float, pop_int, push_float, push_int, swap_int};
use crate::trap::TrapProcessor;
use crate::{VmError, VmResult};

/// Runtime configuration, fixed for the life of the process. The first
/// reader freezes the defaults if nothing was configured.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Compile methods on first call where the platform supports it.
    pub jit: bool,
    /// Raise the halt flag on fatal errors instead of exiting the process
    /// (the debugger build's behavior).
    pub halt_on_error: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            jit: cfg!(all(target_arch = "x86_64", unix)),
            halt_on_error: false,
        }
    }
}

static OPTIONS: OnceCell<VmOptions> = OnceCell::new();

/// Install runtime options. Only the first call takes effect.
pub fn configure(options: VmOptions) {
    let _ = OPTIONS.set(options);
}

pub(crate) fn options() -> &'static VmOptions {
    OPTIONS.get_or_init(VmOptions::default)
}

/// Per-instruction hook consumed by the source-level debugger.
pub trait InstructionHook: Send {
    /// Invoked before each dispatch with the instruction, its index, and
    /// the current call depth.
    fn on_instruction(&mut self, instr: &Instruction, ip: i64, call_depth: i64);
}

// Halt flags of every live interpreter, for coordinated shutdown.
static INTERPRETERS: Lazy<Mutex<Vec<Arc<AtomicBool>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Request every registered interpreter to stop. Each exits its dispatch
/// loop after the instruction it is currently executing.
pub fn halt_all() {
    for flag in INTERPRETERS.lock().iter() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Number of registered interpreters.
pub fn interpreter_count() -> usize {
    INTERPRETERS.lock().len()
}

struct OwnedStack {
    call_stack: Box<[*mut Frame]>,
    call_stack_pos: Box<i64>,
    monitor: Box<FrameMonitor>,
}

enum Flow {
    Continue,
    Exit,
}

/// One thread's execution engine.
pub struct Interpreter {
    call_stack: *mut *mut Frame,
    call_stack_pos: *mut i64,
    // current-frame cell; boxed so the frame monitor can hold its address
    frame: Box<*mut Frame>,
    halt: Arc<AtomicBool>,
    hook: Option<Box<dyn InstructionHook>>,
    owned: Option<OwnedStack>,
}

impl Interpreter {
    /// An interpreter owning a fresh call stack, registered for
    /// coordinated halt and root walking.
    pub fn new() -> Self {
        let mut call_stack =
            vec![std::ptr::null_mut::<Frame>(); CALL_STACK_SIZE].into_boxed_slice();
        let mut call_stack_pos = Box::new(0i64);
        let mut frame = Box::new(std::ptr::null_mut::<Frame>());

        let call_stack_ptr = call_stack.as_mut_ptr();
        let call_stack_pos_ptr: *mut i64 = &mut *call_stack_pos;
        let cur_frame_ptr: *mut *mut Frame = &mut *frame;

        let monitor = Box::new(FrameMonitor {
            call_stack: call_stack_ptr,
            call_stack_pos: call_stack_pos_ptr,
            cur_frame: cur_frame_ptr,
        });
        MemoryManager::register_monitor(&*monitor);

        let halt = Arc::new(AtomicBool::new(false));
        INTERPRETERS.lock().push(halt.clone());

        Self {
            call_stack: call_stack_ptr,
            call_stack_pos: call_stack_pos_ptr,
            frame,
            halt,
            hook: None,
            owned: Some(OwnedStack {
                call_stack,
                call_stack_pos,
                monitor,
            }),
        }
    }

    /// An interpreter borrowing a suspended caller's call stack, used by
    /// the native callback bridge for re-entrant calls.
    pub fn with_stack(call_stack: *mut *mut Frame, call_stack_pos: *mut i64) -> Self {
        Self {
            call_stack,
            call_stack_pos,
            frame: Box::new(std::ptr::null_mut()),
            halt: Arc::new(AtomicBool::new(false)),
            hook: None,
            owned: None,
        }
    }

    /// Install the per-instruction debugger hook.
    pub fn set_hook(&mut self, hook: Box<dyn InstructionHook>) {
        self.hook = Some(hook);
    }

    /// This interpreter's halt flag.
    pub fn halt_flag(&self) -> Arc<AtomicBool> {
        self.halt.clone()
    }

    #[inline(always)]
    pub(crate) fn cur(&self) -> *mut Frame {
        *self.frame
    }

    fn set_cur(&mut self, frame: *mut Frame) {
        *self.frame = frame;
    }

    pub(crate) fn frame_cell(&mut self) -> &mut *mut Frame {
        &mut *self.frame
    }

    pub(crate) fn call_stack_ptr(&self) -> *mut *mut Frame {
        self.call_stack
    }

    pub(crate) fn call_stack_pos_ptr(&self) -> *mut i64 {
        self.call_stack_pos
    }

    pub(crate) unsafe fn push_frame(&mut self, frame: *mut Frame) -> VmResult<()> {
        if *self.call_stack_pos >= CALL_STACK_SIZE as i64 {
            return Err(VmError::CallStackBounds);
        }
        *self.call_stack.add(*self.call_stack_pos as usize) = frame;
        *self.call_stack_pos += 1;
        Ok(())
    }

    pub(crate) unsafe fn pop_frame(&mut self) -> VmResult<*mut Frame> {
        if *self.call_stack_pos <= 0 {
            return Err(VmError::CallStackBounds);
        }
        *self.call_stack_pos -= 1;
        Ok(*self.call_stack.add(*self.call_stack_pos as usize))
    }

    pub(crate) unsafe fn stack_empty(&self) -> bool {
        *self.call_stack_pos == 0
    }

    /// Execute `method` until the call stack empties or a frame entered
    /// from native code unwinds.
    ///
    /// Fatal runtime errors print an unwound call trace and terminate the
    /// process, or raise the halt flag under the halt-on-error option.
    pub fn execute(
        &mut self,
        op_stack: *mut usize,
        stack_pos: *mut i64,
        start_ip: i64,
        method: &'static Method,
        receiver: *mut usize,
        from_jit: bool,
    ) {
        unsafe {
            if self.owned.is_some() {
                *self.call_stack_pos = 0;
            }
            let frame = FramePool::acquire(method, receiver);
            (*frame).jit_called = from_jit;
            self.set_cur(frame);

            self.halt.store(false, Ordering::SeqCst);
            let mut ip = start_ip.max(0);

            loop {
                if self.halt.load(Ordering::SeqCst) {
                    return;
                }
                let frame = self.cur();
                let method = (*frame).method();
                let instrs = method.instructions();
                if ip < 0 || ip as usize >= instrs.len() {
                    self.fail(
                        VmError::Runtime("instruction pointer out of bounds".to_string()),
                        ip,
                    );
                    return;
                }
                let instr = &instrs[ip as usize];
                ip += 1;

                if let Some(hook) = self.hook.as_mut() {
                    hook.on_instruction(instr, ip - 1, *self.call_stack_pos);
                }

                match self.step(instr, &mut ip, op_stack, stack_pos) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Exit) => return,
                    Err(err) => {
                        self.fail(err, ip);
                        return;
                    }
                }
            }
        }
    }

    unsafe fn step(
        &mut self,
        instr: &'static Instruction,
        ip: &mut i64,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<Flow> {
        match instr.opcode() {
            // literals
            Opcode::LoadIntLit | Opcode::LoadCharLit => {
                push_int(instr.operand() as usize, op_stack, stack_pos);
            }
            Opcode::LoadFloatLit => push_float(instr.float_operand(), op_stack, stack_pos),
            Opcode::LoadInstMem => {
                push_int((*self.cur()).mem[0], op_stack, stack_pos);
            }
            Opcode::LoadClsMem => {
                let method = (*self.cur()).method();
                let mem = Program::global()
                    .class(method.cls_id())
                    .map(|c| c.class_memory())
                    .unwrap_or(std::ptr::null_mut());
                push_int(mem as usize, op_stack, stack_pos);
            }

            // variables
            Opcode::LoadIntVar => self.load_int_var(instr, op_stack, stack_pos)?,
            Opcode::StorIntVar => self.stor_int_var(instr, op_stack, stack_pos)?,
            Opcode::CopyIntVar => self.copy_int_var(instr, op_stack, stack_pos)?,
            Opcode::LoadFloatVar => self.load_float_var(instr, op_stack, stack_pos)?,
            Opcode::StorFloatVar => self.stor_float_var(instr, op_stack, stack_pos)?,
            Opcode::CopyFloatVar => self.copy_float_var(instr, op_stack, stack_pos)?,
            Opcode::LoadFuncVar => self.load_func_var(instr, op_stack, stack_pos)?,
            Opcode::StorFuncVar => self.stor_func_var(instr, op_stack, stack_pos)?,

            // integer arithmetic; the first pop is the top operand
            Opcode::AddInt => int_binary(op_stack, stack_pos, |l, r| Ok(l.wrapping_add(r)))?,
            Opcode::SubInt => int_binary(op_stack, stack_pos, |l, r| Ok(l.wrapping_sub(r)))?,
            Opcode::MulInt => int_binary(op_stack, stack_pos, |l, r| Ok(l.wrapping_mul(r)))?,
            Opcode::DivInt => int_binary(op_stack, stack_pos, |l, r| {
                if r == 0 {
                    Err(VmError::DivideByZero)
                } else {
                    Ok(l.wrapping_div(r))
                }
            })?,
            Opcode::ModInt => int_binary(op_stack, stack_pos, |l, r| {
                if r == 0 {
                    Err(VmError::DivideByZero)
                } else {
                    Ok(l.wrapping_rem(r))
                }
            })?,
            Opcode::BitAndInt => int_binary(op_stack, stack_pos, |l, r| Ok(l & r))?,
            Opcode::BitOrInt => int_binary(op_stack, stack_pos, |l, r| Ok(l | r))?,
            Opcode::BitXorInt => int_binary(op_stack, stack_pos, |l, r| Ok(l ^ r))?,
            Opcode::AndInt => {
                int_binary(op_stack, stack_pos, |l, r| Ok((l != 0 && r != 0) as i64))?
            }
            Opcode::OrInt => {
                int_binary(op_stack, stack_pos, |l, r| Ok((l != 0 || r != 0) as i64))?
            }
            Opcode::ShlInt => {
                int_binary(op_stack, stack_pos, |l, r| Ok(l.wrapping_shl((r & 63) as u32)))?
            }
            Opcode::ShrInt => {
                int_binary(op_stack, stack_pos, |l, r| Ok(l.wrapping_shr((r & 63) as u32)))?
            }

            // integer comparisons
            Opcode::LesInt => int_binary(op_stack, stack_pos, |l, r| Ok((l < r) as i64))?,
            Opcode::GtrInt => int_binary(op_stack, stack_pos, |l, r| Ok((l > r) as i64))?,
            Opcode::EqlInt => int_binary(op_stack, stack_pos, |l, r| Ok((l == r) as i64))?,
            Opcode::NeqlInt => int_binary(op_stack, stack_pos, |l, r| Ok((l != r) as i64))?,
            Opcode::LesEqlInt => int_binary(op_stack, stack_pos, |l, r| Ok((l <= r) as i64))?,
            Opcode::GtrEqlInt => int_binary(op_stack, stack_pos, |l, r| Ok((l >= r) as i64))?,

            // float arithmetic and comparisons
            Opcode::AddFloat => float_binary(op_stack, stack_pos, |l, r| l + r),
            Opcode::SubFloat => float_binary(op_stack, stack_pos, |l, r| l - r),
            Opcode::MulFloat => float_binary(op_stack, stack_pos, |l, r| l * r),
            Opcode::DivFloat => float_binary(op_stack, stack_pos, |l, r| l / r),
            Opcode::LesFloat => float_compare(op_stack, stack_pos, |l, r| l < r),
            Opcode::GtrFloat => float_compare(op_stack, stack_pos, |l, r| l > r),
            Opcode::EqlFloat => float_compare(op_stack, stack_pos, |l, r| l == r),
            Opcode::NeqlFloat => float_compare(op_stack, stack_pos, |l, r| l != r),
            Opcode::LesEqlFloat => float_compare(op_stack, stack_pos, |l, r| l <= r),
            Opcode::GtrEqlFloat => float_compare(op_stack, stack_pos, |l, r| l >= r),

            // platform math
            Opcode::CeilFloat => float_unary(op_stack, stack_pos, f64::ceil),
            Opcode::FlorFloat => float_unary(op_stack, stack_pos, f64::floor),
            Opcode::SinFloat => float_unary(op_stack, stack_pos, f64::sin),
            Opcode::CosFloat => float_unary(op_stack, stack_pos, f64::cos),
            Opcode::TanFloat => float_unary(op_stack, stack_pos, f64::tan),
            Opcode::AsinFloat => float_unary(op_stack, stack_pos, f64::asin),
            Opcode::AcosFloat => float_unary(op_stack, stack_pos, f64::acos),
            Opcode::AtanFloat => float_unary(op_stack, stack_pos, f64::atan),
            Opcode::LogFloat => float_unary(op_stack, stack_pos, f64::ln),
            Opcode::SqrtFloat => float_unary(op_stack, stack_pos, f64::sqrt),
            Opcode::Atan2Float => {
                let right = pop_float(op_stack, stack_pos);
                let left = pop_float(op_stack, stack_pos);
                push_float(left.atan2(right), op_stack, stack_pos);
            }
            Opcode::PowFloat => {
                let right = pop_float(op_stack, stack_pos);
                let left = pop_float(op_stack, stack_pos);
                push_float(left.powf(right), op_stack, stack_pos);
            }
            Opcode::RandFloat => {
                push_float(rand::random::<f64>(), op_stack, stack_pos);
            }

            // conversions
            Opcode::I2F => {
                let value = pop_int(op_stack, stack_pos) as i64;
                push_float(value as f64, op_stack, stack_pos);
            }
            Opcode::F2I => {
                let value = pop_float(op_stack, stack_pos);
                push_int(value as i64 as usize, op_stack, stack_pos);
            }
            Opcode::S2I => convert::str_to_int(op_stack, stack_pos)?,
            Opcode::S2F => convert::str_to_float(op_stack, stack_pos)?,
            Opcode::I2S => convert::int_to_str(op_stack, stack_pos)?,
            Opcode::F2S => convert::float_to_str(op_stack, stack_pos)?,

            // stack manipulation
            Opcode::SwapInt => swap_int(op_stack, stack_pos),
            Opcode::PopInt => {
                pop_int(op_stack, stack_pos);
            }
            Opcode::PopFloat => {
                pop_float(op_stack, stack_pos);
            }

            // allocation
            Opcode::NewByteAry => arrays::new_array(
                instr.operand(),
                crate::memory::AllocKind::ByteArray,
                op_stack,
                stack_pos,
            )?,
            Opcode::NewCharAry => arrays::new_array(
                instr.operand(),
                crate::memory::AllocKind::CharArray,
                op_stack,
                stack_pos,
            )?,
            Opcode::NewIntAry => arrays::new_array(
                instr.operand(),
                crate::memory::AllocKind::IntArray,
                op_stack,
                stack_pos,
            )?,
            Opcode::NewFloatAry => arrays::new_array(
                instr.operand(),
                crate::memory::AllocKind::FloatArray,
                op_stack,
                stack_pos,
            )?,
            Opcode::NewObjInst => {
                let obj = MemoryManager::allocate_object(instr.operand(), op_stack, *stack_pos);
                push_int(obj as usize, op_stack, stack_pos);
            }
            Opcode::NewFuncInst => {
                arrays::new_func_instance(instr.operand(), op_stack, stack_pos);
            }

            // array access
            Opcode::LoadByteAryElm => arrays::load_byte_elem(instr, op_stack, stack_pos)?,
            Opcode::LoadCharAryElm => arrays::load_char_elem(instr, op_stack, stack_pos)?,
            Opcode::LoadIntAryElm => arrays::load_int_elem(instr, op_stack, stack_pos)?,
            Opcode::LoadFloatAryElm => arrays::load_float_elem(instr, op_stack, stack_pos)?,
            Opcode::StorByteAryElm => arrays::store_byte_elem(instr, op_stack, stack_pos)?,
            Opcode::StorCharAryElm => arrays::store_char_elem(instr, op_stack, stack_pos)?,
            Opcode::StorIntAryElm => arrays::store_int_elem(instr, op_stack, stack_pos)?,
            Opcode::StorFloatAryElm => arrays::store_float_elem(instr, op_stack, stack_pos)?,
            Opcode::LoadArySize => arrays::load_ary_size(op_stack, stack_pos)?,
            Opcode::CpyByteAry => {
                arrays::copy_array(crate::memory::AllocKind::ByteArray, op_stack, stack_pos)?
            }
            Opcode::CpyCharAry => {
                arrays::copy_array(crate::memory::AllocKind::CharArray, op_stack, stack_pos)?
            }
            Opcode::CpyIntAry => {
                arrays::copy_array(crate::memory::AllocKind::IntArray, op_stack, stack_pos)?
            }
            Opcode::CpyFloatAry => {
                arrays::copy_array(crate::memory::AllocKind::FloatArray, op_stack, stack_pos)?
            }

            // type tests
            Opcode::ObjTypeOf => objects::obj_type_of(instr.operand(), op_stack, stack_pos)?,
            Opcode::ObjInstCast => objects::obj_inst_cast(instr.operand(), op_stack, stack_pos)?,

            // control flow
            Opcode::Jmp => self.process_jump(instr, ip, op_stack, stack_pos)?,
            Opcode::Lbl | Opcode::EndStmts => {}

            Opcode::Rtrn => {
                FramePool::release(self.cur());
                if self.stack_empty() {
                    self.set_cur(std::ptr::null_mut());
                    return Ok(Flow::Exit);
                }
                let frame = self.pop_frame()?;
                self.set_cur(frame);
                *ip = (*frame).ip;
                if (*frame).jit_called {
                    (*frame).jit_called = false;
                    FramePool::release(frame);
                    return Ok(Flow::Exit);
                }
            }

            Opcode::MthdCall => {
                self.process_method_call(instr, ip, op_stack, stack_pos)?;
                if self.return_to_jit_caller() {
                    return Ok(Flow::Exit);
                }
            }
            Opcode::DynMthdCall => {
                self.process_dynamic_call(instr, ip, op_stack, stack_pos)?;
                if self.return_to_jit_caller() {
                    return Ok(Flow::Exit);
                }
            }

            // threads
            Opcode::AsyncMthdCall => self.async_mthd_call()?,
            Opcode::ThreadJoin => {
                let inst = (*self.cur()).mem[0] as *mut usize;
                concurrency::join_thread(inst)?;
            }
            Opcode::ThreadSleep => {
                let millis = pop_int(op_stack, stack_pos) as i64;
                concurrency::sleep_millis(millis);
            }
            Opcode::ThreadMutex => {
                let inst = (*self.cur()).mem[0] as *mut usize;
                if inst.is_null() {
                    return Err(VmError::NilDeref);
                }
                *inst.add(1) = crate::sync::MutexRegistry::create() as usize;
            }
            Opcode::CriticalStart => concurrency::critical_start(op_stack, stack_pos)?,
            Opcode::CriticalEnd => concurrency::critical_end(op_stack, stack_pos)?,

            // shared libraries
            Opcode::DllLoad => self.dll_load()?,
            Opcode::DllUnload => self.dll_unload()?,
            Opcode::DllFuncCall => self.dll_func_call(op_stack, stack_pos)?,

            // platform traps
            Opcode::Trap | Opcode::TrapRtrn => {
                let inst = (*self.cur()).mem[0] as *mut usize;
                TrapProcessor::process(instr, inst, op_stack, stack_pos)?;
            }
        }
        Ok(Flow::Continue)
    }

    /// After a call completes, a current frame still marked `jit_called`
    /// means a native caller is waiting; release it and report.
    unsafe fn return_to_jit_caller(&mut self) -> bool {
        let frame = self.cur();
        if !frame.is_null() && (*frame).jit_called {
            (*frame).jit_called = false;
            FramePool::release(frame);
            true
        } else {
            false
        }
    }

    /// Jumps resolve their label to an instruction index on first
    /// encounter and cache it in the instruction's third operand.
    unsafe fn process_jump(
        &mut self,
        instr: &Instruction,
        ip: &mut i64,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let cached = instr.operand3();
        if cached != 0 {
            if instr.operand2() < 0 {
                *ip = cached;
            } else if pop_int(op_stack, stack_pos) as i64 == instr.operand2() {
                *ip = cached;
            }
            return Ok(());
        }

        let method = (*self.cur()).method();
        let target = method
            .label_index(instr.operand())
            .ok_or_else(|| VmError::Runtime(format!("undefined label {}", instr.operand())))?
            as i64
            + 1;
        if instr.operand2() < 0 {
            *ip = target;
            instr.set_operand3(target);
        } else if pop_int(op_stack, stack_pos) as i64 == instr.operand2() {
            *ip = target;
            instr.set_operand3(target);
        } else {
            // cache the resolution even when the branch falls through
            instr.set_operand3(target);
        }
        Ok(())
    }

    /// Print the unwound call stack and either exit or raise the halt
    /// flag, per the halt-on-error option. `ip` is the dispatch loop's
    /// live instruction pointer, already advanced past the faulting
    /// instruction; suspended frames carry their own saved pointer.
    fn fail(&mut self, err: VmError, ip: i64) {
        eprintln!(">>> {err} <<<");
        self.stack_error_unwind(ip);
        if options().halt_on_error {
            self.halt.store(true, Ordering::SeqCst);
        } else {
            std::process::exit(1);
        }
    }

    fn stack_error_unwind(&self, ip: i64) {
        unsafe {
            eprintln!("Unwinding local stack:");
            let frame = self.cur();
            if !frame.is_null() {
                let method = (*frame).method();
                eprintln!(
                    "  method: pos={}, name={}{}",
                    *self.call_stack_pos,
                    method.name(),
                    line_suffix(method, ip - 1)
                );
            }
            let mut pos = *self.call_stack_pos;
            while pos > 0 {
                pos -= 1;
                let frame = *self.call_stack.add(pos as usize);
                if !frame.is_null() {
                    let method = (*frame).method();
                    eprintln!(
                        "  method: pos={}, name={}{}",
                        pos,
                        method.name(),
                        line_suffix(method, (*frame).ip - 1)
                    );
                }
            }
            eprintln!("  ...");
        }
    }
}

/// `, line=N` for the instruction at `ip`, or nothing when the index is
/// out of range or the image carries no line for it.
fn line_suffix(method: &Method, ip: i64) -> String {
    if ip < 0 || ip as usize >= method.instructions().len() {
        return String::new();
    }
    let line = method.instructions()[ip as usize].line();
    if line > 0 {
        format!(", line={line}")
    } else {
        String::new()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        if let Some(owned) = &self.owned {
            MemoryManager::unregister_monitor(&*owned.monitor);
        }
        let mut interpreters = INTERPRETERS.lock();
        if let Some(at) = interpreters.iter().position(|f| Arc::ptr_eq(f, &self.halt)) {
            interpreters.remove(at);
        }
    }
}

#[inline(always)]
unsafe fn int_binary(
    op_stack: *mut usize,
    stack_pos: *mut i64,
    op: impl Fn(i64, i64) -> VmResult<i64>,
) -> VmResult<()> {
    let left = pop_int(op_stack, stack_pos) as i64;
    let right = pop_int(op_stack, stack_pos) as i64;
    push_int(op(left, right)? as usize, op_stack, stack_pos);
    Ok(())
}

#[inline(always)]
unsafe fn float_binary(op_stack: *mut usize, stack_pos: *mut i64, op: impl Fn(f64, f64) -> f64) {
    let left = pop_float(op_stack, stack_pos);
    let right = pop_float(op_stack, stack_pos);
    push_float(op(left, right), op_stack, stack_pos);
}

#[inline(always)]
unsafe fn float_compare(op_stack: *mut usize, stack_pos: *mut i64, op: impl Fn(f64, f64) -> bool) {
    let left = pop_float(op_stack, stack_pos);
    let right = pop_float(op_stack, stack_pos);
    push_int(op(left, right) as usize, op_stack, stack_pos);
}

#[inline(always)]
unsafe fn float_unary(op_stack: *mut usize, stack_pos: *mut i64, op: impl Fn(f64) -> f64) {
    let value = pop_float(op_stack, stack_pos);
    push_float(op(value), op_stack, stack_pos);
}
