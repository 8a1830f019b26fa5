//! JIT compilation and the native execution boundary
//!
//! Methods are lowered by a one-pass template emitter (`amd64`) into
//! executable pages. Compiled code follows the same operand-stack and
//! activation-frame contracts as the interpreter, so control can cross the
//! boundary in either direction mid-call: JIT code re-enters the runtime
//! through [`jit_stack_callback`] for every operation it does not inline,
//! and the interpreter returns into native code when a frame marked
//! `jit_called` unwinds.
//!
//! Compilation failure is never fatal: the buffer is discarded, the method
//! is flagged, and every later invocation interprets.

pub mod pages;
pub mod regalloc;

#[cfg(all(target_arch = "x86_64", unix))]
mod amd64;

use crate::frame::Frame;
use crate::program::{Method, Program};

/// Nominal completion status of JIT-compiled code.
pub const STATUS_OK: i64 = 0;
/// Native code dereferenced a nil reference.
pub const STATUS_NIL: i64 = -1;
/// Native code computed a negative array index.
pub const STATUS_BOUNDS_LOW: i64 = -2;
/// Native code computed an index at or above the array size.
pub const STATUS_BOUNDS_HIGH: i64 = -3;
/// Native code divided by zero.
pub const STATUS_DIV_ZERO: i64 = -4;

/// Compiled method body: an executable-page pointer, the code length, and
/// the interned float-constant table the code loads doubles from.
pub struct NativeCode {
    code: *const u8,
    len: usize,
    floats: Box<[f64]>,
}

// Code pages are immutable once published and the float table is read-only.
unsafe impl Send for NativeCode {}
unsafe impl Sync for NativeCode {}

impl NativeCode {
    pub(crate) fn new(code: *const u8, len: usize, floats: Box<[f64]>) -> Self {
        Self { code, len, floats }
    }

    /// Entry address of the compiled body.
    pub fn ptr(&self) -> *const u8 {
        self.code
    }

    /// Emitted code length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether any code was emitted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The interned float constants referenced by the code.
    pub fn floats(&self) -> &[f64] {
        &self.floats
    }
}

/// Native entry convention shared by every compiled method.
///
/// The last two arguments address the frame's `jit_mem`/`jit_offset`
/// fields, which the prologue fills so the collector can walk the native
/// local area while the method is suspended in a callback.
pub(crate) type JitFn = unsafe extern "C" fn(
    cls_id: i64,
    mthd_id: i64,
    cls_mem: *mut usize,
    inst: *mut usize,
    op_stack: *mut usize,
    stack_pos: *mut i64,
    call_stack: *mut *mut Frame,
    call_stack_pos: *mut i64,
    jit_mem: *mut *mut usize,
    jit_offset: *mut i64,
) -> i64;

/// Compile `method` if possible. Returns whether native code is attached
/// afterwards. A failed attempt is sticky; later calls interpret.
pub fn compile(method: &'static Method) -> bool {
    if method.native_code().is_some() {
        return true;
    }
    if method.jit_failed() {
        return false;
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    {
        match amd64::compile_method(method) {
            Ok(native) => {
                method.set_native_code(native);
                true
            }
            Err(reason) => {
                tracing::debug!(method = method.name(), %reason, "jit compilation fell back");
                method.mark_jit_failed();
                false
            }
        }
    }

    #[cfg(not(all(target_arch = "x86_64", unix)))]
    {
        method.mark_jit_failed();
        false
    }
}

/// Transfer control to a method's native code.
///
/// # Safety
/// The method must carry native code, and every pointer must describe the
/// calling thread's live stacks and frame.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn execute(
    method: &Method,
    receiver: *mut usize,
    op_stack: *mut usize,
    stack_pos: *mut i64,
    call_stack: *mut *mut Frame,
    call_stack_pos: *mut i64,
    frame: *mut Frame,
) -> i64 {
    let code = match method.native_code() {
        Some(code) => code,
        None => return STATUS_NIL,
    };
    let cls_mem = Program::global()
        .class(method.cls_id())
        .map(|c| c.class_memory())
        .unwrap_or(std::ptr::null_mut());

    let entry: JitFn = std::mem::transmute(code.ptr());
    entry(
        method.cls_id(),
        method.id(),
        cls_mem,
        receiver,
        op_stack,
        stack_pos,
        call_stack,
        call_stack_pos,
        &mut (*frame).jit_mem as *mut *mut usize,
        &mut (*frame).jit_offset as *mut i64,
    )
}

/// Operations the emitter delegates back to the runtime. The bridge in
/// emitted code flushes its working stack to the real operand stack,
/// marshals this exact argument list, and pulls any scalar result back off
/// the operand stack afterwards.
#[cfg(all(target_arch = "x86_64", unix))]
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe extern "C" fn jit_stack_callback(
    _instr_id: i64,
    instr: *const crate::program::Instruction,
    cls_id: i64,
    mthd_id: i64,
    inst: *mut usize,
    op_stack: *mut usize,
    stack_pos: *mut i64,
    call_stack: *mut *mut Frame,
    call_stack_pos: *mut i64,
    ip: i64,
) -> i64 {
    use crate::interp::{self, Interpreter};
    use crate::memory::{AllocKind, MemoryManager};
    use crate::program::Opcode;
    use crate::stack::{pop_int, push_int};
    use crate::sync::MutexRegistry;

    let instr = &*instr;
    let result = match instr.opcode() {
        Opcode::MthdCall | Opcode::DynMthdCall => {
            // Re-enter the interpreter on the calling (native) method at the
            // call instruction itself: the interpreter performs resolution,
            // runs the callee, and returns as soon as the jit-called frame
            // unwinds.
            let program = Program::global();
            match program.class(cls_id).and_then(|c| c.method(mthd_id)) {
                Some(method) => {
                    let mut intpr = Interpreter::with_stack(call_stack, call_stack_pos);
                    intpr.execute(op_stack, stack_pos, ip, method, inst, true);
                    Ok(())
                }
                None => Err(crate::VmError::UnknownMethod(cls_id, mthd_id)),
            }
        }

        Opcode::NewByteAry => interp::arrays::new_array(instr.operand(), AllocKind::ByteArray, op_stack, stack_pos),
        Opcode::NewCharAry => interp::arrays::new_array(instr.operand(), AllocKind::CharArray, op_stack, stack_pos),
        Opcode::NewIntAry => interp::arrays::new_array(instr.operand(), AllocKind::IntArray, op_stack, stack_pos),
        Opcode::NewFloatAry => interp::arrays::new_array(instr.operand(), AllocKind::FloatArray, op_stack, stack_pos),
        Opcode::NewObjInst => {
            let obj = MemoryManager::allocate_object(instr.operand(), op_stack, *stack_pos);
            push_int(obj as usize, op_stack, stack_pos);
            Ok(())
        }
        Opcode::NewFuncInst => {
            interp::arrays::new_func_instance(instr.operand(), op_stack, stack_pos);
            Ok(())
        }

        Opcode::ObjTypeOf => interp::objects::obj_type_of(instr.operand(), op_stack, stack_pos),
        Opcode::ObjInstCast => interp::objects::obj_inst_cast(instr.operand(), op_stack, stack_pos),

        Opcode::CpyByteAry => interp::arrays::copy_array(AllocKind::ByteArray, op_stack, stack_pos),
        Opcode::CpyCharAry => interp::arrays::copy_array(AllocKind::CharArray, op_stack, stack_pos),
        Opcode::CpyIntAry => interp::arrays::copy_array(AllocKind::IntArray, op_stack, stack_pos),
        Opcode::CpyFloatAry => interp::arrays::copy_array(AllocKind::FloatArray, op_stack, stack_pos),

        Opcode::S2I => interp::convert::str_to_int(op_stack, stack_pos),
        Opcode::S2F => interp::convert::str_to_float(op_stack, stack_pos),
        Opcode::I2S => interp::convert::int_to_str(op_stack, stack_pos),
        Opcode::F2S => interp::convert::float_to_str(op_stack, stack_pos),

        Opcode::ThreadJoin => interp::concurrency::join_thread(inst),
        Opcode::ThreadSleep => {
            let millis = pop_int(op_stack, stack_pos) as i64;
            interp::concurrency::sleep_millis(millis);
            Ok(())
        }
        Opcode::ThreadMutex => {
            if inst.is_null() {
                Err(crate::VmError::NilDeref)
            } else {
                *inst.add(1) = MutexRegistry::create() as usize;
                Ok(())
            }
        }
        Opcode::CriticalStart => interp::concurrency::critical_start(op_stack, stack_pos),
        Opcode::CriticalEnd => interp::concurrency::critical_end(op_stack, stack_pos),

        Opcode::Trap | Opcode::TrapRtrn => {
            crate::trap::TrapProcessor::process(instr, inst, op_stack, stack_pos)
        }

        other => Err(crate::VmError::Runtime(format!(
            "native bridge cannot handle opcode {other:?}"
        ))),
    };

    match result {
        Ok(()) => STATUS_OK,
        Err(err) => {
            let name = Program::global()
                .class(cls_id)
                .and_then(|c| c.method(mthd_id))
                .map(|m| m.name().to_string())
                .unwrap_or_default();
            eprintln!(">>> {err} <<<");
            eprintln!("  native method: name={name}");
            std::process::exit(1);
        }
    }
}

// Platform math routines called from emitted code. Transcendentals
// materialize operands in xmm0/xmm1 and call through these thunks.
#[cfg(all(target_arch = "x86_64", unix))]
pub(crate) mod mathfn {
    pub extern "C" fn sin(x: f64) -> f64 {
        x.sin()
    }
    pub extern "C" fn cos(x: f64) -> f64 {
        x.cos()
    }
    pub extern "C" fn tan(x: f64) -> f64 {
        x.tan()
    }
    pub extern "C" fn asin(x: f64) -> f64 {
        x.asin()
    }
    pub extern "C" fn acos(x: f64) -> f64 {
        x.acos()
    }
    pub extern "C" fn atan(x: f64) -> f64 {
        x.atan()
    }
    pub extern "C" fn atan2(y: f64, x: f64) -> f64 {
        y.atan2(x)
    }
    pub extern "C" fn log(x: f64) -> f64 {
        x.ln()
    }
    pub extern "C" fn pow(base: f64, exp: f64) -> f64 {
        base.powf(exp)
    }
    pub extern "C" fn sqrt(x: f64) -> f64 {
        x.sqrt()
    }
    pub extern "C" fn rand() -> f64 {
        ::rand::random::<f64>()
    }
}
