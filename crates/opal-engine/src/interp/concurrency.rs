//! Asynchronous method calls and thread opcodes
//!
//! An asynchronous call spawns a real OS thread executing the receiver's
//! `Run:o.System.Base,` method on a fresh operand stack, with the single
//! parameter pre-pushed. The join-handle id is stored in the receiver's
//! first slot so `thread-join` can claim it from any thread; the mutex id
//! installed by `thread-mutex` lives in the second slot.

use super::Interpreter;
use crate::memory::MemoryManager;
use crate::stack::{pop_int, push_int, OP_STACK_SIZE};
use crate::sync::{MutexRegistry, ThreadRegistry};
use crate::{VmError, VmResult};

struct SendPtr(*mut usize);
// The spawned interpreter is the only user of these pointers until join.
unsafe impl Send for SendPtr {}

impl Interpreter {
    pub(super) unsafe fn async_mthd_call(&mut self) -> VmResult<()> {
        let frame = self.cur();
        let receiver = (*frame).mem[0] as *mut usize;
        let param = (*frame).mem[1] as *mut usize;

        let impl_class = MemoryManager::class_of(receiver).ok_or(VmError::NilDeref)?;
        let run_name = format!("{}:Run:o.System.Base,", impl_class.name());
        let called = impl_class
            .method_by_name(&run_name)
            .ok_or_else(|| VmError::Runtime(format!("missing thread entry {run_name}")))?;

        tracing::debug!(method = called.name(), "spawning async method call");
        let receiver = SendPtr(receiver);
        let param = SendPtr(param);
        let handle = std::thread::Builder::new()
            .name(called.name().to_string())
            .spawn(move || {
                let receiver = receiver;
                let param = param;
                let mut op_stack = vec![0usize; OP_STACK_SIZE].into_boxed_slice();
                let mut stack_pos: i64 = 0;
                unsafe {
                    push_int(param.0 as usize, op_stack.as_mut_ptr(), &mut stack_pos);
                    let mut intpr = Interpreter::new();
                    intpr.execute(
                        op_stack.as_mut_ptr(),
                        &mut stack_pos,
                        0,
                        called,
                        receiver.0,
                        false,
                    );
                }
            })
            .map_err(|_| VmError::ThreadSpawn)?;

        let receiver = (*frame).mem[0] as *mut usize;
        if receiver.is_null() {
            return Err(VmError::ThreadSpawn);
        }
        *receiver = ThreadRegistry::register(handle) as usize;
        Ok(())
    }
}

/// Wait for the thread whose id is in the receiver's first slot. Each
/// thread joins exactly once; a missing or failed thread is fatal.
///
/// # Safety
/// `inst` must be null or a live object reference.
pub(crate) unsafe fn join_thread(inst: *mut usize) -> VmResult<()> {
    if inst.is_null() {
        return Err(VmError::NilDeref);
    }
    let id = *inst as u64;
    let handle = ThreadRegistry::take(id).ok_or(VmError::ThreadJoin)?;
    handle.join().map_err(|_| VmError::ThreadJoin)?;
    Ok(())
}

/// Block the current thread for `millis` milliseconds.
pub(crate) fn sleep_millis(millis: i64) {
    std::thread::sleep(std::time::Duration::from_millis(millis.max(0) as u64));
}

/// Lock the mutex installed in the popped receiver's second slot.
///
/// # Safety
/// The stack top must be an object reference or nil.
pub(crate) unsafe fn critical_start(op_stack: *mut usize, stack_pos: *mut i64) -> VmResult<()> {
    let inst = pop_int(op_stack, stack_pos) as *const usize;
    if inst.is_null() {
        return Err(VmError::NilDeref);
    }
    if !MutexRegistry::lock(*inst.add(1) as u64) {
        return Err(VmError::Runtime("critical section mutex not initialized".to_string()));
    }
    Ok(())
}

/// Unlock the mutex installed in the popped receiver's second slot.
///
/// # Safety
/// The stack top must be an object reference or nil.
pub(crate) unsafe fn critical_end(op_stack: *mut usize, stack_pos: *mut i64) -> VmResult<()> {
    let inst = pop_int(op_stack, stack_pos) as *const usize;
    if inst.is_null() {
        return Err(VmError::NilDeref);
    }
    if !MutexRegistry::unlock(*inst.add(1) as u64) {
        return Err(VmError::Runtime("critical section mutex not initialized".to_string()));
    }
    Ok(())
}
