//! Conformance tests and checked casts

use crate::memory::MemoryManager;
use crate::program::Program;
use crate::stack::{pop_int, push_int};
use crate::{VmError, VmResult};

/// Pop a reference and push 1 when it conforms to `target_id`, 0
/// otherwise. Nil is fatal.
///
/// # Safety
/// The stack top must be an object reference or nil.
pub(crate) unsafe fn obj_type_of(
    target_id: i64,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let reference = pop_int(op_stack, stack_pos) as *const usize;
    if reference.is_null() {
        return Err(VmError::Runtime("TypeOf(..) check on Nil value".to_string()));
    }
    let conforms = MemoryManager::valid_cast(reference, target_id);
    push_int(conforms as usize, op_stack, stack_pos);
    Ok(())
}

/// Pop a reference and push it back when it conforms to `target_id`. Nil
/// passes through; a non-nil reference that fails the check is fatal with
/// both class names.
///
/// # Safety
/// The stack top must be an object reference or nil.
pub(crate) unsafe fn obj_inst_cast(
    target_id: i64,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let reference = pop_int(op_stack, stack_pos) as *const usize;
    if reference.is_null() {
        push_int(0, op_stack, stack_pos);
        return Ok(());
    }
    if MemoryManager::valid_cast(reference, target_id) {
        push_int(reference as usize, op_stack, stack_pos);
        return Ok(());
    }

    let program = Program::global();
    let from = MemoryManager::class_of(reference)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "?".to_string());
    let to = program
        .class(target_id)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| format!("#{target_id}"));
    Err(VmError::InvalidCast { from, to })
}
