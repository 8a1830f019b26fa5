//! Array allocation, element access, and block copies
//!
//! These operate purely on the operand stack and the allocation table, so
//! the same functions serve the interpreter's dispatch loop and the native
//! callback bridge.
//!
//! Layout: `[element_count, dimension_count, dim sizes..., payload]`. The
//! element count of byte and char arrays includes the trailing terminator
//! that lets the payload double as a C-string view.

use crate::memory::{AllocKind, MemoryManager};
use crate::program::Instruction;
use crate::stack::{pop_float, pop_int, push_float, push_int};
use crate::{VmError, VmResult};

const MAX_DIMENSIONS: usize = 8;

/// Allocate an array from `dim` dimension sizes on the stack and push the
/// reference.
///
/// # Safety
/// `op_stack`/`stack_pos` must be a live operand stack holding `dim`
/// sizes.
pub(crate) unsafe fn new_array(
    dim: i64,
    kind: AllocKind,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    if dim < 1 || dim as usize > MAX_DIMENSIONS {
        return Err(VmError::Runtime(format!("unsupported array rank {dim}")));
    }

    let mut dims = [0usize; MAX_DIMENSIONS];
    let mut size = pop_int(op_stack, stack_pos);
    dims[0] = size;
    for slot in dims.iter_mut().take(dim as usize).skip(1) {
        let value = pop_int(op_stack, stack_pos);
        size = size.wrapping_mul(value);
        *slot = value;
    }

    let dim = dim as usize;
    let (words, count) = match kind {
        AllocKind::IntArray | AllocKind::FloatArray => (2 + dim + size, size),
        AllocKind::ByteArray => (2 + dim + (size + 1).div_ceil(8), size + 1),
        AllocKind::CharArray => (2 + dim + ((size + 1) * 4).div_ceil(8), size + 1),
        AllocKind::Object(_) => return Err(VmError::Runtime("not an array kind".to_string())),
    };

    let mem = MemoryManager::allocate_array(words, kind, op_stack, *stack_pos);
    *mem = count;
    *mem.add(1) = dim;
    for (i, d) in dims.iter().take(dim).enumerate() {
        *mem.add(2 + i) = *d;
    }
    push_int(mem as usize, op_stack, stack_pos);
    Ok(())
}

/// Allocate the byte array backing a function instance of the declared
/// size and push it.
///
/// # Safety
/// `op_stack`/`stack_pos` must be a live operand stack.
pub(crate) unsafe fn new_func_instance(size: i64, op_stack: *mut usize, stack_pos: *mut i64) {
    let size = size.max(0) as usize;
    let words = 2 + 1 + (size + 1).div_ceil(8);
    let mem = MemoryManager::allocate_array(words, AllocKind::ByteArray, op_stack, *stack_pos);
    *mem = size + 1;
    *mem.add(1) = 1;
    *mem.add(2) = size;
    push_int(mem as usize, op_stack, stack_pos);
}

/// Push the element count of the popped array.
///
/// # Safety
/// As [`new_array`]; the stack top must be an array reference or nil.
pub(crate) unsafe fn load_ary_size(op_stack: *mut usize, stack_pos: *mut i64) -> VmResult<()> {
    let array = pop_int(op_stack, stack_pos) as *const usize;
    if array.is_null() {
        return Err(VmError::NilDeref);
    }
    push_int(*array, op_stack, stack_pos);
    Ok(())
}

/// Pop the index operands and fold them row-major:
/// `((((i₀·d₁)+i₁)·d₂)+i₂)…`, then bounds-check against the element count.
unsafe fn array_index(
    instr: &Instruction,
    array: *const usize,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<usize> {
    let mut index = pop_int(op_stack, stack_pos) as i64;
    let dim = instr.operand();
    for i in 1..dim {
        index = index.wrapping_mul(*array.add(2 + i as usize) as i64);
        index = index.wrapping_add(pop_int(op_stack, stack_pos) as i64);
    }

    let size = *array as i64;
    if index < 0 || index >= size {
        return Err(VmError::IndexBounds { index, size });
    }
    Ok(index as usize)
}

unsafe fn pop_array(op_stack: *mut usize, stack_pos: *mut i64) -> VmResult<*mut usize> {
    let array = pop_int(op_stack, stack_pos) as *mut usize;
    if array.is_null() {
        return Err(VmError::NilDeref);
    }
    Ok(array)
}

macro_rules! elem_payload {
    ($array:expr, $instr:expr, $ty:ty) => {
        $array.add(2 + $instr.operand() as usize) as *mut $ty
    };
}

/// # Safety
/// The stack must hold an array reference over its index operands.
pub(crate) unsafe fn load_byte_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, u8);
    push_int(*payload.add(index) as usize, op_stack, stack_pos);
    Ok(())
}

/// # Safety
/// As [`load_byte_elem`], with the stored value below the indices.
pub(crate) unsafe fn store_byte_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, u8);
    *payload.add(index) = pop_int(op_stack, stack_pos) as u8;
    Ok(())
}

/// # Safety
/// As [`load_byte_elem`].
pub(crate) unsafe fn load_char_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, u32);
    push_int(*payload.add(index) as usize, op_stack, stack_pos);
    Ok(())
}

/// # Safety
/// As [`store_byte_elem`].
pub(crate) unsafe fn store_char_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, u32);
    *payload.add(index) = pop_int(op_stack, stack_pos) as u32;
    Ok(())
}

/// # Safety
/// As [`load_byte_elem`].
pub(crate) unsafe fn load_int_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, usize);
    push_int(*payload.add(index), op_stack, stack_pos);
    Ok(())
}

/// # Safety
/// As [`store_byte_elem`].
pub(crate) unsafe fn store_int_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, usize);
    *payload.add(index) = pop_int(op_stack, stack_pos);
    Ok(())
}

/// # Safety
/// As [`load_byte_elem`].
pub(crate) unsafe fn load_float_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, f64);
    push_float(*payload.add(index), op_stack, stack_pos);
    Ok(())
}

/// # Safety
/// As [`store_byte_elem`].
pub(crate) unsafe fn store_float_elem(
    instr: &Instruction,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let array = pop_array(op_stack, stack_pos)?;
    let index = array_index(instr, array, op_stack, stack_pos)?;
    let payload = elem_payload!(array, instr, f64);
    *payload.add(index) = pop_float(op_stack, stack_pos);
    Ok(())
}

/// Block-copy between same-kind arrays.
///
/// Pops `length`, `src_offset`, `src`, `dst_offset`, `dst`. Pushes 1 and
/// copies when the whole range fits in both arrays; a zero length is a
/// successful no-op; any out-of-range request pushes 0 and moves nothing.
/// Nil source or destination is fatal.
///
/// # Safety
/// The stack must hold the five operands described above.
pub(crate) unsafe fn copy_array(
    kind: AllocKind,
    op_stack: *mut usize,
    stack_pos: *mut i64,
) -> VmResult<()> {
    let length = pop_int(op_stack, stack_pos) as i64;
    let src_offset = pop_int(op_stack, stack_pos) as i64;
    let src = pop_int(op_stack, stack_pos) as *mut usize;
    let dst_offset = pop_int(op_stack, stack_pos) as i64;
    let dst = pop_int(op_stack, stack_pos) as *mut usize;

    if src.is_null() || dst.is_null() {
        return Err(VmError::NilDeref);
    }
    if length == 0 {
        push_int(1, op_stack, stack_pos);
        return Ok(());
    }

    // byte and char arrays bound by the logical (terminator-free) size
    let (src_len, dst_len) = match kind {
        AllocKind::ByteArray | AllocKind::CharArray => (*src.add(2) as i64, *dst.add(2) as i64),
        _ => (*src as i64, *dst as i64),
    };

    let fits = length > 0
        && src_offset >= 0
        && dst_offset >= 0
        && src_offset + length <= src_len
        && dst_offset + length <= dst_len;
    if !fits {
        push_int(0, op_stack, stack_pos);
        return Ok(());
    }

    let count = length as usize;
    match kind {
        AllocKind::ByteArray => {
            let from = (src.add(3) as *const u8).add(src_offset as usize);
            let to = (dst.add(3) as *mut u8).add(dst_offset as usize);
            std::ptr::copy(from, to, count);
        }
        AllocKind::CharArray => {
            let from = (src.add(3) as *const u32).add(src_offset as usize);
            let to = (dst.add(3) as *mut u32).add(dst_offset as usize);
            std::ptr::copy(from, to, count);
        }
        _ => {
            let from = src.add(3 + src_offset as usize);
            let to = dst.add(3 + dst_offset as usize);
            std::ptr::copy(from, to, count);
        }
    }
    push_int(1, op_stack, stack_pos);
    Ok(())
}
