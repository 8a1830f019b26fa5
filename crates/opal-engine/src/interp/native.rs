//! Shared-library binding and the generic native-call surface
//!
//! A library-instance object carries its name string in slot 0 and its
//! registry handle in slot 1; `mem[2]` of the calling frame holds the
//! argument array passed to named functions as `VmContext.data_array`.
//! Libraries resolve against `OPAL_LIB_PATH` first, then the
//! `../lib/native/` fallback, with the platform suffix appended.
//!
//! Exported lifecycle symbols are `load_lib`/`unload_lib`; every callable
//! function takes a single `*mut VmContext`.

use std::ffi::CString;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use libloading::Library;
use once_cell::sync::Lazy;
use opal_sdk::{ValueKind, VmContext};

use super::Interpreter;
use crate::memory::{AllocKind, MemoryManager};
use crate::program::Program;
use crate::{VmError, VmResult};

/// Environment variable extending the native-library search path.
pub const LIB_PATH_ENV: &str = "OPAL_LIB_PATH";

static NEXT_LIBRARY_ID: AtomicU64 = AtomicU64::new(1);
static LIBRARIES: Lazy<DashMap<u64, Library>> = Lazy::new(DashMap::new);

#[cfg(target_os = "windows")]
const LIB_SUFFIX: &str = ".dll";
#[cfg(target_os = "macos")]
const LIB_SUFFIX: &str = ".dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIB_SUFFIX: &str = ".so";

fn library_path(name: &str) -> String {
    match std::env::var(LIB_PATH_ENV) {
        Ok(base) if !base.is_empty() => format!("{base}/native/{name}{LIB_SUFFIX}"),
        _ => format!("../lib/native/{name}{LIB_SUFFIX}"),
    }
}

type LifecycleFn = unsafe extern "C" fn();
type LibraryFn = unsafe extern "C" fn(*mut VmContext);

impl Interpreter {
    pub(super) unsafe fn dll_load(&mut self) -> VmResult<()> {
        let inst = (*self.cur()).mem[0] as *mut usize;
        if inst.is_null() {
            return Err(VmError::LibraryLoad("no library instance".to_string()));
        }
        let name = MemoryManager::read_string_object(*inst as *const usize)
            .ok_or_else(|| VmError::LibraryLoad("library name not specified".to_string()))?;

        let path = library_path(&name);
        tracing::debug!(%path, "binding shared library");
        let library =
            Library::new(&path).map_err(|e| VmError::LibraryLoad(format!("{path}: {e}")))?;
        {
            let load: libloading::Symbol<'_, LifecycleFn> = library
                .get(b"load_lib\0")
                .map_err(|_| VmError::LibrarySymbol("load_lib".to_string()))?;
            load();
        }

        let id = NEXT_LIBRARY_ID.fetch_add(1, Ordering::Relaxed);
        LIBRARIES.insert(id, library);
        *inst.add(1) = id as usize;
        Ok(())
    }

    pub(super) unsafe fn dll_unload(&mut self) -> VmResult<()> {
        let inst = (*self.cur()).mem[0] as *mut usize;
        if inst.is_null() {
            return Ok(());
        }
        let id = *inst.add(1) as u64;
        if let Some((_, library)) = LIBRARIES.remove(&id) {
            let unload: libloading::Symbol<'_, LifecycleFn> = library
                .get(b"unload_lib\0")
                .map_err(|_| VmError::LibrarySymbol("unload_lib".to_string()))?;
            unload();
            drop(library);
            *inst.add(1) = 0;
        }
        Ok(())
    }

    pub(super) unsafe fn dll_func_call(
        &mut self,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let frame = self.cur();
        let inst = (*frame).mem[0] as *mut usize;
        if inst.is_null() {
            return Err(VmError::NilDeref);
        }
        let name = MemoryManager::read_string_object((*frame).mem[1] as *const usize)
            .ok_or_else(|| VmError::LibrarySymbol("function name not specified".to_string()))?;
        let args = (*frame).mem[2] as *mut usize;

        let id = *inst.add(1) as u64;
        let library = LIBRARIES
            .get(&id)
            .ok_or_else(|| VmError::LibraryLoad("library not bound".to_string()))?;

        let symbol = CString::new(name.clone())
            .map_err(|_| VmError::LibrarySymbol(name.clone()))?;
        let func: libloading::Symbol<'_, LibraryFn> = library
            .get(symbol.as_bytes_with_nul())
            .map_err(|_| VmError::LibrarySymbol(name))?;

        let mut context = VmContext {
            data_array: args,
            op_stack,
            stack_pos,
            call_method_by_name: api_call_method_by_name,
            call_method_by_id: api_call_method_by_id,
            alloc_array: api_alloc_array,
            alloc_obj: api_alloc_obj,
        };
        func(&mut context);
        Ok(())
    }
}

/// Re-entry point handed to native libraries: call a method by qualified
/// name on the caller's operand stack.
pub(crate) unsafe extern "C" fn api_call_method_by_name(
    op_stack: *mut usize,
    stack_pos: *mut i64,
    receiver: *mut usize,
    cls_name: *const c_char,
    mthd_name: *const c_char,
) {
    if cls_name.is_null() || mthd_name.is_null() {
        return;
    }
    let cls = std::ffi::CStr::from_ptr(cls_name).to_string_lossy();
    let mthd = std::ffi::CStr::from_ptr(mthd_name).to_string_lossy();
    let Some(method) = Program::global()
        .class_by_name(&cls)
        .and_then(|c| c.method_by_name(&mthd))
    else {
        return;
    };
    let mut intpr = Interpreter::new();
    intpr.execute(op_stack, stack_pos, 0, method, receiver, false);
}

/// Re-entry point handed to native libraries: call a method by id pair.
pub(crate) unsafe extern "C" fn api_call_method_by_id(
    op_stack: *mut usize,
    stack_pos: *mut i64,
    receiver: *mut usize,
    cls_id: i64,
    mthd_id: i64,
) {
    let Some(method) = Program::global()
        .class(cls_id)
        .and_then(|c| c.method(mthd_id))
    else {
        return;
    };
    let mut intpr = Interpreter::new();
    intpr.execute(op_stack, stack_pos, 0, method, receiver, false);
}

/// Allocation entry point handed to native libraries: a one-dimensional
/// array of `size` elements.
pub(crate) unsafe extern "C" fn api_alloc_array(
    size: i64,
    kind: ValueKind,
    op_stack: *mut usize,
    stack_pos: i64,
) -> *mut usize {
    let size = size.max(0) as usize;
    let (words, count, alloc_kind) = match kind {
        ValueKind::Byte => (3 + (size + 1).div_ceil(8), size + 1, AllocKind::ByteArray),
        ValueKind::Char => (3 + ((size + 1) * 4).div_ceil(8), size + 1, AllocKind::CharArray),
        ValueKind::Float => (3 + size, size, AllocKind::FloatArray),
        _ => (3 + size, size, AllocKind::IntArray),
    };
    let mem = MemoryManager::allocate_array(words, alloc_kind, op_stack, stack_pos);
    *mem = count;
    *mem.add(1) = 1;
    *mem.add(2) = size;
    mem
}

/// Allocation entry point handed to native libraries: an object instance.
pub(crate) unsafe extern "C" fn api_alloc_obj(
    cls_id: i64,
    op_stack: *mut usize,
    stack_pos: i64,
) -> *mut usize {
    MemoryManager::allocate_object(cls_id, op_stack, stack_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_path_fallback() {
        // no env override in the test environment by default
        std::env::remove_var(LIB_PATH_ENV);
        let path = library_path("diags");
        assert!(path.starts_with("../lib/native/"));
        assert!(path.ends_with(&format!("diags{LIB_SUFFIX}")));

        std::env::set_var(LIB_PATH_ENV, "/opt/opal/lib");
        let path = library_path("diags");
        assert_eq!(path, format!("/opt/opal/lib/native/diags{LIB_SUFFIX}"));
        std::env::remove_var(LIB_PATH_ENV);
    }
}
