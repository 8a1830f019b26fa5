//! Memory interface
//!
//! The allocation and root-registration contracts the interpreter, JIT
//! bridge, and native traps consume. Objects and arrays are zeroed word
//! blocks registered in a process-wide table that maps header addresses back
//! to their kind and class; the collector proper is an external collaborator,
//! so reclamation here is a stub: the table supports a mark walk over the
//! registered frame monitors but never frees during execution.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::frame::FrameMonitor;
use crate::program::{Class, Program};

/// What a registered allocation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// An object instance of the given class.
    Object(i64),
    /// Byte array (one byte per element plus a trailing terminator).
    ByteArray,
    /// Char array (one 32-bit unit per element plus a trailing terminator).
    CharArray,
    /// Integer array (one word per element).
    IntArray,
    /// Float array (one word per element).
    FloatArray,
}

struct Allocation {
    kind: AllocKind,
    data: Box<[usize]>,
}

// Keyed by header address.
static ALLOCATIONS: Lazy<DashMap<usize, Allocation>> = Lazy::new(DashMap::new);

struct MonitorRef(*const FrameMonitor);
unsafe impl Send for MonitorRef {}

static MONITORS: Lazy<Mutex<Vec<MonitorRef>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Words ahead of the payload in a one-dimensional array.
pub const ARRAY_HEADER_WORDS: usize = 3;

/// The process-wide allocation interface.
pub struct MemoryManager;

impl MemoryManager {
    /// Allocate a zeroed object of `cls_id`, or a nil reference when the
    /// class is unknown. The operand-stack arguments let a collecting
    /// allocator scan the caller's live values; the stub ignores them.
    pub fn allocate_object(cls_id: i64, _op_stack: *mut usize, _stack_pos: i64) -> *mut usize {
        let Some(program) = Program::try_global() else {
            return std::ptr::null_mut();
        };
        let Some(cls) = program.class(cls_id) else {
            return std::ptr::null_mut();
        };
        Self::allocate_words(cls.inst_space().max(1), AllocKind::Object(cls_id))
    }

    /// Allocate a zeroed array block of `words` machine words (header
    /// included) of the given kind.
    pub fn allocate_array(
        words: usize,
        kind: AllocKind,
        _op_stack: *mut usize,
        _stack_pos: i64,
    ) -> *mut usize {
        Self::allocate_words(words.max(1), kind)
    }

    fn allocate_words(words: usize, kind: AllocKind) -> *mut usize {
        let mut data = vec![0usize; words].into_boxed_slice();
        let addr = data.as_mut_ptr();
        ALLOCATIONS.insert(addr as usize, Allocation { kind, data });
        addr
    }

    /// The kind of a registered allocation.
    pub fn kind_of(reference: *const usize) -> Option<AllocKind> {
        ALLOCATIONS.get(&(reference as usize)).map(|a| a.kind)
    }

    /// The class of an object reference; `None` for nil, arrays, or foreign
    /// pointers.
    pub fn class_of(reference: *const usize) -> Option<&'static Class> {
        match Self::kind_of(reference)? {
            AllocKind::Object(cls_id) => Program::global().class(cls_id),
            _ => None,
        }
    }

    /// Whether a non-nil object reference conforms to `target_id` through
    /// the hierarchy or interface tables. Nil and foreign pointers fail.
    pub fn valid_cast(reference: *const usize, target_id: i64) -> bool {
        match Self::class_of(reference) {
            Some(cls) => Program::global().conforms_to(cls.id(), target_id),
            None => false,
        }
    }

    /// Materialize a string: a char array plus a
    /// `[char_array, length, capacity]` instance of the image's string
    /// class. The character payload is 32-bit scalars with a trailing
    /// terminator, so it doubles as a C wide-string view.
    pub fn create_string_object(
        text: &str,
        op_stack: *mut usize,
        stack_pos: i64,
    ) -> *mut usize {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();

        // element count includes the terminator; two chars per word
        let payload_words = (len + 1).div_ceil(2);
        let array = Self::allocate_array(
            2 + 1 + payload_words,
            AllocKind::CharArray,
            op_stack,
            stack_pos,
        );
        unsafe {
            *array = len + 1;
            *array.add(1) = 1;
            *array.add(2) = len;
            let payload = array.add(ARRAY_HEADER_WORDS) as *mut u32;
            for (i, ch) in chars.iter().enumerate() {
                *payload.add(i) = *ch as u32;
            }
        }

        let string_cls = Program::global().string_cls_id();
        let obj = if string_cls >= 0 {
            Self::allocate_object(string_cls, op_stack, stack_pos)
        } else {
            Self::allocate_words(3, AllocKind::Object(-1))
        };
        if !obj.is_null() {
            unsafe {
                *obj = array as usize;
                *obj.add(1) = len;
                *obj.add(2) = len;
            }
        }
        obj
    }

    /// Decode a string-object reference created by
    /// [`MemoryManager::create_string_object`] (or bytecode following the
    /// same layout).
    pub fn read_string_object(reference: *const usize) -> Option<String> {
        if reference.is_null() {
            return None;
        }
        unsafe { opal_sdk::read_string_object(reference as *mut usize) }
    }

    /// Register a thread's frame monitor for root walks.
    pub fn register_monitor(monitor: *const FrameMonitor) {
        MONITORS.lock().push(MonitorRef(monitor));
    }

    /// Remove a previously registered monitor.
    pub fn unregister_monitor(monitor: *const FrameMonitor) {
        MONITORS.lock().retain(|m| m.0 != monitor);
    }

    /// Number of registered monitors.
    pub fn monitor_count() -> usize {
        MONITORS.lock().len()
    }

    /// Number of live registered allocations.
    pub fn allocation_count() -> usize {
        ALLOCATIONS.len()
    }

    /// Mark walk: count distinct registered allocations reachable from the
    /// registered monitors (frame locals, the current frame, and published
    /// JIT local areas). Diagnostic only; nothing is freed.
    pub fn trace_roots() -> usize {
        use std::collections::HashSet;

        let mut marked: HashSet<usize> = HashSet::new();
        let monitors = MONITORS.lock();
        for monitor in monitors.iter() {
            unsafe {
                let m = &*monitor.0;
                let pos = if m.call_stack_pos.is_null() {
                    0
                } else {
                    (*m.call_stack_pos).max(0)
                };
                for i in 0..pos {
                    Self::mark_frame(*m.call_stack.add(i as usize), &mut marked);
                }
                if !m.cur_frame.is_null() {
                    Self::mark_frame(*m.cur_frame, &mut marked);
                }
            }
        }
        marked.len()
    }

    unsafe fn mark_frame(frame: *const crate::frame::Frame, marked: &mut std::collections::HashSet<usize>) {
        if frame.is_null() {
            return;
        }
        let f = &*frame;
        for &slot in f.mem.iter() {
            if ALLOCATIONS.contains_key(&slot) {
                marked.insert(slot);
            }
        }
        if !f.jit_mem.is_null() {
            for i in 0..f.jit_offset.max(0) as usize {
                let slot = *f.jit_mem.add(i);
                if ALLOCATIONS.contains_key(&slot) {
                    marked.insert(slot);
                }
            }
        }
    }
}
