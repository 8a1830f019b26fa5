//! Method invocation and the call boundary
//!
//! Synchronous calls save the caller's instruction pointer, push its frame,
//! resolve the callee, and transfer control. Virtual methods bind against
//! the receiver's runtime class; resolutions are memoized forever in a
//! process-wide additive cache, so each distinct
//! `receiver class + signature` pair walks the hierarchy once.
//!
//! When the callee carries native code, execution transfers to it and the
//! interpreter resumes from the saved frame on return; a failed
//! compilation falls back to interpretation transparently.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use super::{options, Interpreter};
use crate::frame::FramePool;
use crate::jit;
use crate::memory::MemoryManager;
use crate::program::{Instruction, Method, Program};
use crate::stack::pop_int;
use crate::value::unpack_func;
use crate::{VmError, VmResult};

// receiver class name + method ending -> (class id, method id)
static DISPATCH_CACHE: Lazy<DashMap<String, (i64, i64)>> = Lazy::new(DashMap::new);

static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static HIERARCHY_WALKS: AtomicU64 = AtomicU64::new(0);

/// Virtual-dispatch instrumentation: `(cache hits, hierarchy walks)` since
/// process start.
pub fn dispatch_cache_stats() -> (u64, u64) {
    (
        CACHE_HITS.load(Ordering::Relaxed),
        HIERARCHY_WALKS.load(Ordering::Relaxed),
    )
}

impl Interpreter {
    pub(super) unsafe fn process_method_call(
        &mut self,
        instr: &Instruction,
        ip: &mut i64,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let frame = self.cur();
        (*frame).ip = *ip;
        self.push_frame(frame)?;

        let receiver = pop_int(op_stack, stack_pos) as *mut usize;
        let program = Program::global();
        let mut called = program
            .class(instr.operand())
            .ok_or(VmError::UnknownClass(instr.operand()))?
            .method(instr.operand2())
            .ok_or(VmError::UnknownMethod(instr.operand(), instr.operand2()))?;

        if called.is_virtual() {
            called = match self.resolve_virtual(called, receiver) {
                Ok(method) => method,
                Err(err) => {
                    // undo the caller push so the trace shows the call site
                    self.pop_frame()?;
                    return Err(err);
                }
            };
        }

        self.invoke(called, receiver, ip, op_stack, stack_pos)
    }

    pub(super) unsafe fn process_dynamic_call(
        &mut self,
        _instr: &Instruction,
        ip: &mut i64,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let frame = self.cur();
        (*frame).ip = *ip;
        self.push_frame(frame)?;

        let packed = pop_int(op_stack, stack_pos);
        let (cls_id, mthd_id) = unpack_func(packed);
        let receiver = pop_int(op_stack, stack_pos) as *mut usize;

        let called = Program::global()
            .class(cls_id)
            .ok_or(VmError::UnknownClass(cls_id))?
            .method(mthd_id)
            .ok_or(VmError::UnknownMethod(cls_id, mthd_id))?;

        self.invoke(called, receiver, ip, op_stack, stack_pos)
    }

    unsafe fn invoke(
        &mut self,
        called: &'static Method,
        receiver: *mut usize,
        ip: &mut i64,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        if options().jit && (called.native_code().is_some() || jit::compile(called)) {
            self.process_jit_call(called, receiver, ip, op_stack, stack_pos)
        } else {
            self.process_interpreted_call(called, receiver, ip);
            Ok(())
        }
    }

    unsafe fn process_interpreted_call(
        &mut self,
        called: &'static Method,
        receiver: *mut usize,
        ip: &mut i64,
    ) {
        let frame = FramePool::acquire(called, receiver);
        *self.frame_cell() = frame;
        *ip = 0;
    }

    unsafe fn process_jit_call(
        &mut self,
        called: &'static Method,
        receiver: *mut usize,
        ip: &mut i64,
        op_stack: *mut usize,
        stack_pos: *mut i64,
    ) -> VmResult<()> {
        let frame = FramePool::acquire(called, receiver);
        *self.frame_cell() = frame;

        let status = jit::execute(
            called,
            receiver,
            op_stack,
            stack_pos,
            self.call_stack_ptr(),
            self.call_stack_pos_ptr(),
            frame,
        );
        if status < 0 {
            return Err(match status {
                jit::STATUS_NIL => VmError::NilDeref,
                jit::STATUS_BOUNDS_LOW | jit::STATUS_BOUNDS_HIGH => VmError::IndexBounds {
                    index: -1,
                    size: -1,
                },
                jit::STATUS_DIV_ZERO => VmError::DivideByZero,
                other => VmError::Runtime(format!("native code failed with status {other}")),
            });
        }

        // restore the caller
        FramePool::release(frame);
        let frame = self.pop_frame()?;
        *self.frame_cell() = frame;
        *ip = (*frame).ip;
        Ok(())
    }

    unsafe fn resolve_virtual(
        &mut self,
        called: &'static Method,
        receiver: *mut usize,
    ) -> VmResult<&'static Method> {
        let impl_class = MemoryManager::class_of(receiver).ok_or(VmError::NilDeref)?;
        let program = Program::global();
        let ending = called.name_ending();

        let key = format!("{}{}", impl_class.name(), ending);
        if let Some(entry) = DISPATCH_CACHE.get(&key) {
            let (cls_id, mthd_id) = *entry;
            CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            return program
                .class(cls_id)
                .and_then(|c| c.method(mthd_id))
                .ok_or(VmError::UnknownMethod(cls_id, mthd_id));
        }

        HIERARCHY_WALKS.fetch_add(1, Ordering::Relaxed);
        let mut cls = impl_class;
        loop {
            let name = format!("{}{}", cls.name(), ending);
            if let Some(method) = cls.method_by_name(&name) {
                DISPATCH_CACHE.insert(key, (method.cls_id(), method.id()));
                tracing::trace!(from = called.name(), to = name, "bound virtual method");
                return Ok(method);
            }
            cls = program
                .class(cls.parent_id())
                .ok_or_else(|| VmError::Runtime(format!("unresolved virtual call {name}")))?;
        }
    }
}
