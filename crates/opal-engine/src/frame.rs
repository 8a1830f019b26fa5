//! Activation frames and the process-wide frame pool
//!
//! A frame owns the local-variable memory for one method activation. Frames
//! are recycled through a mutex-guarded pool: acquisition binds a method and
//! receiver, release zeroes the local memory. JIT code reads and writes
//! frame fields directly (`jit_mem`/`jit_offset` publish the native local
//! area to the collector), so the layout is part of the interpreter/JIT
//! contract.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::program::Method;

/// Maximum call depth per thread.
pub const CALL_STACK_SIZE: usize = 1024;

/// Local-variable words per frame, including the receiver slot.
pub const LOCAL_SIZE: usize = 512;

/// Frames pre-populated into the pool at startup.
pub const FRAME_CACHE_SIZE: usize = 24;

/// One method activation.
pub struct Frame {
    /// The executing method.
    pub method: *const Method,
    /// Local memory; `mem[0]` holds the receiver (or class memory) for the
    /// duration of the call.
    pub mem: Box<[usize]>,
    /// Saved instruction pointer while a callee runs.
    pub ip: i64,
    /// Entered from native code; returns must unwind through the JIT caller.
    pub jit_called: bool,
    /// Base of the JIT local area while native code runs, null otherwise.
    pub jit_mem: *mut usize,
    /// Words of JIT locals currently holding collector-visible roots.
    pub jit_offset: i64,
}

impl Frame {
    fn empty() -> Self {
        Self {
            method: std::ptr::null(),
            mem: vec![0usize; LOCAL_SIZE].into_boxed_slice(),
            ip: -1,
            jit_called: false,
            jit_mem: std::ptr::null_mut(),
            jit_offset: 0,
        }
    }

    /// The method, which is always set while the frame is live.
    ///
    /// # Safety
    /// The frame must have been acquired and not yet released.
    #[inline(always)]
    pub unsafe fn method(&self) -> &'static Method {
        &*self.method
    }

    /// Base address of the local memory.
    #[inline(always)]
    pub fn mem_ptr(&mut self) -> *mut usize {
        self.mem.as_mut_ptr()
    }
}

/// Collector-visible descriptor of one thread's frame state. The garbage
/// collector walks the registered monitors to enumerate live roots.
pub struct FrameMonitor {
    /// The thread's call-stack array.
    pub call_stack: *mut *mut Frame,
    /// The thread's call-stack cursor.
    pub call_stack_pos: *mut i64,
    /// Address of the thread's current-frame pointer.
    pub cur_frame: *mut *mut Frame,
}

struct PooledFrame(*mut Frame);
// Frames hold no thread affinity; the pool mutex serializes hand-off.
unsafe impl Send for PooledFrame {}

static FRAME_POOL: Lazy<Mutex<Vec<PooledFrame>>> = Lazy::new(|| {
    let mut pool = Vec::with_capacity(FRAME_CACHE_SIZE);
    for _ in 0..FRAME_CACHE_SIZE {
        pool.push(PooledFrame(Box::into_raw(Box::new(Frame::empty()))));
        FRAMES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    }
    Mutex::new(pool)
});

static FRAMES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static FRAMES_IN_USE: AtomicUsize = AtomicUsize::new(0);

/// The process-wide frame cache.
pub struct FramePool;

impl FramePool {
    /// Take a frame, binding `method` and storing `receiver` in `mem[0]`.
    pub fn acquire(method: &Method, receiver: *mut usize) -> *mut Frame {
        let frame = {
            let mut pool = FRAME_POOL.lock();
            if pool.is_empty() {
                for _ in 0..CALL_STACK_SIZE {
                    pool.push(PooledFrame(Box::into_raw(Box::new(Frame::empty()))));
                    FRAMES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
                }
            }
            pool.pop().expect("pool refilled above").0
        };
        FRAMES_IN_USE.fetch_add(1, Ordering::Relaxed);

        unsafe {
            let f = &mut *frame;
            f.method = method as *const Method;
            f.mem[0] = receiver as usize;
            f.ip = -1;
            f.jit_called = false;
            f.jit_mem = std::ptr::null_mut();
            f.jit_offset = 0;
        }
        frame
    }

    /// Return a frame, zeroing its local memory.
    ///
    /// # Safety
    /// `frame` must have come from [`FramePool::acquire`] and must not be
    /// used afterwards.
    pub unsafe fn release(frame: *mut Frame) {
        {
            let f = &mut *frame;
            f.jit_mem = std::ptr::null_mut();
            f.mem.fill(0);
        }
        FRAMES_IN_USE.fetch_sub(1, Ordering::Relaxed);
        FRAME_POOL.lock().push(PooledFrame(frame));
    }

    /// Frames currently cached.
    pub fn cached_count() -> usize {
        FRAME_POOL.lock().len()
    }

    /// Frames ever allocated.
    pub fn allocated_count() -> usize {
        FRAMES_ALLOCATED.load(Ordering::Relaxed)
    }

    /// Frames handed out and not yet released.
    pub fn in_use_count() -> usize {
        FRAMES_IN_USE.load(Ordering::Relaxed)
    }
}
