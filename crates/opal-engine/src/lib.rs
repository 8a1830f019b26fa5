//! Opal VM execution core
//!
//! The runtime for a statically-typed, class-based object language:
//! - a switch-dispatch stack interpreter over a linear instruction stream,
//! - a one-pass template JIT for x86-64 that lowers hot methods into
//!   executable pages,
//! - and the call boundary tying them together, so native code and the
//!   interpreter execute the same activation records, operand stacks, and
//!   trap conventions interchangeably.
//!
//! Bytecode parsing, class loading, collector internals, and the standard
//! libraries live outside this crate; the program image arrives fully
//! formed through [`Program::install`] and execution starts with an
//! [`Interpreter`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]

pub mod frame;
pub mod interp;
pub mod jit;
pub mod memory;
pub mod program;
pub mod stack;
pub mod sync;
pub mod trap;
pub mod value;

pub use frame::{Frame, FrameMonitor, FramePool, CALL_STACK_SIZE, FRAME_CACHE_SIZE, LOCAL_SIZE};
pub use interp::{
    configure, dispatch_cache_stats, halt_all, interpreter_count, InstructionHook, Interpreter,
    VmOptions, LIB_PATH_ENV,
};
pub use memory::{AllocKind, MemoryManager};
pub use program::{Class, Instruction, MemRef, Method, Opcode, Program};
pub use trap::{PlatformTrap, TrapProcessor};

// Re-export the SDK surface (canonical definitions live in opal-sdk)
pub use opal_sdk::{ValueKind, VmContext};

/// VM runtime errors.
///
/// Most variants are fatal when they reach the dispatch loop: the
/// interpreter prints an unwound call trace and terminates (or halts under
/// the halt-on-error option). Compilation fallback and unparseable-number
/// conversions are handled before an error is ever constructed.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Field access, element access, or call on a nil reference.
    #[error("attempting to dereference a 'Nil' memory instance")]
    NilDeref,

    /// Computed array index outside the element count.
    #[error("index out of bounds: {index},{size}")]
    IndexBounds {
        /// The offending linear index.
        index: i64,
        /// The array's element count.
        size: i64,
    },

    /// Checked cast of a non-nil reference that fails the hierarchy test.
    #[error("invalid object cast: '{from}' to '{to}'")]
    InvalidCast {
        /// Runtime class of the reference.
        from: String,
        /// Requested target class.
        to: String,
    },

    /// Integer division or remainder with a zero divisor.
    #[error("division by zero")]
    DivideByZero,

    /// Call-stack overflow or underflow.
    #[error("call stack bounds have been exceeded")]
    CallStackBounds,

    /// Instruction referenced a class id missing from the image.
    #[error("unknown class id {0}")]
    UnknownClass(i64),

    /// Instruction referenced a method id missing from its class.
    #[error("unknown method id {0},{1}")]
    UnknownMethod(i64, i64),

    /// OS thread creation failed.
    #[error("unable to create runtime thread")]
    ThreadSpawn,

    /// OS thread join failed or was repeated.
    #[error("unable to join thread")]
    ThreadJoin,

    /// Shared object missing or its lifecycle entry unresolved.
    #[error("runtime error loading shared library: {0}")]
    LibraryLoad(String),

    /// Named library function unresolved.
    #[error("runtime error calling function: {0}")]
    LibrarySymbol(String),

    /// Trap id outside the platform table.
    #[error("unrecognized trap id {0}")]
    UnknownTrap(i64),

    /// Anything else that stops execution.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// VM execution result.
pub type VmResult<T> = Result<T, VmError>;
