//! Synchronization registries backing the thread opcodes
//!
//! Bytecode stores plain word values inside objects: the `thread-mutex`
//! opcode leaves a mutex id in the receiver's second slot and the async call
//! leaves a thread id in the first. These registries map those ids back to
//! the live primitives. Ids are never reused; a mutex lives for the process,
//! a thread entry is consumed by the join that claims it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);
static MUTEXES: Lazy<DashMap<u64, Arc<RawMutex>>> = Lazy::new(DashMap::new);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static THREADS: Lazy<DashMap<u64, JoinHandle<()>>> = Lazy::new(DashMap::new);

/// Registry of the per-object mutexes used by `critical` regions.
pub struct MutexRegistry;

impl MutexRegistry {
    /// Create a mutex and return the id bytecode stores at `obj[1]`.
    pub fn create() -> u64 {
        let id = NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed);
        MUTEXES.insert(id, Arc::new(RawMutex::INIT));
        id
    }

    /// Block until the mutex is held. Unknown ids report failure.
    ///
    /// The mutex is not reentrant; a thread locking twice deadlocks, as the
    /// language manual warns.
    pub fn lock(id: u64) -> bool {
        let Some(mutex) = MUTEXES.get(&id).map(|m| m.clone()) else {
            return false;
        };
        mutex.lock();
        true
    }

    /// Release a held mutex. Unknown ids report failure.
    pub fn unlock(id: u64) -> bool {
        let Some(mutex) = MUTEXES.get(&id).map(|m| m.clone()) else {
            return false;
        };
        // Bytecode pairs this with a lock in the same critical region.
        unsafe { mutex.unlock() };
        true
    }

    /// Registered mutex count.
    pub fn count() -> usize {
        MUTEXES.len()
    }
}

/// Registry of joinable threads spawned by asynchronous method calls.
pub struct ThreadRegistry;

impl ThreadRegistry {
    /// Register a spawned thread and return the id bytecode stores at
    /// `obj[0]`.
    pub fn register(handle: JoinHandle<()>) -> u64 {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        THREADS.insert(id, handle);
        id
    }

    /// Claim the handle for a join. Each thread is joinable exactly once.
    pub fn take(id: u64) -> Option<JoinHandle<()>> {
        THREADS.remove(&id).map(|(_, handle)| handle)
    }
}
