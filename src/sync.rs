//! A small blocking counting semaphore for `writer_semaphore` (§5).
//!
//! No cooperative task runtime is assumed by the engine, so this is built
//! directly on `parking_lot::{Mutex, Condvar}` rather than an async
//! executor's semaphore — it blocks the calling thread, which is exactly
//! the synchronous model spec.md's concurrency section calls out as valid.

use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    state: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self { state: Mutex::new(permits), cond: Condvar::new() }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.state.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
        SemaphoreGuard { sem: self }
    }

    fn release(&self) {
        let mut permits = self.state.lock();
        *permits += 1;
        self.cond.notify_one();
    }
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}
