//! Writer exclusivity.
//!
//! Every append runs inside one exclusive critical section so serial
//! assignment and uniqueness checks are linearized. The section is
//! non-reentrant and scoped to a single publish.

use parking_lot::Mutex;
use std::time::Instant;
use tracing::trace;

/// Something that grants one writer at a time.
pub trait WriteLock: Send + Sync {
    /// Block until this caller is the only writer.
    fn acquire(&self) -> WriteGuard<'_>;
}

trait Held {}
impl<T> Held for T {}

/// Proof of exclusive write access. Released on drop.
pub struct WriteGuard<'a> {
    _held: Box<dyn Held + 'a>,
    acquired_at: Instant,
}

impl<'a> WriteGuard<'a> {
    /// Wrap whatever keeps the section held (a mutex guard, a file lock).
    pub fn new<G: 'a>(held: G) -> Self {
        Self {
            _held: Box::new(held),
            acquired_at: Instant::now(),
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        trace!(held_us = self.acquired_at.elapsed().as_micros() as u64, "write lock released");
    }
}

/// In-process writer lock.
#[derive(Default)]
pub struct ExclusiveWriteLock {
    mutex: Mutex<()>,
}

impl ExclusiveWriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking attempt, mostly for tests.
    pub fn try_acquire(&self) -> Option<WriteGuard<'_>> {
        self.mutex.try_lock().map(WriteGuard::new)
    }
}

impl WriteLock for ExclusiveWriteLock {
    fn acquire(&self) -> WriteGuard<'_> {
        WriteGuard::new(self.mutex.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exclusive() {
        let lock = ExclusiveWriteLock::new();
        let guard = lock.acquire();
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_one_writer_at_a_time() {
        let lock = Arc::new(ExclusiveWriteLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.acquire();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
