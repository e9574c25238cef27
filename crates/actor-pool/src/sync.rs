//! Bit-packed pool synchronizer.
//!
//! All pool-global coordination state lives in a single 64-bit atomic word so
//! that logically coupled updates (worker count + lifecycle, stamp + write
//! bit) commit with one compare-and-set. Splitting the fields into separate
//! atomics would reopen the race windows this layout closes.
//!
//! ## Word layout
//!
//! ```text
//! bit  63     : mutex bit (non-reentrant spin lock)
//! bits 62-61  : lifecycle (0 = running, 1 = terminating, 2 = terminated)
//! bit  60     : stamp write bit, set while the worker array is mid-mutation
//! bits 59-32  : 28-bit stamp counter, monotonic modulo 2^28
//! bits 31-0   : current worker count
//! ```
//!
//! Readers of the worker array snapshot the stamp, read, and re-validate;
//! a set write bit or a changed stamp means the array moved under them and
//! the traversal restarts. This keeps the hot read path free of locks.
//!
//! The synchronizer also owns the termination wait-set: threads blocked in
//! `await_termination` register an unparker here and are released when the
//! last worker retires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_utils::sync::Unparker;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;

const LOCK_BIT: u64 = 1 << 63;

const LIFECYCLE_SHIFT: u32 = 61;
const LIFECYCLE_MASK: u64 = 0b11 << LIFECYCLE_SHIFT;
const LC_RUNNING: u64 = 0;
const LC_TERMINATING: u64 = 1 << LIFECYCLE_SHIFT;
const LC_TERMINATED: u64 = 2 << LIFECYCLE_SHIFT;

const WRITE_BIT: u64 = 1 << 60;

const STAMP_SHIFT: u32 = 32;
const STAMP_MASK: u64 = ((1 << 28) - 1) << STAMP_SHIFT;
const STAMP_ONE: u64 = 1 << STAMP_SHIFT;

const COUNT_MASK: u64 = u32::MAX as u64;

/// Pool lifecycle. Transitions are one-way: running -> terminating ->
/// terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Terminating,
    Terminated,
}

fn lifecycle_of(word: u64) -> Lifecycle {
    match word & LIFECYCLE_MASK {
        LC_RUNNING => Lifecycle::Running,
        LC_TERMINATING => Lifecycle::Terminating,
        _ => Lifecycle::Terminated,
    }
}

/// Advance the stamp field without disturbing the other fields.
fn bump_stamp(word: u64) -> u64 {
    let stamp = (word & STAMP_MASK).wrapping_add(STAMP_ONE) & STAMP_MASK;
    (word & !STAMP_MASK) | stamp
}

// ---------------------------------------------------------------------------
// PoolSync
// ---------------------------------------------------------------------------

/// The pool synchronizer word plus the termination wait-set.
pub(crate) struct PoolSync {
    word: AtomicU64,
    /// Threads parked in `await_termination`, keyed so they can deregister.
    waiters: Mutex<Vec<(u64, Unparker)>>,
}

impl PoolSync {
    pub(crate) fn new() -> Self {
        PoolSync {
            word: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        lifecycle_of(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn worker_count(&self) -> u32 {
        (self.word.load(Ordering::Acquire) & COUNT_MASK) as u32
    }

    // -- mutex bit ----------------------------------------------------------

    /// Acquire the mutex bit. Non-reentrant: a thread that already holds it
    /// will deadlock against itself.
    pub(crate) fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            let w = self.word.load(Ordering::Relaxed);
            if w & LOCK_BIT == 0
                && self
                    .word
                    .compare_exchange_weak(w, w | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    pub(crate) fn unlock(&self) {
        self.word.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    // -- stamp --------------------------------------------------------------

    /// Snapshot the stamp for an optimistic worker-array read. Returns
    /// `None` while a mutation is in flight (write bit set).
    pub(crate) fn stamp(&self) -> Option<u64> {
        let w = self.word.load(Ordering::Acquire);
        if w & WRITE_BIT != 0 {
            None
        } else {
            Some(w & STAMP_MASK)
        }
    }

    /// True if no array mutation started or completed since `stamp` was
    /// taken.
    pub(crate) fn validate(&self, stamp: u64) -> bool {
        let w = self.word.load(Ordering::Acquire);
        w & WRITE_BIT == 0 && w & STAMP_MASK == stamp
    }

    /// Mark the start of a worker-array mutation. Caller holds the mutex bit.
    pub(crate) fn begin_array_mutation(&self) {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(bump_stamp(w) | WRITE_BIT)
            })
            .ok();
    }

    /// Mark the end of a worker-array mutation. Caller holds the mutex bit.
    pub(crate) fn end_array_mutation(&self) {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(bump_stamp(w) & !WRITE_BIT)
            })
            .ok();
    }

    // -- worker count -------------------------------------------------------

    /// Register a newly started worker. Caller holds the mutex bit, which
    /// bounds the count well below the 32-bit field.
    pub(crate) fn increment_workers(&self) -> u32 {
        let prev = self.word.fetch_add(1, Ordering::AcqRel);
        (prev & COUNT_MASK) as u32 + 1
    }

    /// Deregister a retiring worker. When the last worker of a terminating
    /// pool retires, the lifecycle flips to terminated in the same CAS and
    /// every termination waiter is released. Returns true if this call
    /// performed the terminated transition.
    pub(crate) fn retire_worker(&self) -> bool {
        loop {
            let w = self.word.load(Ordering::Acquire);
            let count = w & COUNT_MASK;
            debug_assert!(count > 0, "retire_worker with zero workers");
            let last = count == 1 && lifecycle_of(w) == Lifecycle::Terminating;
            let mut new = w - 1;
            if last {
                new = (new & !LIFECYCLE_MASK) | LC_TERMINATED;
            }
            if self
                .word
                .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if last {
                    self.wake_waiters();
                }
                return last;
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// running -> terminating. Returns true if this call made the transition.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if lifecycle_of(w) == Lifecycle::Running {
                    Some((w & !LIFECYCLE_MASK) | LC_TERMINATING)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// terminating + zero workers -> terminated. Covers the case where
    /// shutdown arrives before any worker was ever started; the normal path
    /// is the last worker's `retire_worker` CAS.
    pub(crate) fn try_finalize(&self) -> bool {
        let done = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if lifecycle_of(w) == Lifecycle::Terminating && w & COUNT_MASK == 0 {
                    Some((w & !LIFECYCLE_MASK) | LC_TERMINATED)
                } else {
                    None
                }
            })
            .is_ok();
        if done {
            self.wake_waiters();
        }
        done
    }

    // -- termination wait-set -----------------------------------------------

    pub(crate) fn register_waiter(&self, id: u64, unparker: Unparker) {
        self.waiters.lock().push((id, unparker));
    }

    pub(crate) fn deregister_waiter(&self, id: u64) {
        self.waiters.lock().retain(|(wid, _)| *wid != id);
    }

    fn wake_waiters(&self) {
        for (_, unparker) in self.waiters.lock().drain(..) {
            unparker.unpark();
        }
    }
}

// ---------------------------------------------------------------------------
// PoolLimits
// ---------------------------------------------------------------------------

/// Core and maximum pool sizes packed into one word so both can be read or
/// replaced as a unit: `{maximum:32 | core:32}`.
pub(crate) struct PoolLimits {
    word: AtomicU64,
}

impl PoolLimits {
    pub(crate) fn new(core: u32, max: u32) -> Self {
        PoolLimits {
            word: AtomicU64::new(pack_limits(core, max)),
        }
    }

    /// Returns `(core, maximum)`.
    pub(crate) fn load(&self) -> (u32, u32) {
        let w = self.word.load(Ordering::Acquire);
        (w as u32, (w >> 32) as u32)
    }

    pub(crate) fn core_size(&self) -> u32 {
        self.load().0
    }

    pub(crate) fn max_size(&self) -> u32 {
        self.load().1
    }

    pub(crate) fn set_core(&self, core: u32) {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(pack_limits(core, (w >> 32) as u32))
            })
            .ok();
    }

    pub(crate) fn set_max(&self, max: u32) {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some(pack_limits(w as u32, max))
            })
            .ok();
    }
}

fn pack_limits(core: u32, max: u32) -> u64 {
    ((max as u64) << 32) | core as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let sync = PoolSync::new();
        assert_eq!(sync.lifecycle(), Lifecycle::Running);
        assert_eq!(sync.worker_count(), 0);
        assert!(sync.stamp().is_some());
    }

    #[test]
    fn test_lifecycle_one_way() {
        let sync = PoolSync::new();
        assert!(sync.begin_shutdown());
        assert_eq!(sync.lifecycle(), Lifecycle::Terminating);
        // Second shutdown is a no-op.
        assert!(!sync.begin_shutdown());
        assert!(sync.try_finalize());
        assert_eq!(sync.lifecycle(), Lifecycle::Terminated);
        // Finalize is idempotent-failing once terminated.
        assert!(!sync.try_finalize());
        assert!(!sync.begin_shutdown());
    }

    #[test]
    fn test_finalize_requires_zero_workers() {
        let sync = PoolSync::new();
        sync.increment_workers();
        sync.begin_shutdown();
        assert!(!sync.try_finalize());
        assert_eq!(sync.lifecycle(), Lifecycle::Terminating);
    }

    #[test]
    fn test_last_retirement_terminates() {
        let sync = PoolSync::new();
        sync.increment_workers();
        sync.increment_workers();
        sync.begin_shutdown();

        assert!(!sync.retire_worker());
        assert_eq!(sync.lifecycle(), Lifecycle::Terminating);
        assert!(sync.retire_worker());
        assert_eq!(sync.lifecycle(), Lifecycle::Terminated);
        assert_eq!(sync.worker_count(), 0);
    }

    #[test]
    fn test_retirement_while_running_keeps_lifecycle() {
        let sync = PoolSync::new();
        sync.increment_workers();
        assert!(!sync.retire_worker());
        assert_eq!(sync.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn test_stamp_invalidated_by_mutation() {
        let sync = PoolSync::new();
        let stamp = sync.stamp().expect("no mutation in flight");
        assert!(sync.validate(stamp));

        sync.lock();
        sync.begin_array_mutation();
        // Mid-mutation: snapshots are refused and old stamps fail.
        assert!(sync.stamp().is_none());
        assert!(!sync.validate(stamp));
        sync.end_array_mutation();
        sync.unlock();

        assert!(!sync.validate(stamp), "stamp must advance across a mutation");
        let fresh = sync.stamp().unwrap();
        assert!(sync.validate(fresh));
    }

    #[test]
    fn test_mutation_does_not_clobber_count() {
        let sync = PoolSync::new();
        sync.increment_workers();
        sync.increment_workers();
        sync.lock();
        sync.begin_array_mutation();
        sync.end_array_mutation();
        sync.unlock();
        assert_eq!(sync.worker_count(), 2);
    }

    #[test]
    fn test_mutex_excludes() {
        let sync = Arc::new(PoolSync::new());
        let shared = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sync = Arc::clone(&sync);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        sync.lock();
                        // Non-atomic read-modify-write under the lock.
                        let v = shared.load(Ordering::Relaxed);
                        shared.store(v + 1, Ordering::Relaxed);
                        sync.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_waiters_woken_on_terminate() {
        let sync = Arc::new(PoolSync::new());
        sync.increment_workers();
        sync.begin_shutdown();

        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let parker = crossbeam_utils::sync::Parker::new();
                sync.register_waiter(7, parker.unparker().clone());
                while sync.lifecycle() != Lifecycle::Terminated {
                    parker.park();
                }
                sync.deregister_waiter(7);
            })
        };

        // Give the waiter a moment to park, then retire the last worker.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(sync.retire_worker());
        waiter.join().unwrap();
    }

    #[test]
    fn test_limits_pack_unpack() {
        let limits = PoolLimits::new(2, 8);
        assert_eq!(limits.load(), (2, 8));
        assert_eq!(limits.core_size(), 2);
        assert_eq!(limits.max_size(), 8);

        limits.set_core(4);
        assert_eq!(limits.load(), (4, 8));
        limits.set_max(16);
        assert_eq!(limits.load(), (4, 16));
    }
}
