//! Per-actor task queue.
//!
//! Every actor key maps to one `ActorQueue`: a FIFO task sequence plus a
//! 32-bit state word combining the pending-task count with the `running` and
//! `removed` flags. Packing the three fields into one word lets submitters,
//! the owning worker, and a stealer coordinate with single CAS operations
//! instead of a per-submission lock.
//!
//! ## State word layout
//!
//! ```text
//! bit  31    : removed -- unlinked from the registry, accepts nothing more
//! bit  30    : running -- a worker is executing a task for this actor
//! bits 29-0  : count of enqueued-but-not-yet-started tasks
//! ```
//!
//! At most one of `running` and `removed` is set at a time, except that a
//! `shutdown_now` drain preserves a concurrent `running` bit until the task
//! in flight finishes.
//!
//! ## Reserve-then-append
//!
//! `add` reserves a count slot with a CAS *before* linking the payload into
//! the sequence. A consumer that wins the matching count decrement may
//! therefore observe an empty sequence for a tiny window and must spin until
//! the submitter's append lands (or the queue is drained out from under it).
//!
//! ## Ownership handoff
//!
//! The `owner` field holds the token of the worker currently responsible for
//! this actor (0 = unassigned). Every transition is a CAS except the steal
//! handoff, which is a plain store: the thief already holds the claimed task
//! (`running` is set), so no rival transition can race it.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::pool::PanicHandler;

/// A unit of work submitted to the pool. Fire-and-forget: results, if any,
/// travel through whatever channel the task closes over.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The actor registry: key -> live queue. Removal is compare-and-remove so a
/// concurrently recreated queue for the same key is never lost.
pub(crate) type Registry<K> = RwLock<FxHashMap<K, Arc<ActorQueue<K>>>>;

const REMOVED: u32 = 1 << 31;
const RUNNING: u32 = 1 << 30;
const COUNT_MASK: u32 = RUNNING - 1;

/// One enqueued task plus the per-queue sequence number used for
/// best-effort removal in the submission/shutdown race.
pub(crate) struct TaskCell {
    seq: u64,
    task: Task,
}

/// Outcome of a worker asking the queue for its next task.
pub(crate) enum NextTask {
    /// A task was claimed; `running` is now set and the cell belongs to the
    /// caller.
    Found(TaskCell),
    /// Another worker is mid-batch on this actor; try again later.
    NotReady,
    /// Nothing left. The queue is (now) removed and unlinked.
    Empty,
}

/// Why an `add` was refused. The task is handed back so the submitter can
/// retry against a fresh queue.
pub(crate) enum AddError {
    /// The queue was removed before the task could be linked.
    Removed(Task),
    /// The 30-bit pending count would overflow.
    Capacity(Task),
}

// ---------------------------------------------------------------------------
// ActorQueue
// ---------------------------------------------------------------------------

pub(crate) struct ActorQueue<K> {
    key: K,
    state: AtomicU32,
    tasks: Mutex<VecDeque<TaskCell>>,
    next_seq: AtomicU64,
    /// Token of the owning worker, 0 if unassigned.
    owner: AtomicU64,
}

impl<K: Eq + std::hash::Hash> ActorQueue<K> {
    /// Create a queue already holding `task` as its first entry, as the
    /// submission path does for a brand-new actor. Returns the sequence
    /// number of the initial task for the shutdown-race removal path.
    pub(crate) fn with_task(key: K, task: Task) -> (Arc<Self>, u64) {
        let mut tasks = VecDeque::new();
        tasks.push_back(TaskCell { seq: 0, task });
        let queue = ActorQueue {
            key,
            state: AtomicU32::new(1),
            tasks: Mutex::new(tasks),
            next_seq: AtomicU64::new(1),
            owner: AtomicU64::new(0),
        };
        (Arc::new(queue), 0)
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) & REMOVED != 0
    }

    /// Number of enqueued-but-not-yet-started tasks.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> u32 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    // -- owner handoff ------------------------------------------------------

    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn try_set_owner(&self, prev: u64, next: u64) -> bool {
        self.owner
            .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Steal handoff: the thief holds the claimed task, so a plain store is
    /// safe and cheaper than a CAS.
    pub(crate) fn set_owner(&self, next: u64) {
        self.owner.store(next, Ordering::Release);
    }

    // -- add ----------------------------------------------------------------

    /// Reserve a count slot, then link the task into the sequence.
    pub(crate) fn add(&self, task: Task) -> Result<u64, AddError> {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & REMOVED != 0 {
                return Err(AddError::Removed(task));
            }
            if s & COUNT_MASK == COUNT_MASK {
                return Err(AddError::Capacity(task));
            }
            if self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().push_back(TaskCell { seq, task });

        // A shutdown_now drain may have marked the queue removed between the
        // reservation and the append. If our cell is still linked, take it
        // back and report the rejection; if the drain already collected it,
        // the submission stands -- the task will be handed back to the
        // drainer's caller.
        if self.state.load(Ordering::Acquire) & REMOVED != 0 {
            let mut tasks = self.tasks.lock();
            if let Some(pos) = tasks.iter().position(|c| c.seq == seq) {
                let cell = tasks.remove(pos).expect("position within bounds");
                return Err(AddError::Removed(cell.task));
            }
        }
        Ok(seq)
    }

    // -- worker side --------------------------------------------------------

    /// Claim the next task, or report why none is available. On the
    /// empty-queue transition the queue marks itself removed and unlinks
    /// from `registry`.
    pub(crate) fn next_task(&self, registry: &Registry<K>) -> NextTask {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & REMOVED != 0 {
                return NextTask::Empty;
            }
            if s & RUNNING != 0 {
                return NextTask::NotReady;
            }
            if s & COUNT_MASK > 0 {
                if self
                    .state
                    .compare_exchange_weak(s, (s - 1) | RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    match self.take_front() {
                        Some(cell) => return NextTask::Found(cell),
                        None => {
                            // Drained while we spun on the append window.
                            self.clear_running();
                            return NextTask::Empty;
                        }
                    }
                }
            } else if self
                .state
                .compare_exchange_weak(s, REMOVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.unlink(registry);
                return NextTask::Empty;
            }
        }
    }

    /// Pop the head of the sequence, spinning across the submitter's
    /// reserve-then-append window. Gives up only if the queue is drained
    /// out from under the reservation.
    fn take_front(&self) -> Option<TaskCell> {
        let backoff = Backoff::new();
        loop {
            if let Some(cell) = self.tasks.lock().pop_front() {
                return Some(cell);
            }
            if self.state.load(Ordering::Acquire) & REMOVED != 0 {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Execute a claimed task, then release the `running` flag. A panicking
    /// task is routed to the pool's panic handler; it taints neither the
    /// actor nor the worker.
    pub(crate) fn run_task(&self, cell: TaskCell, panic_handler: &PanicHandler) {
        let result = panic::catch_unwind(AssertUnwindSafe(cell.task));
        self.clear_running();
        if let Err(payload) = result {
            panic_handler(payload);
        }
    }

    fn clear_running(&self) {
        let prev = self.state.fetch_and(!RUNNING, Ordering::AcqRel);
        debug_assert!(prev & RUNNING != 0, "running flag already clear");
    }

    // -- removal ------------------------------------------------------------

    /// Best-effort cancellation used when a submission races shutdown. Pulls
    /// the cell out of the sequence and releases its count reservation. If a
    /// consumer already claimed the reservation the cell is re-linked at the
    /// front for it and the removal fails.
    pub(crate) fn remove(&self, registry: &Registry<K>, seq: u64) -> bool {
        let cell = {
            let mut tasks = self.tasks.lock();
            match tasks.iter().position(|c| c.seq == seq) {
                Some(pos) => tasks.remove(pos).expect("position within bounds"),
                None => return false,
            }
        };

        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & REMOVED != 0 {
                // Drained or retired; the cell is ours to discard.
                return true;
            }
            if s & COUNT_MASK == 0 {
                // A consumer claimed the reservation and is spinning for the
                // payload. Give the cell back and report failure.
                self.tasks.lock().push_front(cell);
                return false;
            }
            if self
                .state
                .compare_exchange_weak(s, s - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let now = s - 1;
                if now & (COUNT_MASK | RUNNING) == 0 {
                    // Removing the last pending task retires the queue.
                    if self
                        .state
                        .compare_exchange(now, REMOVED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.unlink(registry);
                    }
                }
                return true;
            }
        }
    }

    /// Take every pending task in FIFO order and retire the queue. Used by
    /// `shutdown_now` with the pool mutex held. The removed marker goes up
    /// first so no poller can livelock against a producer mid-drain.
    pub(crate) fn drain(&self, registry: &Registry<K>) -> Vec<Task> {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & REMOVED != 0 {
                return Vec::new();
            }
            // Preserve a concurrent running bit; its owner clears it when the
            // in-flight task finishes.
            if self
                .state
                .compare_exchange_weak(s, REMOVED | (s & RUNNING), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.unlink(registry);
        self.tasks.lock().drain(..).map(|cell| cell.task).collect()
    }

    /// Compare-and-remove this exact queue from the registry. A fresh queue
    /// registered under the same key is left alone.
    pub(crate) fn unlink(&self, registry: &Registry<K>) {
        let mut map = registry.write();
        if let Some(current) = map.get(&self.key) {
            if std::ptr::eq(Arc::as_ptr(current), self) {
                map.remove(&self.key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
