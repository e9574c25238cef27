//! Pool workers: one OS thread each, a local deque of actor queues, and a
//! bit-packed coordination word.
//!
//! ## Worker word layout
//!
//! ```text
//! bits 62-34 : 29-bit notification stamp
//! bits 33-32 : park state (0 = unparked, 1 = parked, 2 = woken)
//! bits 31-0  : index in the pool's worker array; all-ones marks a retired
//!              (nullified) worker that accepts no further actors
//! ```
//!
//! The stamp is bumped by every `try_notify`, so a worker that decided to
//! retire based on an older stamp fails its retirement CAS and rescans
//! instead of dropping the notification on the floor.
//!
//! ## Anti-lost-wakeup discipline
//!
//! `find_actor` searches twice: once before publishing the park flag, once
//! after. A submitter's `try_notify` always bumps the stamp and always
//! unparks -- effective whether the worker is parked or merely about to park
//! (the park token is banked). A worker that finds work on the second pass
//! clears its park flag and unconditionally passes the wake along to one
//! other worker; losing a wakeup here would strand a submission, so the
//! spurious unpark is the cheap side of the trade.
//!
//! ## Stealing
//!
//! An idle worker scans its peers starting just past its own array slot. It
//! walks each peer's deque from the tail (the owner works from the head),
//! pruning dead queues as it goes; the first claimable actor is moved into
//! the thief's deque with a plain owner store, which is safe because the
//! thief already holds the claimed task.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::{Backoff, CachePadded};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::pool::PoolShared;
use crate::queue::{ActorQueue, NextTask, Registry, TaskCell};
use crate::sync::Lifecycle;

const INDEX_MASK: u64 = u32::MAX as u64;

const PARK_SHIFT: u32 = 32;
const PARK_MASK: u64 = 0b11 << PARK_SHIFT;
const PARK_PARKED: u64 = 1 << PARK_SHIFT;
const PARK_WOKEN: u64 = 2 << PARK_SHIFT;

const STAMP_SHIFT: u32 = 34;
const STAMP_MASK: u64 = ((1u64 << 29) - 1) << STAMP_SHIFT;
const STAMP_ONE: u64 = 1 << STAMP_SHIFT;

fn bump_stamp(word: u64) -> u64 {
    let stamp = (word & STAMP_MASK).wrapping_add(STAMP_ONE) & STAMP_MASK;
    (word & !STAMP_MASK) | stamp
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub(crate) struct Worker<K> {
    /// Stable nonzero identity; this is what actor-queue owner fields hold.
    token: u64,
    word: CachePadded<AtomicU64>,
    /// Actor queues assigned to this worker. Only this worker mutates it,
    /// except for the steal protocol.
    deque: Mutex<VecDeque<Arc<ActorQueue<K>>>>,
    unparker: Unparker,
    /// Taken by the worker thread when its loop starts.
    parker: Mutex<Option<Parker>>,
}

impl<K> Worker<K> {
    pub(crate) fn new(index: u32) -> Self {
        static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        Worker {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            word: CachePadded::new(AtomicU64::new(index as u64)),
            deque: Mutex::new(VecDeque::new()),
            unparker,
            parker: Mutex::new(Some(parker)),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn word(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    pub(crate) fn index(&self) -> u32 {
        (self.word() & INDEX_MASK) as u32
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.word() & INDEX_MASK == INDEX_MASK
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.word() & PARK_MASK == PARK_PARKED
    }

    /// Update the index field after a swap-remove moved this worker. Called
    /// with the pool mutex held, so the slot cannot move again underneath.
    pub(crate) fn set_index(&self, index: u32) {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some((w & !INDEX_MASK) | index as u64)
            })
            .ok();
    }

    /// Notify this worker of new or reassigned work: bump the stamp (so any
    /// in-flight retirement decision is invalidated) and unpark. Fails only
    /// if the worker has been nullified.
    pub(crate) fn try_notify(&self) -> bool {
        let updated = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if w & INDEX_MASK == INDEX_MASK {
                    return None;
                }
                let mut new = bump_stamp(w);
                if new & PARK_MASK == PARK_PARKED {
                    new = (new & !PARK_MASK) | PARK_WOKEN;
                }
                Some(new)
            })
            .is_ok();
        if updated {
            // Effective whether the worker is parked or about to park: an
            // early unpark is banked and consumed by the next park call.
            self.unparker.unpark();
        }
        updated
    }

    /// Publish the intent to park. The caller must search once more after
    /// this before actually parking.
    fn transition_to_parked(&self) {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some((w & !PARK_MASK) | PARK_PARKED)
            })
            .ok();
    }

    /// Clear the park flag. Returns true if an unpark had landed while the
    /// flag was up (park state was `woken`).
    fn clear_park(&self) -> bool {
        let prev = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(w & !PARK_MASK));
        matches!(prev, Ok(w) if w & PARK_MASK == PARK_WOKEN)
    }

    /// Retire this worker: mark its index with the all-ones sentinel. Without
    /// `force` the CAS is guarded by the notification stamp -- if anything
    /// notified this worker after `snapshot` was taken, the retirement is
    /// abandoned so the notification cannot be lost.
    pub(crate) fn try_nullify(&self, snapshot: u64, force: bool) -> bool {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if w & INDEX_MASK == INDEX_MASK {
                    return None;
                }
                if !force && w & STAMP_MASK != snapshot & STAMP_MASK {
                    return None;
                }
                Some((w & STAMP_MASK) | INDEX_MASK)
            })
            .is_ok()
    }

    // -- deque --------------------------------------------------------------

    /// Remove a specific queue, searching from the tail (where assignment
    /// appended it). Returns false if a concurrent steal or unload already
    /// took it.
    pub(crate) fn remove_queue(&self, queue: &Arc<ActorQueue<K>>) -> bool {
        let mut deque = self.deque.lock();
        if let Some(pos) = deque.iter().rposition(|q| Arc::ptr_eq(q, queue)) {
            deque.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drain the deque; used by a retiring worker to unload its actors.
    pub(crate) fn take_queues(&self) -> Vec<Arc<ActorQueue<K>>> {
        self.deque.lock().drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn deque_len(&self) -> usize {
        self.deque.lock().len()
    }

}

impl<K: Eq + Hash> Worker<K> {
    /// Attach `queue` to this worker (assignment protocol step 4). Claims
    /// the queue's owner slot from `prev_owner` (or from unassigned, if an
    /// undo raced in between), appends it, and notifies. On a nullified
    /// worker the append is undone and false is returned so the caller can
    /// retry elsewhere.
    pub(crate) fn add(&self, queue: &Arc<ActorQueue<K>>, prev_owner: u64) -> bool {
        loop {
            let current = queue.owner();
            if current == prev_owner || current == 0 {
                if queue.try_set_owner(current, self.token) {
                    break;
                }
            } else {
                // Another worker claimed the actor first; that assignment
                // stands and this call reports success.
                return true;
            }
        }
        self.deque.lock().push_back(Arc::clone(queue));
        if self.try_notify() {
            return true;
        }
        self.remove_queue(queue);
        queue.try_set_owner(self.token, 0);
        false
    }
}

impl<K: Eq + Hash> Worker<K> {
    /// Walk the local deque head-to-tail looking for a claimable actor.
    /// Dead queues are dropped; a found queue rotates to the tail so the
    /// next round visits a different actor.
    fn find_local(&self, registry: &Registry<K>) -> Option<(Arc<ActorQueue<K>>, TaskCell)> {
        let mut remaining = self.deque.lock().len();
        while remaining > 0 {
            remaining -= 1;
            let queue = match self.deque.lock().pop_front() {
                Some(queue) => queue,
                None => break,
            };
            match queue.next_task(registry) {
                NextTask::Found(cell) => {
                    self.deque.lock().push_back(Arc::clone(&queue));
                    return Some((queue, cell));
                }
                NextTask::NotReady => self.deque.lock().push_back(queue),
                NextTask::Empty => {}
            }
        }
        None
    }

    /// Scan this worker's deque from the tail on behalf of `thief`. The
    /// first claimable actor is moved into the thief's deque; queues that
    /// report empty are pruned in place.
    pub(crate) fn try_steal_actor(
        &self,
        thief: &Worker<K>,
        registry: &Registry<K>,
    ) -> Option<(Arc<ActorQueue<K>>, TaskCell)> {
        let mut deque = self.deque.lock();
        let mut i = deque.len();
        while i > 0 {
            i -= 1;
            match deque[i].next_task(registry) {
                NextTask::Found(cell) => {
                    let queue = deque.remove(i).expect("index within bounds");
                    drop(deque);
                    // Plain-store handoff: the claimed task keeps every other
                    // contender out until the thief is fully wired up.
                    queue.set_owner(thief.token);
                    thief.deque.lock().push_back(Arc::clone(&queue));
                    return Some((queue, cell));
                }
                NextTask::Empty => {
                    deque.remove(i);
                }
                NextTask::NotReady => {}
            }
        }
        None
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Worker<K> {
    /// Try to steal a ready actor from a peer, validating the pool stamp
    /// around the scan and restarting on interference.
    fn steal(&self, shared: &PoolShared<K>) -> Option<(Arc<ActorQueue<K>>, TaskCell)> {
        let backoff = Backoff::new();
        loop {
            let stamp = match shared.sync.stamp() {
                Some(stamp) => stamp,
                None => {
                    // Worker array mid-mutation.
                    if backoff.is_completed() {
                        return None;
                    }
                    backoff.snooze();
                    continue;
                }
            };
            let workers: Vec<Arc<Worker<K>>> = shared.workers.read().clone();
            let n = workers.len();
            if n > 1 {
                let start = self.index() as usize % n;
                for offset in 1..=n {
                    let peer = &workers[(start + offset) % n];
                    if peer.token == self.token {
                        continue;
                    }
                    if let Some(found) = peer.try_steal_actor(self, &shared.registry) {
                        shared.steal_count.fetch_add(1, Ordering::Relaxed);
                        trace!("worker {} stole an actor from worker {}", self.token, peer.token);
                        return Some(found);
                    }
                }
            }
            if shared.sync.validate(stamp) {
                return None;
            }
            // The array moved mid-scan; rescan before concluding idle.
            if backoff.is_completed() {
                return None;
            }
            backoff.snooze();
        }
    }

    /// The double search of the park protocol: local find, steal, publish
    /// the park flag, then search both again so a racing submission cannot
    /// slip through unnoticed.
    fn find_actor(&self, shared: &PoolShared<K>) -> Option<(Arc<ActorQueue<K>>, TaskCell)> {
        if let Some(found) = self.find_local(&shared.registry) {
            return Some(found);
        }
        if let Some(found) = self.steal(shared) {
            return Some(found);
        }
        self.transition_to_parked();
        let second = self
            .find_local(&shared.registry)
            .or_else(|| self.steal(shared));
        if let Some(found) = second {
            self.clear_park();
            // Safety net: pass the wake along unconditionally. A spurious
            // unpark is cheap; a lost submission is not.
            shared.notify_other(self);
            return Some(found);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// The main loop of a worker thread.
///
/// 1. Snapshot the worker word (the retirement stamp guard).
/// 2. Find a ready actor (local, then steal, with the parked double-search).
/// 3. Run a bounded batch for it, then loop so other actors get a turn.
/// 4. Between batches, shed if the pool shrank below this worker.
/// 5. When idle: retire if shut down, over the maximum, or past keep-alive;
///    otherwise park (timed for non-core workers).
pub(crate) fn run<K>(shared: Arc<PoolShared<K>>, me: Arc<Worker<K>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    debug!("worker {} started at index {}", me.token(), me.index());
    let parker = me
        .parker
        .lock()
        .take()
        .expect("worker thread already running");
    let mut idle_since = Instant::now();

    loop {
        let snapshot = me.word();

        if let Some((queue, first)) = me.find_actor(&shared) {
            run_batch(&shared, &me, &queue, first);
            idle_since = Instant::now();

            // Shed when the maximum shrank below the live count. Only while
            // running: during shutdown the idle path retires cleanly.
            if shared.sync.lifecycle() == Lifecycle::Running
                && shared.sync.worker_count() > shared.limits.max_size()
                && retire(&shared, &me, snapshot, true)
            {
                break;
            }
            continue;
        }

        // Nothing to do anywhere; the park flag is up from the double search.
        let lifecycle = shared.sync.lifecycle();
        let (core, max) = shared.limits.load();
        let count = shared.sync.worker_count();
        let non_core = count > core;
        let over_max = count > max;
        let keep_alive = shared.keep_alive();
        let idle_for = idle_since.elapsed();
        let expired = non_core && idle_for >= keep_alive;

        if lifecycle != Lifecycle::Running || over_max || expired {
            if retire(&shared, &me, snapshot, over_max && lifecycle == Lifecycle::Running) {
                break;
            }
            // A notification raced the retirement decision; rescan.
            if me.clear_park() {
                shared.notify_other(&me);
            }
            continue;
        }

        if non_core {
            parker.park_timeout(keep_alive.saturating_sub(idle_for));
        } else {
            parker.park();
        }
        if me.clear_park() {
            // An unpark landed while parked: propagate it so a submission
            // burst wakes more than one worker.
            shared.notify_other(&me);
        }
    }

    debug!("worker {} retired", me.token());
}

/// Run up to `max_batch_size` tasks (bounded also by `max_batch_duration`)
/// for one actor before returning to the round-robin.
fn run_batch<K: Eq + Hash>(
    shared: &PoolShared<K>,
    me: &Worker<K>,
    queue: &Arc<ActorQueue<K>>,
    first: TaskCell,
) {
    shared.active_workers.fetch_add(1, Ordering::Relaxed);
    shared.batch_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let mut cell = first;
    let mut ran = 0usize;
    loop {
        queue.run_task(cell, &shared.panic_handler);
        shared.completed_count.fetch_add(1, Ordering::Relaxed);
        ran += 1;
        if ran >= shared.max_batch_size || started.elapsed() >= shared.max_batch_duration {
            break;
        }
        // Over-maximum shedding takes effect between tasks, not just
        // between batches.
        if shared.sync.worker_count() > shared.limits.max_size() {
            break;
        }
        match queue.next_task(&shared.registry) {
            NextTask::Found(next) => cell = next,
            NextTask::NotReady => break,
            NextTask::Empty => {
                me.remove_queue(queue);
                break;
            }
        }
    }
    shared.active_workers.fetch_sub(1, Ordering::Relaxed);
}

/// Retire `me`: nullify (stamp-guarded unless forced), swap it out of the
/// worker array, and reassign any actors still pinned to it. Returns false
/// if a notification invalidated the retirement.
fn retire<K>(shared: &Arc<PoolShared<K>>, me: &Arc<Worker<K>>, snapshot: u64, force: bool) -> bool
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    shared.sync.lock();
    // Re-validate eligibility under the mutex: several idle workers may have
    // seen the same surplus, and only so many of them get to leave.
    if shared.sync.lifecycle() == Lifecycle::Running {
        let (core, max) = shared.limits.load();
        let count = shared.sync.worker_count();
        let still_eligible = if force { count > max } else { count > core };
        if !still_eligible {
            shared.sync.unlock();
            return false;
        }
    }
    // The index is stable while the mutex is held.
    let index = me.index() as usize;
    if !me.try_nullify(snapshot, force) {
        shared.sync.unlock();
        return false;
    }
    shared.remove_worker(index);
    shared.sync.retire_worker();
    shared.sync.unlock();

    // Unload: every actor still held goes back through the assignment
    // protocol before this thread exits.
    for queue in me.take_queues() {
        let backoff = Backoff::new();
        loop {
            if queue.is_removed() {
                break;
            }
            if PoolShared::assign(shared, &queue, me.token(), true) {
                break;
            }
            if shared.sync.lifecycle() == Lifecycle::Terminated {
                log::error!("dropping orphaned actor queue during termination");
                break;
            }
            backoff.snooze();
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PanicHandler;
    use crate::queue::Registry;

    fn noop_handler() -> PanicHandler {
        Box::new(|_| {})
    }

    fn queue_with_tasks(key: u32, n: usize) -> (Arc<ActorQueue<u32>>, Registry<u32>) {
        let (queue, _) = ActorQueue::with_task(key, Box::new(|| {}));
        for _ in 1..n {
            queue.add(Box::new(|| {})).ok().expect("add to live queue");
        }
        let registry = Registry::default();
        registry.write().insert(key, Arc::clone(&queue));
        (queue, registry)
    }

    #[test]
    fn test_tokens_unique_and_nonzero() {
        let a: Worker<u32> = Worker::new(0);
        let b: Worker<u32> = Worker::new(1);
        assert_ne!(a.token(), 0);
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_index_field() {
        let w: Worker<u32> = Worker::new(3);
        assert_eq!(w.index(), 3);
        assert!(!w.is_retired());
        w.set_index(1);
        assert_eq!(w.index(), 1);
    }

    #[test]
    fn test_notify_bumps_stamp() {
        let w: Worker<u32> = Worker::new(0);
        let before = w.word();
        assert!(w.try_notify());
        let after = w.word();
        assert_ne!(before & STAMP_MASK, after & STAMP_MASK);
        assert_eq!(after & INDEX_MASK, 0, "index untouched by notify");
    }

    #[test]
    fn test_notify_marks_parked_worker_woken() {
        let w: Worker<u32> = Worker::new(0);
        w.transition_to_parked();
        assert!(w.is_parked());
        assert!(w.try_notify());
        assert_eq!(w.word() & PARK_MASK, PARK_WOKEN);
        assert!(w.clear_park(), "clear_park must report the consumed wake");
        assert_eq!(w.word() & PARK_MASK, 0);
    }

    #[test]
    fn test_nullify_stamp_guard() {
        let w: Worker<u32> = Worker::new(0);
        let snapshot = w.word();
        assert!(w.try_notify());
        // The notification bumped the stamp: an unforced retirement based on
        // the stale snapshot must fail.
        assert!(!w.try_nullify(snapshot, false));
        assert!(!w.is_retired());
        // Forced retirement ignores the stamp.
        assert!(w.try_nullify(snapshot, true));
        assert!(w.is_retired());
    }

    #[test]
    fn test_notify_after_nullify_fails() {
        let w: Worker<u32> = Worker::new(0);
        let snapshot = w.word();
        assert!(w.try_nullify(snapshot, false));
        assert!(!w.try_notify());
        // A retired worker cannot be retired twice.
        assert!(!w.try_nullify(w.word(), true));
    }

    #[test]
    fn test_add_assigns_owner_and_appends() {
        let w: Worker<u32> = Worker::new(0);
        let (queue, _registry) = queue_with_tasks(1, 2);
        assert!(w.add(&queue, 0));
        assert_eq!(queue.owner(), w.token());
        assert_eq!(w.deque_len(), 1);
    }

    #[test]
    fn test_add_to_retired_worker_undoes() {
        let w: Worker<u32> = Worker::new(0);
        w.try_nullify(w.word(), true);
        let (queue, _registry) = queue_with_tasks(2, 1);
        assert!(!w.add(&queue, 0));
        assert_eq!(queue.owner(), 0, "owner handoff must be rolled back");
        assert_eq!(w.deque_len(), 0);
    }

    #[test]
    fn test_add_respects_foreign_owner() {
        let w: Worker<u32> = Worker::new(0);
        let (queue, _registry) = queue_with_tasks(3, 1);
        queue.set_owner(99);
        // Someone else owns the actor: report success without touching it.
        assert!(w.add(&queue, 0));
        assert_eq!(queue.owner(), 99);
        assert_eq!(w.deque_len(), 0);
    }

    #[test]
    fn test_steal_moves_queue_to_thief() {
        let victim: Worker<u32> = Worker::new(0);
        let thief: Worker<u32> = Worker::new(1);
        let (queue, registry) = queue_with_tasks(4, 3);
        assert!(victim.add(&queue, 0));

        let (stolen, cell) = victim
            .try_steal_actor(&thief, &registry)
            .expect("claimable actor to steal");
        assert!(Arc::ptr_eq(&stolen, &queue));
        assert_eq!(queue.owner(), thief.token());
        assert_eq!(victim.deque_len(), 0);
        assert_eq!(thief.deque_len(), 1);

        // The stolen claim holds the running flag: the victim sees NotReady.
        assert!(matches!(queue.next_task(&registry), NextTask::NotReady));
        queue.run_task(cell, &noop_handler());
        assert!(matches!(queue.next_task(&registry), NextTask::Found(_)));
    }

    #[test]
    fn test_steal_prunes_dead_queues() {
        let victim: Worker<u32> = Worker::new(0);
        let thief: Worker<u32> = Worker::new(1);
        let (queue, registry) = queue_with_tasks(5, 1);
        assert!(victim.add(&queue, 0));

        // Exhaust the queue so the steal scan finds it dead.
        match queue.next_task(&registry) {
            NextTask::Found(cell) => queue.run_task(cell, &noop_handler()),
            _ => panic!("expected the seeded task"),
        }
        assert!(victim.try_steal_actor(&thief, &registry).is_none());
        assert_eq!(victim.deque_len(), 0, "dead queue must be pruned");
    }

    #[test]
    fn test_find_local_rotates() {
        let w: Worker<u32> = Worker::new(0);
        let (first, registry) = queue_with_tasks(6, 2);
        let (second, _) = ActorQueue::with_task(7u32, Box::new(|| {}));
        registry.write().insert(7, Arc::clone(&second));
        assert!(w.add(&first, 0));
        assert!(w.add(&second, 0));

        let (found, cell) = w.find_local(&registry).expect("claimable actor");
        assert!(Arc::ptr_eq(&found, &first));
        found.run_task(cell, &noop_handler());

        // The found queue rotated to the tail, so the other actor is next.
        let (next, cell) = w.find_local(&registry).expect("second actor's turn");
        assert!(Arc::ptr_eq(&next, &second));
        next.run_task(cell, &noop_handler());
    }
}
