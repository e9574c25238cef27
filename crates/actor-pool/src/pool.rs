//! The dispatcher: actor registry, worker pool, submission path, and
//! shutdown coordination.
//!
//! ## Design
//!
//! Tasks are grouped by an actor key. All tasks for one key run strictly in
//! submission order on whatever worker currently owns that actor's queue;
//! distinct actors run concurrently on distinct workers. Three properties
//! are balanced without a per-submission lock:
//!
//! 1. **Sequentiality** -- the actor queue's `running` flag admits one
//!    executing task per actor at a time.
//! 2. **Affinity** -- actors hash onto the core-worker subset and stay
//!    pinned to their worker until stolen, so placement is stable across
//!    transient auxiliary workers.
//! 3. **Balance** -- idle workers steal actors from busy peers, and when
//!    more actors are live than workers exist, auxiliary workers start (up
//!    to the maximum) and retire again after an idle keep-alive.
//!
//! The synchronizer's lock bit is the only pool-global mutex, held for
//! worker-array surgery and the `shutdown_now` drain. Per-task and
//! per-actor coordination is CAS on the dedicated state words; the short
//! mutexes on task sequences and worker deques guard container memory, not
//! the protocol.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::Parker;
use log::{debug, error};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::error::RejectedError;
use crate::queue::{ActorQueue, AddError, Registry, Task};
use crate::sync::{Lifecycle, PoolLimits, PoolSync};
use crate::worker::{self, Worker};

/// Handler for a panic escaping a task. Receives the panic payload; the
/// pool itself has already recovered by the time it runs.
pub type PanicHandler = Box<dyn Fn(Box<dyn Any + Send + 'static>) + Send + Sync>;

/// Worker indices are 32-bit with all-ones reserved as the retirement
/// sentinel, so the pool can never be configured past this.
const MAX_POOL_LIMIT: usize = (u32::MAX - 1) as usize;

fn default_parallelism() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// ThreadFactory
// ---------------------------------------------------------------------------

/// Creates the pool's worker threads. The pool is the sole caller and owns
/// every thread the factory hands back.
pub trait ThreadFactory: Send + Sync {
    /// Spawn a thread named `name` running `f` to completion.
    fn spawn(
        &self,
        name: String,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<thread::JoinHandle<()>>;
}

/// Default factory: `std::thread::Builder` with `actor-pool-worker-{n}`
/// names.
#[derive(Debug, Default)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(
        &self,
        name: String,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(f)
    }
}

fn default_panic_handler() -> PanicHandler {
    Box::new(|payload| {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "non-string panic payload"
        };
        error!("actor task panicked: {}", msg);
    })
}

// ---------------------------------------------------------------------------
// PoolShared
// ---------------------------------------------------------------------------

/// State shared by the pool handle, every worker thread, and submitters.
pub(crate) struct PoolShared<K> {
    pub(crate) sync: PoolSync,
    pub(crate) limits: PoolLimits,
    keep_alive_nanos: AtomicU64,
    pub(crate) max_batch_size: usize,
    pub(crate) max_batch_duration: Duration,
    pub(crate) registry: Registry<K>,
    /// The worker array. Structural changes happen under the synchronizer's
    /// mutex bit with the stamp write bit framing the swap-remove writes;
    /// readers validate the stamp instead of holding a lock across a scan.
    pub(crate) workers: RwLock<Vec<Arc<Worker<K>>>>,
    thread_factory: Box<dyn ThreadFactory>,
    pub(crate) panic_handler: PanicHandler,
    pub(crate) task_count: AtomicU64,
    pub(crate) completed_count: AtomicU64,
    pub(crate) batch_count: AtomicU64,
    pub(crate) steal_count: AtomicU64,
    pub(crate) active_workers: AtomicUsize,
    largest_pool_size: AtomicU32,
    worker_name_seq: AtomicU64,
}

impl<K> PoolShared<K> {
    pub(crate) fn keep_alive(&self) -> Duration {
        Duration::from_nanos(self.keep_alive_nanos.load(Ordering::Relaxed))
    }

    /// Wake one other idle worker, scanning round-robin from just past
    /// `from`'s slot. Used after an assignment so that a busy preferred
    /// worker can be relieved by a stealer.
    pub(crate) fn notify_other(&self, from: &Worker<K>) {
        let workers: Vec<Arc<Worker<K>>> = self.workers.read().clone();
        let n = workers.len();
        if n <= 1 {
            return;
        }
        let start = from.index() as usize % n;
        for offset in 1..=n {
            let candidate = &workers[(start + offset) % n];
            if candidate.token() == from.token() {
                continue;
            }
            if candidate.is_parked() && candidate.try_notify() {
                return;
            }
        }
    }

    fn notify_token(&self, token: u64) -> bool {
        let workers = self.workers.read();
        for candidate in workers.iter() {
            if candidate.token() == token {
                return candidate.try_notify();
            }
        }
        false
    }

    fn wake_all_workers(&self) {
        let workers: Vec<Arc<Worker<K>>> = self.workers.read().clone();
        for candidate in workers {
            candidate.try_notify();
        }
    }

    /// Swap-remove the worker at `index`, framed by the stamp write bit so
    /// concurrent array traversals detect the move. Caller holds the mutex
    /// bit. The worker swapped into the hole gets its index field updated
    /// by CAS, leaving its stamp and park state untouched.
    pub(crate) fn remove_worker(&self, index: usize) {
        self.sync.begin_array_mutation();
        let mut workers = self.workers.write();
        let last = workers.len() - 1;
        workers.swap_remove(index);
        if index < last {
            workers[index].set_index(index as u32);
        }
        drop(workers);
        self.sync.end_array_mutation();
    }

    /// running -> terminating, waking everything so drains can start. Safe
    /// to call repeatedly.
    fn shutdown_inner(&self) {
        if self.sync.begin_shutdown() {
            debug!("pool shutting down");
        }
        self.wake_all_workers();
        // A pool that never started a worker terminates on the spot.
        self.sync.try_finalize();
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> PoolShared<K> {
    // -- submission ---------------------------------------------------------

    pub(crate) fn submit(me: &Arc<Self>, key: K, task: Task) -> Result<(), RejectedError> {
        let mut slot = Some(task);
        loop {
            if me.sync.lifecycle() != Lifecycle::Running {
                return Err(RejectedError::Shutdown);
            }

            // Fast path: the actor already has a live queue.
            let existing = me.registry.read().get(&key).cloned();
            let (queue, created_seq) = match existing {
                Some(queue) => (queue, None),
                None => {
                    let mut map = me.registry.write();
                    match map.entry(key.clone()) {
                        Entry::Occupied(entry) => {
                            // Lost the creation race; use the winner's queue.
                            (Arc::clone(entry.get()), None)
                        }
                        Entry::Vacant(vacant) => {
                            let task = slot.take().expect("submission task present");
                            let (queue, seq) = ActorQueue::with_task(key.clone(), task);
                            vacant.insert(Arc::clone(&queue));
                            (queue, Some(seq))
                        }
                    }
                }
            };

            if let Some(seq) = created_seq {
                // We created the queue holding the task; wire it to a worker.
                me.task_count.fetch_add(1, Ordering::Relaxed);
                if Self::assign(me, &queue, 0, false) {
                    return Ok(());
                }
                // A simultaneous shutdown beat the assignment.
                if queue.remove(&me.registry, seq) {
                    me.task_count.fetch_sub(1, Ordering::Relaxed);
                    return Err(RejectedError::Shutdown);
                }
                // A shutdown_now drain claimed the task; it will be handed
                // back to the drainer, so the submission stands.
                return Ok(());
            }

            let task = slot.take().expect("submission task present");
            match queue.add(task) {
                Ok(seq) => {
                    me.task_count.fetch_add(1, Ordering::Relaxed);
                    return Self::after_add(me, &queue, seq);
                }
                Err(AddError::Removed(task)) => {
                    // The queue died under us; clear the stale registry
                    // entry (compare-and-remove is idempotent) and retry.
                    slot = Some(task);
                    queue.unlink(&me.registry);
                }
                Err(AddError::Capacity(_)) => return Err(RejectedError::QueueFull),
            }
        }
    }

    /// Post-append leg of the submission path: make sure some worker knows
    /// about the task, yielding through transient states (creator mid-
    /// assignment, owner mid-retirement) rather than blocking.
    fn after_add(me: &Arc<Self>, queue: &Arc<ActorQueue<K>>, seq: u64) -> Result<(), RejectedError> {
        loop {
            if me.sync.lifecycle() != Lifecycle::Running {
                if queue.remove(&me.registry, seq) {
                    me.task_count.fetch_sub(1, Ordering::Relaxed);
                    return Err(RejectedError::Shutdown);
                }
                // Already claimed by a worker or a drain.
                return Ok(());
            }
            if queue.is_removed() {
                // Consumed (or drained) before we could knock.
                return Ok(());
            }
            let owner = queue.owner();
            if owner == 0 {
                // The creating submitter is still assigning a worker.
                thread::yield_now();
                continue;
            }
            if me.notify_token(owner) {
                return Ok(());
            }
            // The owner retired; its unload is reassigning the queue.
            thread::yield_now();
        }
    }

    // -- assignment ---------------------------------------------------------

    /// Assign `queue` to a worker. `prev_owner` is the retiring or robbed
    /// worker during a reassignment (0 for a fresh actor); `force` pushes
    /// through a terminating pool so a retiring worker can unload.
    pub(crate) fn assign(
        me: &Arc<Self>,
        queue: &Arc<ActorQueue<K>>,
        prev_owner: u64,
        force: bool,
    ) -> bool {
        loop {
            Self::ensure_workers(me);
            if me.sync.lifecycle() != Lifecycle::Running && !force {
                return false;
            }
            let workers: Vec<Arc<Worker<K>>> = me.workers.read().clone();
            let n = workers.len();
            if n == 0 {
                if me.sync.lifecycle() != Lifecycle::Running {
                    return false;
                }
                // Worker start failed or raced a retirement; try again.
                thread::yield_now();
                continue;
            }
            // Hash onto the core subset: placement stays stable while
            // auxiliary workers come and go.
            let span = n.min((me.limits.core_size() as usize).max(1));
            let preferred = (hash_key(queue.key()) % span as u64) as usize;
            for offset in 0..n {
                let candidate = &workers[(preferred + offset) % n];
                if candidate.token() == prev_owner && n > 1 {
                    // Do not hand the actor straight back to the worker it
                    // is being moved away from.
                    continue;
                }
                if candidate.add(queue, prev_owner) {
                    me.notify_other(candidate);
                    return true;
                }
            }
            // Every candidate was nullified mid-assignment; the array is
            // churning underneath us.
            thread::yield_now();
        }
    }

    /// Top up the worker pool: core workers first, then auxiliaries while
    /// live actors outnumber workers, up to the maximum.
    fn ensure_workers(me: &Arc<Self>) {
        let (core, max) = me.limits.load();
        while me.sync.worker_count() < core.min(max) {
            if !Self::start_worker(me, true) {
                break;
            }
        }
        loop {
            let count = me.sync.worker_count();
            let live = me.registry.read().len();
            if count >= max || (count as usize) >= live {
                break;
            }
            if !Self::start_worker(me, false) {
                break;
            }
        }
    }

    /// Start one worker under the mutex. Returns false when the relevant
    /// limit is already met, the pool is shutting down, or the thread
    /// factory refuses.
    fn start_worker(me: &Arc<Self>, as_core: bool) -> bool {
        me.sync.lock();
        if me.sync.lifecycle() != Lifecycle::Running {
            me.sync.unlock();
            return false;
        }
        let (core, max) = me.limits.load();
        let count = me.sync.worker_count();
        let limit = if as_core { core.min(max) } else { max };
        if count >= limit {
            me.sync.unlock();
            return false;
        }

        let worker = Arc::new(Worker::new(count));
        me.workers.write().push(Arc::clone(&worker));
        let new_count = me.sync.increment_workers();
        if new_count > me.largest_pool_size.load(Ordering::Relaxed) {
            me.largest_pool_size.store(new_count, Ordering::Relaxed);
        }

        let name = format!(
            "actor-pool-worker-{}",
            me.worker_name_seq.fetch_add(1, Ordering::Relaxed)
        );
        let shared = Arc::clone(me);
        let handoff = Arc::clone(&worker);
        match me
            .thread_factory
            .spawn(name, Box::new(move || worker::run(shared, handoff)))
        {
            Ok(_handle) => {
                me.sync.unlock();
                true
            }
            Err(err) => {
                // Roll the registration back; the worker never ran.
                worker.try_nullify(worker.word(), true);
                me.workers.write().pop();
                me.sync.retire_worker();
                me.sync.unlock();
                error!("failed to start worker thread: {}", err);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and constructs an [`ActorPool`].
///
/// ```
/// use actor_pool::ActorPool;
/// use std::time::Duration;
///
/// let pool: ActorPool<u64> = ActorPool::<u64>::builder()
///     .core_pool_size(2)
///     .maximum_pool_size(4)
///     .keep_alive(Duration::from_millis(500))
///     .build();
/// # pool.shutdown();
/// ```
pub struct ActorPoolBuilder {
    core_pool_size: Option<usize>,
    maximum_pool_size: Option<usize>,
    keep_alive: Duration,
    max_batch_size: usize,
    max_batch_duration: Duration,
    thread_factory: Box<dyn ThreadFactory>,
    panic_handler: PanicHandler,
}

impl ActorPoolBuilder {
    fn new() -> Self {
        ActorPoolBuilder {
            core_pool_size: None,
            maximum_pool_size: None,
            keep_alive: Duration::from_secs(60),
            max_batch_size: 16,
            max_batch_duration: Duration::from_millis(1),
            thread_factory: Box::new(DefaultThreadFactory),
            panic_handler: default_panic_handler(),
        }
    }

    /// Workers that never retire due to idleness. Defaults to the number of
    /// available CPU cores.
    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = Some(size);
        self
    }

    /// Hard cap on workers, core plus auxiliary. Defaults to the core size.
    pub fn maximum_pool_size(mut self, size: usize) -> Self {
        self.maximum_pool_size = Some(size);
        self
    }

    /// How long a non-core worker lingers idle before retiring.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Most tasks one actor may run back-to-back before its worker moves on.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Wall-clock bound on a batch; caps tail latency for the other actors
    /// pinned to the same worker.
    pub fn max_batch_duration(mut self, duration: Duration) -> Self {
        self.max_batch_duration = duration;
        self
    }

    pub fn thread_factory<F: ThreadFactory + 'static>(mut self, factory: F) -> Self {
        self.thread_factory = Box::new(factory);
        self
    }

    /// Handler for panics escaping tasks; the default logs them. The pool
    /// and the actor both survive either way.
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send + 'static>) + Send + Sync + 'static,
    {
        self.panic_handler = Box::new(handler);
        self
    }

    /// Construct the pool. Workers start lazily on first submission.
    ///
    /// # Panics
    ///
    /// On invalid configuration: a zero maximum, a maximum below the core
    /// size, a zero batch size, or sizes beyond the 32-bit index space.
    pub fn build<K: Eq + Hash + Clone + Send + Sync + 'static>(self) -> ActorPool<K> {
        let core = self.core_pool_size.unwrap_or_else(|| {
            // Default to the CPU count, clamped under an explicit maximum.
            let cores = default_parallelism();
            match self.maximum_pool_size {
                Some(max) => cores.min(max),
                None => cores,
            }
        });
        let max = self.maximum_pool_size.unwrap_or_else(|| core.max(1));
        assert!(max >= 1, "maximum pool size must be at least 1");
        assert!(
            max >= core,
            "maximum pool size ({}) must not be below the core size ({})",
            max,
            core
        );
        assert!(max <= MAX_POOL_LIMIT, "pool size exceeds the index space");
        assert!(self.max_batch_size >= 1, "max batch size must be at least 1");

        let keep_alive_nanos = self.keep_alive.as_nanos().min(u64::MAX as u128) as u64;
        ActorPool {
            shared: Arc::new(PoolShared {
                sync: PoolSync::new(),
                limits: PoolLimits::new(core as u32, max as u32),
                keep_alive_nanos: AtomicU64::new(keep_alive_nanos),
                max_batch_size: self.max_batch_size,
                max_batch_duration: self.max_batch_duration,
                registry: Registry::default(),
                workers: RwLock::new(Vec::new()),
                thread_factory: self.thread_factory,
                panic_handler: self.panic_handler,
                task_count: AtomicU64::new(0),
                completed_count: AtomicU64::new(0),
                batch_count: AtomicU64::new(0),
                steal_count: AtomicU64::new(0),
                active_workers: AtomicUsize::new(0),
                largest_pool_size: AtomicU32::new(0),
                worker_name_seq: AtomicU64::new(0),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ActorPool
// ---------------------------------------------------------------------------

/// An actor-oriented thread pool.
///
/// Every submitted task belongs to an actor key `K`. Tasks for one actor run
/// strictly in submission order and never concurrently with each other;
/// distinct actors run in parallel across the worker pool, with idle workers
/// stealing actors from busy peers.
pub struct ActorPool<K> {
    shared: Arc<PoolShared<K>>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> ActorPool<K> {
    pub fn builder() -> ActorPoolBuilder {
        ActorPoolBuilder::new()
    }

    /// Fixed-size pool: core and maximum both `pool_size`. A size of 0 means
    /// one worker per available CPU core.
    pub fn new(pool_size: usize) -> Self {
        let size = if pool_size == 0 {
            default_parallelism()
        } else {
            pool_size
        };
        ActorPool::<K>::builder()
            .core_pool_size(size)
            .maximum_pool_size(size)
            .build()
    }

    /// Enqueue `task` for `actor`. Tasks for the same actor run in
    /// submission order; the call itself never blocks on task execution.
    pub fn submit<F>(&self, actor: K, task: F) -> Result<(), RejectedError>
    where
        F: FnOnce() + Send + 'static,
    {
        PoolShared::submit(&self.shared, actor, Box::new(task))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stop accepting work. Everything already accepted still runs; workers
    /// retire once drained.
    pub fn shutdown(&self) {
        self.shared.shutdown_inner();
    }

    /// Stop accepting work and pull every pending task back out, keyed by
    /// actor in per-actor submission order. In-flight tasks finish; workers
    /// are woken once so they observe the shutdown promptly.
    pub fn shutdown_now(&self) -> FxHashMap<K, Vec<Task>> {
        let shared = &self.shared;
        shared.sync.lock();
        shared.sync.begin_shutdown();
        let queues: Vec<Arc<ActorQueue<K>>> = {
            let map = shared.registry.read();
            map.values().cloned().collect()
        };
        let mut drained: FxHashMap<K, Vec<Task>> = FxHashMap::default();
        for queue in queues {
            let tasks = queue.drain(&shared.registry);
            if !tasks.is_empty() {
                drained.insert(queue.key().clone(), tasks);
            }
        }
        shared.sync.unlock();
        shared.wake_all_workers();
        shared.sync.try_finalize();
        drained
    }

    /// Block until the pool terminates or `timeout` elapses. Returns true
    /// if the pool is terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        static WAITER_ID: AtomicU64 = AtomicU64::new(0);
        let sync = &self.shared.sync;
        if sync.lifecycle() == Lifecycle::Terminated {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let parker = Parker::new();
        let id = WAITER_ID.fetch_add(1, Ordering::Relaxed);
        sync.register_waiter(id, parker.unparker().clone());
        let terminated = loop {
            if sync.lifecycle() == Lifecycle::Terminated {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            parker.park_timeout(deadline - now);
        };
        sync.deregister_waiter(id);
        terminated
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.sync.lifecycle() != Lifecycle::Running
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.sync.lifecycle() == Lifecycle::Terminating
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.sync.lifecycle() == Lifecycle::Terminated
    }

    // -- configuration ------------------------------------------------------

    pub fn core_pool_size(&self) -> usize {
        self.shared.limits.core_size() as usize
    }

    /// Adjust the core size. Shrinking wakes idle workers so the surplus can
    /// retire; growing prestarts core workers up to the live actor count.
    ///
    /// # Panics
    ///
    /// If `core` exceeds the current maximum pool size.
    pub fn set_core_pool_size(&self, core: usize) {
        assert!(core <= MAX_POOL_LIMIT, "pool size exceeds the index space");
        let (old_core, max) = self.shared.limits.load();
        assert!(
            core as u32 <= max,
            "core size ({}) must not exceed the maximum pool size ({})",
            core,
            max
        );
        self.shared.limits.set_core(core as u32);
        if (core as u32) < old_core {
            self.shared.wake_all_workers();
        } else {
            let live = self.shared.registry.read().len();
            let target = core.min(live);
            while (self.shared.sync.worker_count() as usize) < target {
                if !PoolShared::start_worker(&self.shared, true) {
                    break;
                }
            }
        }
    }

    pub fn maximum_pool_size(&self) -> usize {
        self.shared.limits.max_size() as usize
    }

    /// Adjust the maximum. Shrinking wakes workers so over-maximum shedding
    /// runs; the pool converges below the new cap between batches.
    ///
    /// # Panics
    ///
    /// If `max` is 0 or below the current core size.
    pub fn set_maximum_pool_size(&self, max: usize) {
        assert!(max >= 1, "maximum pool size must be at least 1");
        assert!(max <= MAX_POOL_LIMIT, "pool size exceeds the index space");
        let (core, old_max) = self.shared.limits.load();
        assert!(
            max as u32 >= core,
            "maximum pool size ({}) must not be below the core size ({})",
            max,
            core
        );
        self.shared.limits.set_max(max as u32);
        if (max as u32) < old_max {
            self.shared.wake_all_workers();
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.shared.keep_alive()
    }

    /// Change how long non-core workers linger when idle. Idle workers are
    /// woken so they re-time their parks against the new value.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        let nanos = keep_alive.as_nanos().min(u64::MAX as u128) as u64;
        self.shared.keep_alive_nanos.store(nanos, Ordering::Relaxed);
        self.shared.wake_all_workers();
    }

    /// Batch size cap, fixed at construction.
    pub fn max_batch_size(&self) -> usize {
        self.shared.max_batch_size
    }

    /// Batch duration cap, fixed at construction.
    pub fn max_batch_duration(&self) -> Duration {
        self.shared.max_batch_duration
    }

    // -- metrics ------------------------------------------------------------

    /// Tasks ever accepted (submissions that were not rejected or
    /// successfully cancelled by the shutdown race).
    pub fn task_count(&self) -> u64 {
        self.shared.task_count.load(Ordering::Relaxed)
    }

    pub fn completed_task_count(&self) -> u64 {
        self.shared.completed_count.load(Ordering::Relaxed)
    }

    pub fn batch_count(&self) -> u64 {
        self.shared.batch_count.load(Ordering::Relaxed)
    }

    /// Times an actor was moved between workers by the steal protocol.
    pub fn steal_count(&self) -> u64 {
        self.shared.steal_count.load(Ordering::Relaxed)
    }

    /// Workers currently executing a batch. Best-effort gauge.
    pub fn active_count(&self) -> usize {
        self.shared.active_workers.load(Ordering::Relaxed)
    }

    pub fn current_pool_size(&self) -> usize {
        self.shared.sync.worker_count() as usize
    }

    pub fn largest_pool_size(&self) -> usize {
        self.shared.largest_pool_size.load(Ordering::Relaxed) as usize
    }
}

impl<K> Drop for ActorPool<K> {
    /// Dropping the handle shuts the pool down (gracefully: accepted work
    /// still drains before the workers retire).
    fn drop(&mut self) {
        self.shared.shutdown_inner();
    }
}

impl<K> std::fmt::Debug for ActorPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorPool")
            .field("lifecycle", &self.shared.sync.lifecycle())
            .field("current_pool_size", &self.shared.sync.worker_count())
            .field("core_pool_size", &self.shared.limits.core_size())
            .field("maximum_pool_size", &self.shared.limits.max_size())
            .field("task_count", &self.shared.task_count.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
