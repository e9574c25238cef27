//! Actor-oriented thread pool.
//!
//! Every task submitted to an [`ActorPool`] carries an *actor key*. Tasks
//! for one key execute strictly in submission order and never concurrently
//! with each other; distinct keys execute in parallel across a pool of OS
//! worker threads.
//!
//! ## Architecture
//!
//! - **Synchronizer** (`sync`): one 64-bit word packing the mutex bit,
//!   lifecycle, array stamp, and worker count, plus the termination
//!   wait-set.
//! - **Actor queue** (`queue`): per-key FIFO task sequence with a 32-bit
//!   `{count, running, removed}` state word and a worker-ownership slot.
//! - **Worker** (`worker`): an OS thread with a local deque of actor
//!   queues and a bit-packed `{stamp, park, index}` word; idle workers
//!   steal actors from busy peers.
//! - **Dispatcher** (`pool`): the actor registry, worker-array management,
//!   submission path, and shutdown coordination.
//!
//! ## Example
//!
//! ```
//! use actor_pool::ActorPool;
//! use std::time::Duration;
//!
//! let pool: ActorPool<&'static str> = ActorPool::new(2);
//! for i in 0..10 {
//!     // Tasks for "billing" run one at a time, in order; "mail" may run
//!     // in parallel with them on another worker.
//!     pool.submit("billing", move || println!("invoice {i}")).unwrap();
//!     pool.submit("mail", move || println!("mail {i}")).unwrap();
//! }
//! pool.shutdown();
//! assert!(pool.await_termination(Duration::from_secs(5)));
//! ```

mod error;
mod pool;
mod queue;
mod sync;
mod worker;

pub use error::RejectedError;
pub use pool::{ActorPool, ActorPoolBuilder, DefaultThreadFactory, PanicHandler, ThreadFactory};
pub use queue::Task;
