//! helmsman-rollout: the rollout/run orchestration engine.
//!
//! # Architecture
//!
//! ```text
//! Engine (dispatcher)
//!   ├── machine        legal (state, command) transitions
//!   ├── LockManager    one supervised episode per (env, workload)
//!   │     └── Shutdown counted barrier + cancellation signal
//!   ├── Episode        convergence monitor, one tokio task per episode
//!   │     └── TargetAdapter (service-style or run-style)
//!   ├── Journal        record log + tracing + NotificationSink
//!   └── relay          record change events as push streams
//! ```
//!
//! Records live in `helmsman_state::RecordStore`. The dispatcher writes
//! control state (`state`) at any time; only the episode holding the
//! workload's lock writes convergence bookkeeping (`clock`, refs, pods).
//! Service and run workloads share one engine and differ only in the
//! adapter registered for their kind and the convergence predicate.

pub mod adapter;
pub mod convergence;
pub mod dispatcher;
pub mod error;
pub(crate) mod journal;
pub mod lock;
pub mod machine;
pub(crate) mod monitor;
pub(crate) mod relay;
pub mod shutdown;

pub use adapter::{
    AdapterError, AdapterFuture, ImageRepository, Incarnation, LiveWorkload, NotificationSink,
    RunOutcome, Selector, Submission, TargetAdapter, TargetEvent, TargetSpec, TargetStatus,
    TargetWatch,
};
pub use convergence::{Convergence, Observation, Verdict};
pub use dispatcher::{Engine, EngineBuilder, RunMode, StartRequest};
pub use error::{ErrorKind, RolloutError, RolloutResult};
pub use lock::{Acquisition, LockGuard, LockManager};
pub use machine::Command;
pub use shutdown::{BarrierToken, Shutdown};
