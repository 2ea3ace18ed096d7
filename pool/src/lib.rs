//! Executor-side worker pool.
//!
//! A logical task arriving from the coordinator fans out into one unit
//! task per trading day. Units run isolated from each other (the domain
//! runner spawns one OS process per unit for the untrusted generator),
//! bounded by a semaphore, and report back over one multi-producer
//! message channel drained by a dedicated consumer loop.

mod message;
mod pool;
mod task;

pub use message::{LogLevel, MessageLogger, PoolMessage};
pub use pool::{FinishSink, GroupProgress, UnitContext, UnitOutcome, UnitRunner, WorkerPool};
pub use task::{GroupStatus, TaskGroup, UnitKind, UnitSpec, UnitTask};
