//! Coordinator core: the task manager with dependency-aware scheduling,
//! the heartbeat-tracking worker registry, and the task handlers that
//! plan factor and tick updates.

pub mod handlers;
pub mod manager;
pub mod registry;
pub mod task;

pub use handlers::{TaskCallback, TaskHandler};
pub use manager::{FinishCounts, FinishedStore, TaskManager, TaskQueryStatus};
pub use registry::{
    CommandMethod, CommandTransport, HttpCommandTransport, WorkerInfo, WorkerRegistry,
};
pub use task::{Task, TaskPayload, TaskStatus};
