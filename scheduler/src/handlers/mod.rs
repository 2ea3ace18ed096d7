//! Task handlers: one per task type. A handler knows how to derive the
//! desc from a payload, plan a new task (including its dependencies),
//! drive it on a worker and ingest its callbacks.

mod factor;
mod tick;

use async_trait::async_trait;
use chrono::NaiveDate;
use factorkeeper_lib::{FkResult, ResultFrame};

pub use factor::FactorUpdateHandler;
pub use tick::TickUpdateHandler;

use crate::manager::TaskManager;
use crate::registry::WorkerInfo;
use crate::task::{Task, TaskPayload};

pub const UPDATE_FACTOR_TASK_TYPE: &str = "UPDATE_FACTOR";
pub const UPDATE_TICK_TASK_TYPE: &str = "UPDATE_TICK_DATA";

/// A frame or finish callback arriving from a worker.
#[derive(Debug, Clone)]
pub enum TaskCallback {
    FactorFrame {
        task_id: String,
        factor: String,
        version: String,
        stock_code: String,
        day: NaiveDate,
        frame: ResultFrame,
    },
    TickFrame {
        task_id: String,
        stock_code: String,
        day: NaiveDate,
        frame: ResultFrame,
    },
}

impl TaskCallback {
    pub fn task_id(&self) -> &str {
        match self {
            TaskCallback::FactorFrame { task_id, .. } => task_id,
            TaskCallback::TickFrame { task_id, .. } => task_id,
        }
    }

    pub fn task_type(&self) -> &'static str {
        match self {
            TaskCallback::FactorFrame { .. } => UPDATE_FACTOR_TASK_TYPE,
            TaskCallback::TickFrame { .. } => UPDATE_TICK_TASK_TYPE,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    fn task_type(&self) -> &'static str;

    /// Canonicalize a payload before desc generation; factor payloads
    /// resolve member names to their owning group here so every operation
    /// (create, query, stop) lands on the same desc.
    async fn normalize(&self, payload: TaskPayload) -> FkResult<TaskPayload>;

    /// Pure function of the normalized payload.
    fn gen_task_desc(&self, payload: &TaskPayload) -> FkResult<String>;

    /// Plan a new task object, creating backing tables and dependency
    /// tasks as needed. Does not place it anywhere.
    async fn new_task(&self, payload: &TaskPayload, manager: &TaskManager) -> FkResult<Task>;

    /// Start the task on some worker; returns the worker that took it.
    async fn start_task(&self, task: &Task) -> FkResult<(String, WorkerInfo)>;

    /// Progress of a running task, asked of its worker.
    async fn query_status(&self, task: &Task) -> FkResult<String>;

    /// Tell the task's worker to stop the group.
    async fn stop_task(&self, task: &Task) -> FkResult<String>;

    /// Ingest a worker callback.
    async fn call_back(&self, callback: TaskCallback) -> FkResult<()>;
}
