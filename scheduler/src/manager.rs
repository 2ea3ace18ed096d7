//! The task manager: running/waiting tables, handler registry and the
//! scheduling loop.
//!
//! Lock discipline: the table mutex is held only for map mutations and
//! status flips. Dispatching walks a snapshot, performs the network I/O
//! with the lock dropped, and retakes it to commit; a task that vanished
//! in between simply isn't committed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_metadb::{FinishedTaskInfo, FinishedTaskRecord, MetaDb};
use tracing::{error, info, warn};

use crate::handlers::{TaskCallback, TaskHandler};
use crate::registry::{CommandMethod, WorkerRegistry};
use crate::task::{Task, TaskPayload, TaskStatus};

/// Completion counters of a finish-ack. Workers that died mid-flight may
/// leave them empty; whatever arrived is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinishCounts {
    pub total: Option<i32>,
    pub finished: Option<i32>,
    pub aborted: Option<i32>,
}

impl FinishCounts {
    pub fn zero() -> Self {
        Self {
            total: Some(0),
            finished: Some(0),
            aborted: Some(0),
        }
    }

    /// Every unit aborted and none finished: the task as a whole failed.
    fn all_aborted(&self) -> bool {
        matches!(
            (self.total, self.finished, self.aborted),
            (Some(total), Some(0), Some(aborted)) if total > 0 && aborted == total
        )
    }
}

/// Answer of a task status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskQueryStatus {
    Running(String),
    Ready,
    WaitingDependency,
}

impl std::fmt::Display for TaskQueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskQueryStatus::Running(progress) => write!(f, "task is running: {progress}"),
            TaskQueryStatus::Ready => write!(f, "task is ready to run"),
            TaskQueryStatus::WaitingDependency => write!(f, "task is waiting for dependency"),
        }
    }
}

/// Durable side of task completion. `MetaDb` is the production store; the
/// trait keeps the manager testable without Postgres.
#[async_trait]
pub trait FinishedStore: Send + Sync + 'static {
    async fn record_finished_task(&self, record: &FinishedTaskRecord) -> FkResult<()>;
    async fn record_task_dependencies(&self, base: &str, deps: &[String]) -> FkResult<()>;
    async fn recent_finished_tasks(&self, limit: i64) -> FkResult<Vec<FinishedTaskInfo>>;
}

#[async_trait]
impl FinishedStore for MetaDb {
    async fn record_finished_task(&self, record: &FinishedTaskRecord) -> FkResult<()> {
        MetaDb::record_finished_task(self, record).await
    }

    async fn record_task_dependencies(&self, base: &str, deps: &[String]) -> FkResult<()> {
        MetaDb::record_task_dependencies(self, base, deps).await
    }

    async fn recent_finished_tasks(&self, limit: i64) -> FkResult<Vec<FinishedTaskInfo>> {
        MetaDb::recent_finished_tasks(self, limit).await
    }
}

#[derive(Default)]
struct Tables {
    running: HashMap<String, Task>,
    waiting: HashMap<String, Task>,
    /// Descs between the uniqueness check and table placement, so two
    /// concurrent `new_task` calls cannot both pass the check.
    reserved: HashSet<String>,
}

impl Tables {
    fn is_live(&self, desc: &str) -> bool {
        self.running.contains_key(desc)
            || self.waiting.contains_key(desc)
            || self.reserved.contains(desc)
    }
}

struct ManagerShared {
    tables: Mutex<Tables>,
    handlers: RwLock<HashMap<&'static str, Arc<dyn TaskHandler>>>,
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn FinishedStore>,
}

#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<ManagerShared>,
}

enum Dispatch {
    Placed(String),
    ZeroWork,
    NoCapacity,
    Failed(ErrorKind),
}

impl TaskManager {
    pub fn new(registry: Arc<WorkerRegistry>, store: Arc<dyn FinishedStore>) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                tables: Mutex::new(Tables::default()),
                handlers: RwLock::new(HashMap::new()),
                registry,
                store,
            }),
        }
    }

    pub fn install_handler(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        let mut handlers = self.shared.handlers.write().expect("handler lock");
        if handlers.insert(task_type, handler).is_some() {
            warn!(task_type, "task handler replaced");
        } else {
            info!(task_type, "task handler installed");
        }
    }

    pub fn handler(&self, task_type: &str) -> FkResult<Arc<dyn TaskHandler>> {
        self.shared
            .handlers
            .read()
            .expect("handler lock")
            .get(task_type)
            .cloned()
            .ok_or(ErrorKind::TaskHandlerNotExists)
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.shared.registry
    }

    /// Create and start a task. The desc is reserved before any slow work
    /// so a concurrent identical request gets `TASK_ALREADY_EXISTS`.
    pub async fn new_task(&self, payload: TaskPayload) -> FkResult<String> {
        let handler = self.handler(payload.task_type())?;
        let payload = handler.normalize(payload).await?;
        let desc = handler.gen_task_desc(&payload)?;

        {
            let mut tables = self.shared.tables.lock().expect("table lock");
            if tables.is_live(&desc) {
                return Err(ErrorKind::TaskAlreadyExists);
            }
            tables.reserved.insert(desc.clone());
        }

        let result = async {
            let task = handler.new_task(&payload, self).await?;
            self.start_task(task).await
        }
        .await;

        // on any failure the reservation must not leak
        if result.is_err() {
            self.shared
                .tables
                .lock()
                .expect("table lock")
                .reserved
                .remove(&desc);
        }
        result
    }

    /// Place a task according to its status, dispatching Ready tasks to a
    /// worker right away.
    pub async fn start_task(&self, task: Task) -> FkResult<String> {
        match task.status() {
            TaskStatus::Ready => match self.dispatch(&task, true).await {
                Dispatch::Placed(msg) => Ok(msg),
                Dispatch::ZeroWork => Ok("task has nothing to be done".to_string()),
                Dispatch::NoCapacity => {
                    task.set_worker(None);
                    self.place_waiting(&task);
                    Ok("ready to run".to_string())
                }
                Dispatch::Failed(err) => Err(err),
            },
            TaskStatus::WaitingDependency => {
                task.set_worker(None);
                self.place_waiting(&task);
                Ok("waiting for dependency tasks".to_string())
            }
            TaskStatus::Running => Err(ErrorKind::TaskAlreadyExists),
        }
    }

    /// Ask the handler to start the task on some worker and commit the
    /// result. `new_placement` marks a freshly reserved task; otherwise
    /// this is a dependency task living only in its parent's DAG.
    async fn dispatch(&self, task: &Task, new_placement: bool) -> Dispatch {
        let handler = match self.handler(task.task_type()) {
            Ok(handler) => handler,
            Err(err) => return Dispatch::Failed(err),
        };

        match handler.start_task(task).await {
            Ok((msg, worker)) => {
                let mut tables = self.shared.tables.lock().expect("table lock");
                let still_wanted = if new_placement {
                    tables.reserved.remove(task.task_desc());
                    true
                } else {
                    tables.waiting.remove(task.task_desc()).is_some()
                        || !tables.running.contains_key(task.task_desc())
                };
                if still_wanted {
                    task.set_worker(Some(worker));
                    tables
                        .running
                        .insert(task.task_desc().to_string(), task.clone());
                }
                Dispatch::Placed(msg)
            }
            Err(ErrorKind::NoWorkerToBeAssigned) => Dispatch::NoCapacity,
            Err(ErrorKind::TaskHasNothingToBeDone) => {
                if let Err(err) = self.zero_work_finish(task).await {
                    error!(task = task.task_desc(), %err, "zero-work finish failed");
                }
                Dispatch::ZeroWork
            }
            Err(err) => Dispatch::Failed(err),
        }
    }

    fn place_waiting(&self, task: &Task) {
        let mut tables = self.shared.tables.lock().expect("table lock");
        tables.reserved.remove(task.task_desc());
        tables
            .waiting
            .insert(task.task_desc().to_string(), task.clone());
    }

    /// A task with an empty to-do set succeeds immediately: release its
    /// dependents and record a finished row with zero counts.
    async fn zero_work_finish(&self, task: &Task) -> FkResult<()> {
        {
            let mut tables = self.shared.tables.lock().expect("table lock");
            tables.reserved.remove(task.task_desc());
            tables.running.remove(task.task_desc());
            tables.waiting.remove(task.task_desc());
        }
        task.finish_normally();
        self.record_finished(task, "finished", FinishCounts::zero())
            .await
    }

    async fn record_finished(
        &self,
        task: &Task,
        final_status: &str,
        counts: FinishCounts,
    ) -> FkResult<()> {
        let record = FinishedTaskRecord {
            task_id: task.task_id(),
            task_type: task.task_type().to_string(),
            commit_time: task.commit_time(),
            finish_time: Local::now().naive_local(),
            final_status: final_status.to_string(),
            total_sub_tasks: counts.total,
            finished: counts.finished,
            aborted: counts.aborted,
            is_sub_task: task.is_sub_task() as i32,
            worker_id: task.worker().map(|worker| worker.id),
        };
        self.shared.store.record_finished_task(&record).await?;

        let dependencies = task.all_dependency_ids();
        if !dependencies.is_empty() {
            self.shared
                .store
                .record_task_dependencies(&record.task_id, &dependencies)
                .await?;
        }
        Ok(())
    }

    /// Retire a task on its worker's finish-ack. A fully aborted group
    /// does not release the task's dependents.
    pub async fn finish_task(&self, task_id: &str, counts: FinishCounts) -> FkResult<()> {
        let desc = Task::desc_from_id(task_id);
        let (task, was_running) = {
            let mut tables = self.shared.tables.lock().expect("table lock");
            match tables.running.remove(desc) {
                Some(task) => (task, true),
                None => match tables.waiting.remove(desc) {
                    Some(task) => (task, false),
                    None => return Err(ErrorKind::TaskNotExists),
                },
            }
        };

        let aborted = counts.all_aborted();
        if was_running && !aborted {
            task.finish_normally();
        }

        self.record_finished(&task, if aborted { "aborted" } else { "finished" }, counts)
            .await
    }

    /// Stop a live task; a running one also gets a stop command on its
    /// worker. Dependents are not released.
    pub async fn stop_task(&self, payload: TaskPayload) -> FkResult<String> {
        let handler = self.handler(payload.task_type())?;
        let payload = handler.normalize(payload).await?;
        let desc = handler.gen_task_desc(&payload)?;

        let task = {
            let mut tables = self.shared.tables.lock().expect("table lock");
            tables
                .running
                .remove(&desc)
                .or_else(|| tables.waiting.remove(&desc))
                .ok_or(ErrorKind::TaskNotExists)?
        };

        if task.status() == TaskStatus::Running {
            handler.stop_task(&task).await?;
        }
        Ok("task stopped".to_string())
    }

    /// Drop every live task and broadcast a stop to all workers.
    pub async fn stop_all(&self) -> FkResult<()> {
        {
            let mut tables = self.shared.tables.lock().expect("table lock");
            tables.running.clear();
            tables.waiting.clear();
            tables.reserved.clear();
        }
        self.shared
            .registry
            .send_command("stop_all", CommandMethod::Post, &[], None, true)
            .await?;
        Ok(())
    }

    pub async fn query_task(&self, payload: TaskPayload) -> FkResult<TaskQueryStatus> {
        let handler = self.handler(payload.task_type())?;
        let payload = handler.normalize(payload).await?;
        let desc = handler.gen_task_desc(&payload)?;

        let task = {
            let tables = self.shared.tables.lock().expect("table lock");
            tables
                .running
                .get(&desc)
                .or_else(|| tables.waiting.get(&desc))
                .cloned()
                .ok_or(ErrorKind::TaskNotExists)?
        };

        match task.status() {
            TaskStatus::Running => {
                let progress = handler.query_status(&task).await?;
                Ok(TaskQueryStatus::Running(progress))
            }
            TaskStatus::Ready => Ok(TaskQueryStatus::Ready),
            TaskStatus::WaitingDependency => Ok(TaskQueryStatus::WaitingDependency),
        }
    }

    /// Route a worker callback to its handler. The task id on the wire
    /// must match the live task of that desc; a mismatch is a callback
    /// from a group that was stopped and recreated.
    pub async fn callback_task(&self, callback: TaskCallback) -> FkResult<()> {
        let desc = Task::desc_from_id(callback.task_id()).to_string();
        let task = {
            let tables = self.shared.tables.lock().expect("table lock");
            tables
                .running
                .get(&desc)
                .or_else(|| tables.waiting.get(&desc))
                .cloned()
                .ok_or(ErrorKind::TaskNotExists)?
        };

        if task.task_id() != callback.task_id() {
            return Err(ErrorKind::TaskNotExists);
        }
        let handler = self.handler(callback.task_type())?;
        handler.call_back(callback).await
    }

    /// Live root tasks (sub-tasks are reachable through their parents).
    pub fn list_tasks(&self) -> Vec<Task> {
        let tables = self.shared.tables.lock().expect("table lock");
        tables
            .running
            .values()
            .chain(tables.waiting.values())
            .filter(|task| !task.is_sub_task())
            .cloned()
            .collect()
    }

    pub async fn recent_finished_tasks(&self, limit: i64) -> FkResult<Vec<FinishedTaskInfo>> {
        self.shared.store.recent_finished_tasks(limit).await
    }

    /// Run the scheduling pass forever at the given cadence.
    pub fn spawn_scheduling_loop(&self, cycle: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cycle).await;
                manager.schedule_once().await;
            }
        })
    }

    /// One scheduling pass: requeue tasks of dead workers, then dispatch
    /// whatever waiting work the fleet has room for.
    pub async fn schedule_once(&self) {
        self.requeue_lost_tasks();

        if !self.shared.registry.is_workers_ready() {
            return;
        }

        let waiting: Vec<Task> = {
            let tables = self.shared.tables.lock().expect("table lock");
            tables.waiting.values().cloned().collect()
        };

        'pass: for task in waiting {
            match task.status() {
                TaskStatus::Ready => {
                    if !self.still_waiting(task.task_desc()) {
                        continue;
                    }
                    match self.dispatch_from_waiting(&task).await {
                        Dispatch::NoCapacity => break 'pass,
                        Dispatch::Failed(err) => {
                            error!(task = task.task_desc(), %err, "dispatch failed");
                        }
                        _ => {}
                    }
                }
                TaskStatus::WaitingDependency => {
                    for dep in task.runnable_dependencies() {
                        if self.is_running(dep.task_desc()) {
                            continue;
                        }
                        match self.dispatch(&dep, false).await {
                            Dispatch::NoCapacity => break 'pass,
                            Dispatch::Failed(err) => {
                                error!(task = dep.task_desc(), %err, "dependency dispatch failed");
                            }
                            _ => {}
                        }
                    }
                }
                TaskStatus::Running => {}
            }
        }
    }

    /// Move the running tasks of every dead worker back to waiting.
    fn requeue_lost_tasks(&self) {
        let by_worker: HashMap<String, (crate::registry::WorkerInfo, Vec<Task>)> = {
            let tables = self.shared.tables.lock().expect("table lock");
            let mut map: HashMap<String, (crate::registry::WorkerInfo, Vec<Task>)> =
                HashMap::new();
            for task in tables.running.values() {
                if let Some(worker) = task.worker() {
                    map.entry(worker.id.clone())
                        .or_insert_with(|| (worker, Vec::new()))
                        .1
                        .push(task.clone());
                }
            }
            map
        };

        for (_, (worker, tasks)) in by_worker {
            if self.shared.registry.is_alive(&worker) {
                continue;
            }
            let mut tables = self.shared.tables.lock().expect("table lock");
            for task in tasks {
                if tables.running.remove(task.task_desc()).is_some() {
                    task.set_worker(None);
                    tables
                        .waiting
                        .insert(task.task_desc().to_string(), task.clone());
                    info!(
                        worker = worker.addr(),
                        task = task.task_desc(),
                        "worker disconnected, task requeued"
                    );
                }
            }
        }
    }

    async fn dispatch_from_waiting(&self, task: &Task) -> Dispatch {
        let handler = match self.handler(task.task_type()) {
            Ok(handler) => handler,
            Err(err) => return Dispatch::Failed(err),
        };

        match handler.start_task(task).await {
            Ok((msg, worker)) => {
                let mut tables = self.shared.tables.lock().expect("table lock");
                if tables.waiting.remove(task.task_desc()).is_some() {
                    task.set_worker(Some(worker));
                    tables
                        .running
                        .insert(task.task_desc().to_string(), task.clone());
                } else {
                    // stopped while we were talking to the worker
                    warn!(task = task.task_desc(), "task vanished during dispatch");
                }
                Dispatch::Placed(msg)
            }
            Err(ErrorKind::NoWorkerToBeAssigned) => Dispatch::NoCapacity,
            Err(ErrorKind::TaskHasNothingToBeDone) => {
                if let Err(err) = self.zero_work_finish(task).await {
                    error!(task = task.task_desc(), %err, "zero-work finish failed");
                }
                Dispatch::ZeroWork
            }
            Err(err) => Dispatch::Failed(err),
        }
    }

    fn still_waiting(&self, desc: &str) -> bool {
        self.shared
            .tables
            .lock()
            .expect("table lock")
            .waiting
            .contains_key(desc)
    }

    fn is_running(&self, desc: &str) -> bool {
        self.shared
            .tables
            .lock()
            .expect("table lock")
            .running
            .contains_key(desc)
    }
}
