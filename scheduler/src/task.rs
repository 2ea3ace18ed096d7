//! The in-memory task: status, worker assignment and the dependency DAG.
//!
//! Tasks are shared handles. A parent holds its children strongly through
//! `dependencies`; a child holds its parents weakly through the notify
//! list, so retired task trees actually drop.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use chrono::{Local, NaiveDateTime};
use factorkeeper_lib::proto::DATETIME_FORMAT;
use factorkeeper_lib::{ErrorKind, FkResult};

use crate::registry::WorkerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    WaitingDependency,
    Running,
}

/// Arguments of a coordinator task. `task_desc` is a pure function of
/// this payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    UpdateFactor {
        factor: String,
        version: String,
        stock_code: String,
    },
    UpdateTick {
        stock_code: String,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskPayload::UpdateFactor { .. } => crate::handlers::UPDATE_FACTOR_TASK_TYPE,
            TaskPayload::UpdateTick { .. } => crate::handlers::UPDATE_TICK_TASK_TYPE,
        }
    }
}

struct TaskInner {
    status: TaskStatus,
    worker: Option<WorkerInfo>,
    is_sub_task: bool,
    dependencies: Vec<Task>,
    all_dependencies: Vec<Task>,
    notify_list: Vec<Weak<TaskShared>>,
}

struct TaskShared {
    task_desc: String,
    task_type: &'static str,
    payload: TaskPayload,
    commit_time: NaiveDateTime,
    inner: Mutex<TaskInner>,
}

#[derive(Clone)]
pub struct Task {
    shared: Arc<TaskShared>,
}

impl Task {
    pub fn new(task_desc: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                task_desc: task_desc.into(),
                task_type: payload.task_type(),
                payload,
                commit_time: Local::now().naive_local(),
                inner: Mutex::new(TaskInner {
                    status: TaskStatus::Ready,
                    worker: None,
                    is_sub_task: false,
                    dependencies: Vec::new(),
                    all_dependencies: Vec::new(),
                    notify_list: Vec::new(),
                }),
            }),
        }
    }

    pub fn task_desc(&self) -> &str {
        &self.shared.task_desc
    }

    pub fn task_type(&self) -> &'static str {
        self.shared.task_type
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.shared.payload
    }

    pub fn commit_time(&self) -> NaiveDateTime {
        self.shared.commit_time
    }

    /// Globally unique id: commit timestamp plus desc. The timestamp
    /// contains no `#`, so the first `#` always splits the two.
    pub fn task_id(&self) -> String {
        format!(
            "{}#{}",
            self.shared.commit_time.format(DATETIME_FORMAT),
            self.shared.task_desc
        )
    }

    pub fn desc_from_id(task_id: &str) -> &str {
        match task_id.find('#') {
            Some(pos) => &task_id[pos + 1..],
            None => task_id,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.inner.lock().expect("task lock").status
    }

    pub fn worker(&self) -> Option<WorkerInfo> {
        self.shared.inner.lock().expect("task lock").worker.clone()
    }

    pub fn is_sub_task(&self) -> bool {
        self.shared.inner.lock().expect("task lock").is_sub_task
    }

    /// Assigning a worker flips the task to Running; clearing it flips
    /// back to Ready, or WaitingDependency while dependencies remain.
    pub fn set_worker(&self, worker: Option<WorkerInfo>) {
        let mut inner = self.shared.inner.lock().expect("task lock");
        match worker {
            Some(worker) => {
                inner.worker = Some(worker);
                inner.status = TaskStatus::Running;
            }
            None => {
                inner.worker = None;
                inner.status = if inner.dependencies.is_empty() {
                    TaskStatus::Ready
                } else {
                    TaskStatus::WaitingDependency
                };
            }
        }
    }

    /// Register `child` as a dependency: this task waits until the child
    /// finishes, and the child becomes a sub-task of this one. Self-edges
    /// and cycles are rejected.
    pub fn add_dependency(&self, child: &Task) -> FkResult<()> {
        if child.task_desc() == self.task_desc() || child.transitively_depends_on(self.task_desc())
        {
            return Err(ErrorKind::ServerInternalError);
        }

        {
            let mut inner = self.shared.inner.lock().expect("task lock");
            inner.dependencies.push(child.clone());
            inner.all_dependencies.push(child.clone());
            inner.status = TaskStatus::WaitingDependency;
        }

        let mut child_inner = child.shared.inner.lock().expect("task lock");
        child_inner.notify_list.push(Arc::downgrade(&self.shared));
        child_inner.is_sub_task = true;
        Ok(())
    }

    fn transitively_depends_on(&self, desc: &str) -> bool {
        let dependencies = {
            let inner = self.shared.inner.lock().expect("task lock");
            inner.dependencies.clone()
        };
        dependencies
            .iter()
            .any(|dep| dep.task_desc() == desc || dep.transitively_depends_on(desc))
    }

    /// Notify every parent in the notify list that this task finished.
    pub fn finish_normally(&self) {
        let notify_list = {
            let mut inner = self.shared.inner.lock().expect("task lock");
            std::mem::take(&mut inner.notify_list)
        };
        for parent in notify_list {
            if let Some(parent) = parent.upgrade() {
                Task { shared: parent }.notify_dependency_finished(self);
            }
        }
    }

    fn notify_dependency_finished(&self, child: &Task) {
        let mut inner = self.shared.inner.lock().expect("task lock");
        inner
            .dependencies
            .retain(|dep| dep.task_desc() != child.task_desc());
        if inner.dependencies.is_empty() && inner.status == TaskStatus::WaitingDependency {
            inner.status = TaskStatus::Ready;
        }
    }

    /// Transitive collection of Ready descendants, the set the scheduler
    /// may dispatch while this task waits.
    pub fn runnable_dependencies(&self) -> Vec<Task> {
        let dependencies = {
            let inner = self.shared.inner.lock().expect("task lock");
            inner.dependencies.clone()
        };

        let mut runnable = Vec::new();
        for dep in &dependencies {
            if dep.status() == TaskStatus::Ready {
                runnable.push(dep.clone());
            }
            runnable.extend(dep.runnable_dependencies());
        }
        runnable
    }

    /// Ids of every dependency ever attached, live or finished. Recorded
    /// as edges alongside the finished-task row.
    pub fn all_dependency_ids(&self) -> Vec<String> {
        let inner = self.shared.inner.lock().expect("task lock");
        inner
            .all_dependencies
            .iter()
            .map(|dep| dep.task_id())
            .collect()
    }

    pub fn status_desc(&self) -> &'static str {
        match self.status() {
            TaskStatus::Running => "Task is running",
            TaskStatus::Ready => "Task is ready to run",
            TaskStatus::WaitingDependency => "Task is waiting for dependencies",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker = self
            .worker()
            .map(|worker| worker.id)
            .unwrap_or_else(|| "Not Assigned".to_string());
        writeln!(f, "Task Id: {}", self.task_id())?;
        writeln!(f, "Type: {}", self.task_type())?;
        writeln!(f, "Status: {}", self.status_desc())?;
        writeln!(f, "Worker Id: {worker}")?;

        let dependencies = {
            let inner = self.shared.inner.lock().expect("task lock");
            inner.dependencies.clone()
        };
        writeln!(f, "Dependencies: [")?;
        for dep in dependencies {
            for line in dep.to_string().lines() {
                writeln!(f, "    {line}")?;
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_task(stock: &str) -> Task {
        Task::new(
            format!("UpdateTickData$${stock}"),
            TaskPayload::UpdateTick {
                stock_code: stock.to_string(),
            },
        )
    }

    fn worker() -> WorkerInfo {
        WorkerInfo::new("localhost", 8911, 4)
    }

    #[test]
    fn test_id_desc_round_trip() {
        let task = tick_task("000001.SZ");
        let id = task.task_id();
        assert_eq!(Task::desc_from_id(&id), task.task_desc());
    }

    #[test]
    fn test_desc_with_hash_survives_id_split() {
        let task = Task::new(
            "UpdateFactor$$G#a#b$$v1$$000001.SZ",
            TaskPayload::UpdateFactor {
                factor: "G#a#b".into(),
                version: "v1".into(),
                stock_code: "000001.SZ".into(),
            },
        );
        assert_eq!(Task::desc_from_id(&task.task_id()), task.task_desc());
    }

    #[test]
    fn test_worker_assignment_flips_status() {
        let task = tick_task("000001.SZ");
        assert_eq!(task.status(), TaskStatus::Ready);

        task.set_worker(Some(worker()));
        assert_eq!(task.status(), TaskStatus::Running);

        task.set_worker(None);
        assert_eq!(task.status(), TaskStatus::Ready);
    }

    #[test]
    fn test_dependency_readiness() {
        let parent = tick_task("BASKET.VIEW");
        let child_a = tick_task("000001.SZ");
        let child_b = tick_task("000002.SZ");

        parent.add_dependency(&child_a).unwrap();
        parent.add_dependency(&child_b).unwrap();
        assert_eq!(parent.status(), TaskStatus::WaitingDependency);
        assert!(child_a.is_sub_task());

        child_a.finish_normally();
        assert_eq!(parent.status(), TaskStatus::WaitingDependency);

        child_b.finish_normally();
        assert_eq!(parent.status(), TaskStatus::Ready);
    }

    #[test]
    fn test_worker_loss_keeps_waiting_dependency() {
        let parent = tick_task("BASKET.VIEW");
        let child = tick_task("000001.SZ");
        parent.add_dependency(&child).unwrap();

        // a disconnect clears the worker; with the child unfinished the
        // parent must stay in the dependency-wait state
        parent.set_worker(None);
        assert_eq!(parent.status(), TaskStatus::WaitingDependency);
    }

    #[test]
    fn test_cycle_rejected() {
        let a = tick_task("A");
        let b = tick_task("B");
        let c = tick_task("C");

        a.add_dependency(&b).unwrap();
        b.add_dependency(&c).unwrap();
        assert_eq!(c.add_dependency(&a), Err(ErrorKind::ServerInternalError));
        assert_eq!(a.add_dependency(&a), Err(ErrorKind::ServerInternalError));
    }

    #[test]
    fn test_runnable_dependencies_are_transitive() {
        let root = tick_task("ROOT.VIEW");
        let mid = tick_task("MID.VIEW");
        let leaf = tick_task("000001.SZ");

        mid.add_dependency(&leaf).unwrap();
        root.add_dependency(&mid).unwrap();

        let runnable: Vec<String> = root
            .runnable_dependencies()
            .iter()
            .map(|task| task.task_desc().to_string())
            .collect();
        // mid waits on leaf, only the leaf is dispatchable
        assert_eq!(runnable, vec!["UpdateTickData$$000001.SZ"]);

        leaf.finish_normally();
        let runnable: Vec<String> = root
            .runnable_dependencies()
            .iter()
            .map(|task| task.task_desc().to_string())
            .collect();
        assert_eq!(runnable, vec!["UpdateTickData$$MID.VIEW"]);
    }

    #[test]
    fn test_all_dependency_ids_survive_finish() {
        let parent = tick_task("BASKET.VIEW");
        let child = tick_task("000001.SZ");
        parent.add_dependency(&child).unwrap();

        child.finish_normally();
        assert_eq!(parent.all_dependency_ids(), vec![child.task_id()]);
    }
}
