//! Scheduling semantics, driven through a scripted handler and transport
//! so no worker process or database is involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_metadb::{FinishedTaskInfo, FinishedTaskRecord};
use factorkeeper_scheduler::handlers::UPDATE_TICK_TASK_TYPE;
use factorkeeper_scheduler::{
    CommandMethod, CommandTransport, FinishCounts, FinishedStore, Task, TaskCallback, TaskHandler,
    TaskManager, TaskPayload, TaskQueryStatus, TaskStatus, WorkerInfo, WorkerRegistry,
};

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<FinishedTaskRecord>>,
}

#[async_trait]
impl FinishedStore for MemoryStore {
    async fn record_finished_task(&self, record: &FinishedTaskRecord) -> FkResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn record_task_dependencies(&self, _base: &str, _deps: &[String]) -> FkResult<()> {
        Ok(())
    }

    async fn recent_finished_tasks(&self, limit: i64) -> FkResult<Vec<FinishedTaskInfo>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .rev()
            .filter(|record| record.is_sub_task == 0)
            .take(limit as usize)
            .map(|record| FinishedTaskInfo {
                record: record.clone(),
                dependencies: Vec::new(),
            })
            .collect())
    }
}

#[derive(Default)]
struct TestTransport {
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl TestTransport {
    fn calls_to(&self, path: &str) -> Vec<Vec<(String, String)>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.ends_with(path))
            .map(|(_, fields)| fields.clone())
            .collect()
    }
}

#[async_trait]
impl CommandTransport for TestTransport {
    async fn send(
        &self,
        url: &str,
        _method: CommandMethod,
        fields: &[(String, String)],
    ) -> FkResult<(ErrorKind, String)> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), fields.to_vec()));
        Ok((ErrorKind::Success, "2/5".to_string()))
    }
}

/// Tick-typed handler with scripted planning: stocks may declare
/// dependency stocks, or an empty to-do set.
struct MockHandler {
    registry: Arc<WorkerRegistry>,
    dependencies: HashMap<String, Vec<String>>,
    nothing_to_do: AtomicBool,
    callbacks: Mutex<Vec<String>>,
}

impl MockHandler {
    fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            dependencies: HashMap::new(),
            nothing_to_do: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn with_dependencies(mut self, parent: &str, children: &[&str]) -> Self {
        self.dependencies.insert(
            parent.to_string(),
            children.iter().map(|child| child.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    fn task_type(&self) -> &'static str {
        UPDATE_TICK_TASK_TYPE
    }

    async fn normalize(&self, payload: TaskPayload) -> FkResult<TaskPayload> {
        Ok(payload)
    }

    fn gen_task_desc(&self, payload: &TaskPayload) -> FkResult<String> {
        let TaskPayload::UpdateTick { stock_code } = payload else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };
        Ok(format!("MockTick$${stock_code}"))
    }

    async fn new_task(&self, payload: &TaskPayload, manager: &TaskManager) -> FkResult<Task> {
        let TaskPayload::UpdateTick { stock_code } = payload else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };
        let task = Task::new(self.gen_task_desc(payload)?, payload.clone());

        if let Some(children) = self.dependencies.get(stock_code) {
            for child in children {
                let child_payload = TaskPayload::UpdateTick {
                    stock_code: child.clone(),
                };
                let child_task = Box::pin(self.new_task(&child_payload, manager)).await?;
                task.add_dependency(&child_task)?;
            }
        }
        Ok(task)
    }

    async fn start_task(&self, task: &Task) -> FkResult<(String, WorkerInfo)> {
        if self.nothing_to_do.load(Ordering::SeqCst) {
            return Err(ErrorKind::TaskHasNothingToBeDone);
        }
        let TaskPayload::UpdateTick { stock_code } = task.payload() else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };
        let fields = vec![
            ("task_id".to_string(), task.task_id()),
            ("stock_code".to_string(), stock_code.clone()),
        ];
        let (msg, worker) = self
            .registry
            .send_command("update_tick_data", CommandMethod::Post, &fields, None, false)
            .await?;
        Ok((msg, worker.ok_or(ErrorKind::ServerInternalError)?))
    }

    async fn query_status(&self, _task: &Task) -> FkResult<String> {
        Ok("2/5".to_string())
    }

    async fn stop_task(&self, task: &Task) -> FkResult<String> {
        let worker = task.worker().ok_or(ErrorKind::TaskNotExists)?;
        self.registry
            .send_command(
                "update_tick_data/stop",
                CommandMethod::Post,
                &[("task_id".to_string(), task.task_id())],
                Some(&worker),
                false,
            )
            .await?;
        Ok("stopped".to_string())
    }

    async fn call_back(&self, callback: TaskCallback) -> FkResult<()> {
        self.callbacks
            .lock()
            .unwrap()
            .push(callback.task_id().to_string());
        Ok(())
    }
}

struct Fixture {
    manager: TaskManager,
    registry: Arc<WorkerRegistry>,
    transport: Arc<TestTransport>,
    store: Arc<MemoryStore>,
    handler: Arc<MockHandler>,
}

fn fixture_with(timeout: Duration, build: impl FnOnce(MockHandler) -> MockHandler) -> Fixture {
    let transport = Arc::new(TestTransport::default());
    let registry = Arc::new(WorkerRegistry::new(transport.clone(), timeout));
    let store = Arc::new(MemoryStore::default());
    let manager = TaskManager::new(registry.clone(), store.clone());
    let handler = Arc::new(build(MockHandler::new(registry.clone())));
    manager.install_handler(handler.clone());
    Fixture {
        manager,
        registry,
        transport,
        store,
        handler,
    }
}

fn fixture(timeout: Duration) -> Fixture {
    fixture_with(timeout, |handler| handler)
}

fn tick_payload(stock: &str) -> TaskPayload {
    TaskPayload::UpdateTick {
        stock_code: stock.to_string(),
    }
}

fn heartbeat(registry: &WorkerRegistry, host: &str, port: u16) {
    let ts = Local::now().naive_local() + chrono::Duration::seconds(1);
    registry.update_worker(host, port, vec![], ts).unwrap();
}

#[tokio::test]
async fn test_duplicate_task_rejected() {
    let f = fixture(Duration::from_secs(30));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    assert_eq!(
        f.manager.new_task(tick_payload("000001.SZ")).await,
        Err(ErrorKind::TaskAlreadyExists)
    );
}

#[tokio::test]
async fn test_concurrent_identical_tasks_single_winner() {
    let f = fixture(Duration::from_secs(30));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();

    let (a, b) = tokio::join!(
        f.manager.new_task(tick_payload("000001.SZ")),
        f.manager.new_task(tick_payload("000001.SZ")),
    );
    let failures = [&a, &b]
        .iter()
        .filter(|result| matches!(result, Err(ErrorKind::TaskAlreadyExists)))
        .count();
    assert_eq!(failures, 1, "exactly one of {a:?} / {b:?} must lose");
}

#[tokio::test]
async fn test_no_worker_queues_until_capacity_arrives() {
    let f = fixture(Duration::from_secs(30));

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    let tasks = f.manager.list_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status(), TaskStatus::Ready);
    assert!(f.transport.calls_to("update_tick_data").is_empty());

    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();
    f.manager.schedule_once().await;

    assert_eq!(f.manager.list_tasks()[0].status(), TaskStatus::Running);
    assert_eq!(f.transport.calls_to("update_tick_data").len(), 1);
}

#[tokio::test]
async fn test_zero_work_success_recorded() {
    let f = fixture(Duration::from_secs(30));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();
    f.handler.nothing_to_do.store(true, Ordering::SeqCst);

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();

    assert!(f.manager.list_tasks().is_empty());
    let records = f.store.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_status, "finished");
    assert_eq!(records[0].total_sub_tasks, Some(0));
    assert_eq!(records[0].finished, Some(0));
    assert_eq!(records[0].aborted, Some(0));
}

#[tokio::test]
async fn test_dead_worker_task_requeued_then_redispatched() {
    let f = fixture(Duration::from_millis(50));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();
    heartbeat(&f.registry, "w1", 1);

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    assert_eq!(f.manager.list_tasks()[0].status(), TaskStatus::Running);

    // heartbeats stop; past the timeout the scheduling pass pulls the
    // task back and, with no live worker, leaves it queued
    tokio::time::sleep(Duration::from_millis(120)).await;
    f.manager.schedule_once().await;

    let task = &f.manager.list_tasks()[0];
    assert_eq!(task.status(), TaskStatus::Ready);
    assert!(task.worker().is_none());
    assert_eq!(f.transport.calls_to("update_tick_data").len(), 1);

    // a fresh worker picks it up on the next tick, exactly once
    f.registry.register_worker("w2", 2, 4, "0.2.0").unwrap();
    f.manager.schedule_once().await;

    assert_eq!(f.manager.list_tasks()[0].status(), TaskStatus::Running);
    assert_eq!(f.transport.calls_to("update_tick_data").len(), 2);

    f.manager.schedule_once().await;
    assert_eq!(
        f.transport.calls_to("update_tick_data").len(),
        2,
        "a running task must not be dispatched again"
    );
}

#[tokio::test]
async fn test_dependencies_gate_parent_dispatch() {
    let f = fixture_with(Duration::from_secs(30), |handler| {
        handler.with_dependencies("PARENT.VIEW", &["000001.SZ", "000002.SZ"])
    });
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();

    f.manager.new_task(tick_payload("PARENT.VIEW")).await.unwrap();
    let parent = f.manager.list_tasks()[0].clone();
    assert_eq!(parent.status(), TaskStatus::WaitingDependency);

    // the scheduling pass dispatches the two children, not the parent
    f.manager.schedule_once().await;
    let dispatched = f.transport.calls_to("update_tick_data");
    assert_eq!(dispatched.len(), 2);
    let stocks: Vec<&str> = dispatched
        .iter()
        .flat_map(|fields| fields.iter())
        .filter(|(key, _)| key == "stock_code")
        .map(|(_, value)| value.as_str())
        .collect();
    assert!(stocks.contains(&"000001.SZ"));
    assert!(stocks.contains(&"000002.SZ"));

    let child_ids: Vec<String> = dispatched
        .iter()
        .flat_map(|fields| fields.iter())
        .filter(|(key, _)| key == "task_id")
        .map(|(_, value)| value.clone())
        .collect();

    // first child finishing keeps the parent waiting
    f.manager
        .finish_task(
            &child_ids[0],
            FinishCounts {
                total: Some(2),
                finished: Some(2),
                aborted: Some(0),
            },
        )
        .await
        .unwrap();
    assert_eq!(parent.status(), TaskStatus::WaitingDependency);

    // the second one releases it
    f.manager
        .finish_task(
            &child_ids[1],
            FinishCounts {
                total: Some(3),
                finished: Some(3),
                aborted: Some(0),
            },
        )
        .await
        .unwrap();
    assert_eq!(parent.status(), TaskStatus::Ready);

    f.manager.schedule_once().await;
    assert_eq!(parent.status(), TaskStatus::Running);
}

#[tokio::test]
async fn test_fully_aborted_child_does_not_release_parent() {
    let f = fixture_with(Duration::from_secs(30), |handler| {
        handler.with_dependencies("PARENT.VIEW", &["000001.SZ"])
    });
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();

    f.manager.new_task(tick_payload("PARENT.VIEW")).await.unwrap();
    let parent = f.manager.list_tasks()[0].clone();

    f.manager.schedule_once().await;
    let child_id = f.transport.calls_to("update_tick_data")[0]
        .iter()
        .find(|(key, _)| key == "task_id")
        .map(|(_, value)| value.clone())
        .unwrap();

    f.manager
        .finish_task(
            &child_id,
            FinishCounts {
                total: Some(2),
                finished: Some(0),
                aborted: Some(2),
            },
        )
        .await
        .unwrap();

    assert_eq!(parent.status(), TaskStatus::WaitingDependency);
    let records = f.store.records.lock().unwrap();
    assert_eq!(records[0].final_status, "aborted");
}

#[tokio::test]
async fn test_stale_callback_rejected() {
    let f = fixture(Duration::from_secs(30));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    let live_id = f.manager.list_tasks()[0].task_id();

    let frame = factorkeeper_lib::ResultFrame::default();
    let day = chrono::NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();

    // same desc, older commit timestamp: a callback from a killed group
    let stale = TaskCallback::TickFrame {
        task_id: "2001-01-01 00:00:00.000000#MockTick$$000001.SZ".to_string(),
        stock_code: "000001.SZ".to_string(),
        day,
        frame: frame.clone(),
    };
    assert_eq!(
        f.manager.callback_task(stale).await,
        Err(ErrorKind::TaskNotExists)
    );
    assert!(f.handler.callbacks.lock().unwrap().is_empty());

    let current = TaskCallback::TickFrame {
        task_id: live_id.clone(),
        stock_code: "000001.SZ".to_string(),
        day,
        frame,
    };
    f.manager.callback_task(current).await.unwrap();
    assert_eq!(*f.handler.callbacks.lock().unwrap(), vec![live_id]);
}

#[tokio::test]
async fn test_stop_all_clears_tables_and_broadcasts() {
    let f = fixture(Duration::from_secs(30));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();
    f.registry.register_worker("w2", 2, 4, "0.2.0").unwrap();

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    f.manager.new_task(tick_payload("000002.SZ")).await.unwrap();
    let stopped_id = f.manager.list_tasks()[0].task_id();

    f.manager.stop_all().await.unwrap();

    assert!(f.manager.list_tasks().is_empty());
    assert_eq!(f.transport.calls_to("stop_all").len(), 2);

    // late callbacks from the stopped groups bounce
    let stale = TaskCallback::TickFrame {
        task_id: stopped_id,
        stock_code: "000001.SZ".to_string(),
        day: chrono::NaiveDate::from_ymd_opt(2024, 3, 11).unwrap(),
        frame: factorkeeper_lib::ResultFrame::default(),
    };
    assert_eq!(
        f.manager.callback_task(stale).await,
        Err(ErrorKind::TaskNotExists)
    );
}

#[tokio::test]
async fn test_stop_running_task_notifies_worker() {
    let f = fixture(Duration::from_secs(30));
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();
    heartbeat(&f.registry, "w1", 1);

    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    f.manager.stop_task(tick_payload("000001.SZ")).await.unwrap();

    assert!(f.manager.list_tasks().is_empty());
    assert_eq!(f.transport.calls_to("update_tick_data/stop").len(), 1);
    assert_eq!(
        f.manager.stop_task(tick_payload("000001.SZ")).await,
        Err(ErrorKind::TaskNotExists)
    );
}

#[tokio::test]
async fn test_query_task_states() {
    let f = fixture(Duration::from_secs(30));

    assert_eq!(
        f.manager.query_task(tick_payload("000001.SZ")).await,
        Err(ErrorKind::TaskNotExists)
    );

    // queued without workers: ready
    f.manager.new_task(tick_payload("000001.SZ")).await.unwrap();
    assert_eq!(
        f.manager.query_task(tick_payload("000001.SZ")).await,
        Ok(TaskQueryStatus::Ready)
    );

    // dispatched: running with progress
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();
    f.manager.schedule_once().await;
    assert_eq!(
        f.manager.query_task(tick_payload("000001.SZ")).await,
        Ok(TaskQueryStatus::Running("2/5".to_string()))
    );
}

#[tokio::test]
async fn test_finished_listing_hides_sub_tasks() {
    let f = fixture_with(Duration::from_secs(30), |handler| {
        handler.with_dependencies("PARENT.VIEW", &["000001.SZ"])
    });
    f.registry.register_worker("w1", 1, 4, "0.2.0").unwrap();

    f.manager.new_task(tick_payload("PARENT.VIEW")).await.unwrap();
    f.manager.schedule_once().await;

    let child_id = f.transport.calls_to("update_tick_data")[0]
        .iter()
        .find(|(key, _)| key == "task_id")
        .map(|(_, value)| value.clone())
        .unwrap();
    f.manager
        .finish_task(
            &child_id,
            FinishCounts {
                total: Some(1),
                finished: Some(1),
                aborted: Some(0),
            },
        )
        .await
        .unwrap();

    let finished = f.manager.recent_finished_tasks(10).await.unwrap();
    assert!(finished.is_empty(), "sub-task completions are not roots");
}
