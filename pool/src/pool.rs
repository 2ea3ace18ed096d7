use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use factorkeeper_lib::{ErrorKind, FkResult};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::{LogLevel, MessageLogger, PoolMessage};
use crate::task::{GroupStatus, TaskGroup, UnitKind, UnitTask};

const MESSAGE_QUEUE_DEPTH: usize = 1024;

/// What a unit run came to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Finished,
    Aborted(ErrorKind),
    /// The coordinator answered `TASK_NOT_EXISTS`: the whole group was
    /// stopped behind our back and must be torn down.
    StaleGroup,
}

/// Per-unit parameters injected by the pool.
#[derive(Clone)]
pub struct UnitContext {
    pub task_id: String,
    pub group_id: String,
    pub generation: u64,
    pub cancel: CancellationToken,
    pub queue: mpsc::Sender<PoolMessage>,
    pub logger: MessageLogger,
}

/// Executes the body of one unit task. The pool owns the envelope
/// (capacity, cancellation, finish-ack); implementations own the domain
/// work and must tie any spawned OS process to `ctx.cancel`.
#[async_trait]
pub trait UnitRunner: Send + Sync + 'static {
    async fn run(&self, unit: UnitTask, ctx: UnitContext) -> UnitOutcome;
}

/// Receives the finish-ack of a retired group. The executor's
/// implementation forwards it to the coordinator.
#[async_trait]
pub trait FinishSink: Send + Sync + 'static {
    async fn finish_ack(&self, group_id: &str, status: GroupStatus);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupProgress {
    pub total: usize,
    pub finished: usize,
    pub aborted: usize,
    pub finish_ratio: f64,
}

struct PoolInner {
    groups: HashMap<String, TaskGroup>,
    generation: u64,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

/// Bounded pool of unit tasks with a single message loop.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Mutex<PoolInner>>,
    tx: mpsc::Sender<PoolMessage>,
    runner: Arc<dyn UnitRunner>,
    sink: Arc<dyn FinishSink>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize, runner: Arc<dyn UnitRunner>, sink: Arc<dyn FinishSink>) -> Self {
        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        let pool = Self {
            inner: Arc::new(Mutex::new(PoolInner {
                groups: HashMap::new(),
                generation: 0,
                cancel: CancellationToken::new(),
                semaphore: Arc::new(Semaphore::new(capacity)),
            })),
            tx,
            runner,
            sink,
            capacity,
        };
        tokio::spawn(message_loop(pool.clone(), rx));
        pool
    }

    /// Schedule every unit of a new group. Refuses duplicates and empty
    /// groups.
    pub async fn apply_task_group(&self, group: TaskGroup) -> FkResult<()> {
        if group.is_empty() {
            return Err(ErrorKind::TaskGroupIsEmpty);
        }

        let mut inner = self.inner.lock().await;
        if inner.groups.contains_key(&group.group_id) {
            return Err(ErrorKind::TaskAlreadyExists);
        }

        info!(group_id = %group.group_id, units = group.status().total, "apply task group");
        for task in group.running_tasks() {
            self.spawn_unit(
                task.clone(),
                group.group_id.clone(),
                inner.generation,
                inner.cancel.clone(),
                inner.semaphore.clone(),
            );
        }
        inner.groups.insert(group.group_id.clone(), group);
        Ok(())
    }

    /// Remove one group and restart the pool, re-enqueueing the still
    /// running units of every other live group.
    pub async fn stop_task_group(&self, group_id: &str) -> FkResult<()> {
        {
            let mut inner = self.inner.lock().await;
            let group = inner
                .groups
                .remove(group_id)
                .ok_or(ErrorKind::TaskGroupNotExists)?;
            let status = group.status();
            drop(inner);
            self.sink.finish_ack(group_id, status).await;
        }
        self.kill_all(true).await;
        Ok(())
    }

    /// Remove every group of one kind, then restart the pool.
    pub async fn stop_task_groups(&self, kind: UnitKind) -> FkResult<()> {
        let removed: Vec<(String, GroupStatus)> = {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner
                .groups
                .values()
                .filter(|group| group.kind == kind)
                .map(|group| group.group_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.groups.remove(&id).map(|group| (id, group.status())))
                .collect()
        };
        for (group_id, status) in removed {
            self.sink.finish_ack(&group_id, status).await;
        }
        self.kill_all(true).await;
        Ok(())
    }

    /// Terminate every in-flight unit, drop stale messages, rebuild the
    /// pool. With `restart`, still-running units of live groups are
    /// re-enqueued; without it the group table is cleared as well.
    pub async fn kill_all(&self, restart: bool) {
        let mut inner = self.inner.lock().await;
        inner.cancel.cancel();
        inner.generation += 1;
        inner.cancel = CancellationToken::new();
        inner.semaphore = Arc::new(Semaphore::new(self.capacity));
        info!(generation = inner.generation, restart, "pool rebuilt");

        if restart {
            for group in inner.groups.values() {
                for task in group.running_tasks() {
                    self.spawn_unit(
                        task.clone(),
                        group.group_id.clone(),
                        inner.generation,
                        inner.cancel.clone(),
                        inner.semaphore.clone(),
                    );
                }
            }
        } else {
            inner.groups.clear();
        }
    }

    pub async fn group_ids(&self) -> Vec<String> {
        self.inner.lock().await.groups.keys().cloned().collect()
    }

    pub async fn query_group_progress(&self, group_id: &str) -> FkResult<GroupProgress> {
        let inner = self.inner.lock().await;
        let group = inner
            .groups
            .get(group_id)
            .ok_or(ErrorKind::TaskGroupNotExists)?;
        let status = group.status();
        let done = status.finished + status.aborted;
        Ok(GroupProgress {
            total: status.total,
            finished: status.finished,
            aborted: status.aborted,
            finish_ratio: done as f64 / status.total as f64,
        })
    }

    fn spawn_unit(
        &self,
        unit: UnitTask,
        group_id: String,
        generation: u64,
        cancel: CancellationToken,
        semaphore: Arc<Semaphore>,
    ) {
        let runner = self.runner.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let task_id = unit.task_id();
            let logger = MessageLogger::new(&task_id, &group_id, "WORK_RUNNER", tx.clone());
            let ctx = UnitContext {
                task_id: task_id.clone(),
                group_id: group_id.clone(),
                generation,
                cancel: cancel.clone(),
                queue: tx.clone(),
                logger: logger.clone(),
            };

            let mut handle = tokio::spawn({
                let runner = runner.clone();
                let unit = unit.clone();
                let ctx = ctx.clone();
                async move { runner.run(unit, ctx).await }
            });

            let outcome = tokio::select! {
                // pool rebuild: the unit will be re-enqueued, no ack
                _ = cancel.cancelled() => {
                    handle.abort();
                    return;
                }
                joined = &mut handle => joined,
            };

            let aborted = match outcome {
                Ok(UnitOutcome::Finished) => false,
                Ok(UnitOutcome::Aborted(kind)) => {
                    logger.error(format!("unit aborted: {kind}")).await;
                    true
                }
                Ok(UnitOutcome::StaleGroup) => {
                    let _ = tx
                        .send(PoolMessage::Kill {
                            group_id,
                            generation,
                        })
                        .await;
                    return;
                }
                // user code took the whole unit down with it
                Err(join_err) => {
                    logger.error(format!("unit panicked: {join_err}")).await;
                    true
                }
            };

            let _ = tx
                .send(PoolMessage::FinishAck {
                    task_id,
                    group_id,
                    aborted,
                    generation,
                })
                .await;
        });
    }

    async fn handle_message(&self, message: PoolMessage) {
        match message {
            PoolMessage::Progress {
                task_id,
                value,
                generation,
            } => {
                let inner = self.inner.lock().await;
                if generation == inner.generation {
                    debug!(task_id, progress = value, "unit progress");
                }
            }
            PoolMessage::Log {
                task_id,
                level,
                content,
                stack,
            } => match level {
                LogLevel::Info => info!(task_id, stack, "{content}"),
                LogLevel::Warn => warn!(task_id, stack, "{content}"),
                LogLevel::Error => error!(task_id, stack, "{content}"),
            },
            PoolMessage::FinishAck {
                task_id,
                group_id,
                aborted,
                generation,
            } => {
                let retired = {
                    let mut inner = self.inner.lock().await;
                    if generation != inner.generation {
                        return;
                    }
                    let finished = match inner.groups.get_mut(&group_id) {
                        Some(group) => {
                            group.complete(&task_id, aborted);
                            group.is_finished()
                        }
                        None => return,
                    };
                    if finished {
                        inner.groups.remove(&group_id).map(|group| group.status())
                    } else {
                        None
                    }
                };
                if let Some(status) = retired {
                    info!(group_id, "task group finished");
                    self.sink.finish_ack(&group_id, status).await;
                }
            }
            PoolMessage::Kill {
                group_id,
                generation,
            } => {
                let removed = {
                    let mut inner = self.inner.lock().await;
                    if generation != inner.generation {
                        return;
                    }
                    inner.groups.remove(&group_id).map(|group| group.status())
                };
                if let Some(status) = removed {
                    warn!(group_id, "group killed by stale-task reply");
                    self.sink.finish_ack(&group_id, status).await;
                    self.kill_all(true).await;
                }
            }
        }
    }
}

async fn message_loop(pool: WorkerPool, mut rx: mpsc::Receiver<PoolMessage>) {
    while let Some(message) = rx.recv().await {
        pool.handle_message(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::UnitSpec;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tokio::time::timeout;

    struct RecordingSink {
        tx: mpsc::UnboundedSender<(String, GroupStatus)>,
    }

    #[async_trait]
    impl FinishSink for RecordingSink {
        async fn finish_ack(&self, group_id: &str, status: GroupStatus) {
            let _ = self.tx.send((group_id.to_string(), status));
        }
    }

    /// Aborts units whose sub id starts with "bad", hangs units whose sub
    /// id starts with "hang" until the first pool rebuild, finishes the
    /// rest immediately.
    struct ScriptedRunner;

    #[async_trait]
    impl UnitRunner for ScriptedRunner {
        async fn run(&self, unit: UnitTask, ctx: UnitContext) -> UnitOutcome {
            let id = unit.task_id();
            if id.contains("bad") {
                UnitOutcome::Aborted(ErrorKind::FactorGenerateFailed)
            } else if id.contains("hang") && ctx.generation == 0 {
                ctx.cancel.cancelled().await;
                UnitOutcome::Finished
            } else if id.contains("stale") {
                UnitOutcome::StaleGroup
            } else {
                UnitOutcome::Finished
            }
        }
    }

    fn unit(kind: UnitKind, sub_id: &str) -> UnitTask {
        UnitTask::new(
            kind,
            sub_id,
            UnitSpec::TickDay {
                stock_code: sub_id.to_string(),
                day: NaiveDate::from_ymd_opt(2024, 3, 11).unwrap(),
            },
        )
    }

    fn pool_with_sink() -> (WorkerPool, mpsc::UnboundedReceiver<(String, GroupStatus)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(2, Arc::new(ScriptedRunner), Arc::new(RecordingSink { tx }));
        (pool, rx)
    }

    async fn next_ack(
        rx: &mut mpsc::UnboundedReceiver<(String, GroupStatus)>,
    ) -> (String, GroupStatus) {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("finish ack in time")
            .expect("sink alive")
    }

    #[tokio::test]
    async fn test_empty_group_refused() {
        let (pool, _rx) = pool_with_sink();
        let group = TaskGroup::new(UnitKind::UpdateTick, "g-empty");
        assert_eq!(
            pool.apply_task_group(group).await,
            Err(ErrorKind::TaskGroupIsEmpty)
        );
    }

    #[tokio::test]
    async fn test_duplicate_group_refused() {
        let (pool, mut rx) = pool_with_sink();

        let mut group = TaskGroup::new(UnitKind::UpdateTick, "g-hang");
        group.add_task(unit(UnitKind::UpdateTick, "hang-a"));
        pool.apply_task_group(group).await.unwrap();

        let mut dup = TaskGroup::new(UnitKind::UpdateTick, "g-hang");
        dup.add_task(unit(UnitKind::UpdateTick, "hang-b"));
        assert_eq!(
            pool.apply_task_group(dup).await,
            Err(ErrorKind::TaskAlreadyExists)
        );

        pool.stop_task_group("g-hang").await.unwrap();
        let (id, _) = next_ack(&mut rx).await;
        assert_eq!(id, "g-hang");
    }

    #[tokio::test]
    async fn test_group_retires_with_counts() {
        let (pool, mut rx) = pool_with_sink();

        let mut group = TaskGroup::new(UnitKind::UpdateFactor, "g1");
        group.add_task(unit(UnitKind::UpdateFactor, "ok-1"));
        group.add_task(unit(UnitKind::UpdateFactor, "ok-2"));
        group.add_task(unit(UnitKind::UpdateFactor, "bad-1"));
        pool.apply_task_group(group).await.unwrap();

        let (id, status) = next_ack(&mut rx).await;
        assert_eq!(id, "g1");
        assert_eq!(
            status,
            GroupStatus {
                total: 3,
                finished: 2,
                aborted: 1
            }
        );
        assert!(pool.group_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_reports_partial_counts_and_restarts_others() {
        let (pool, mut rx) = pool_with_sink();

        // both groups hang in generation 0
        let mut stopped = TaskGroup::new(UnitKind::UpdateFactor, "g-stop");
        stopped.add_task(unit(UnitKind::UpdateFactor, "hang-stop"));
        pool.apply_task_group(stopped).await.unwrap();

        let mut survivor = TaskGroup::new(UnitKind::UpdateTick, "g-live");
        survivor.add_task(unit(UnitKind::UpdateTick, "hang-live"));
        pool.apply_task_group(survivor).await.unwrap();

        pool.stop_task_group("g-stop").await.unwrap();

        // first ack: the stopped group, nothing completed yet
        let (id, status) = next_ack(&mut rx).await;
        assert_eq!(id, "g-stop");
        assert_eq!(status.finished + status.aborted, 0);

        // the survivor was re-enqueued in generation 1 where it finishes
        let (id, status) = next_ack(&mut rx).await;
        assert_eq!(id, "g-live");
        assert_eq!(
            status,
            GroupStatus {
                total: 1,
                finished: 1,
                aborted: 0
            }
        );
    }

    #[tokio::test]
    async fn test_stop_by_kind_only_hits_that_kind() {
        let (pool, mut rx) = pool_with_sink();

        let mut factor = TaskGroup::new(UnitKind::UpdateFactor, "g-factor");
        factor.add_task(unit(UnitKind::UpdateFactor, "hang-f"));
        pool.apply_task_group(factor).await.unwrap();

        let mut tick = TaskGroup::new(UnitKind::UpdateTick, "g-tick");
        tick.add_task(unit(UnitKind::UpdateTick, "hang-t"));
        pool.apply_task_group(tick).await.unwrap();

        pool.stop_task_groups(UnitKind::UpdateFactor).await.unwrap();

        let (id, _) = next_ack(&mut rx).await;
        assert_eq!(id, "g-factor");

        // tick group survives the rebuild and completes in generation 1
        let (id, status) = next_ack(&mut rx).await;
        assert_eq!(id, "g-tick");
        assert_eq!(status.finished, 1);
    }

    #[tokio::test]
    async fn test_stale_group_reply_kills_group() {
        let (pool, mut rx) = pool_with_sink();

        let mut group = TaskGroup::new(UnitKind::UpdateFactor, "g-stale");
        group.add_task(unit(UnitKind::UpdateFactor, "stale-1"));
        pool.apply_task_group(group).await.unwrap();

        let (id, status) = next_ack(&mut rx).await;
        assert_eq!(id, "g-stale");
        assert_eq!(status.finished + status.aborted, 0);
        assert!(pool.group_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_progress_query() {
        let (pool, mut rx) = pool_with_sink();

        let mut group = TaskGroup::new(UnitKind::UpdateFactor, "g-q");
        group.add_task(unit(UnitKind::UpdateFactor, "hang-q"));
        group.add_task(unit(UnitKind::UpdateFactor, "hang-q2"));
        pool.apply_task_group(group).await.unwrap();

        let progress = pool.query_group_progress("g-q").await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.finished, 0);

        assert_eq!(
            pool.query_group_progress("nope").await,
            Err(ErrorKind::TaskGroupNotExists)
        );

        pool.stop_task_group("g-q").await.unwrap();
        let _ = next_ack(&mut rx).await;
    }
}
