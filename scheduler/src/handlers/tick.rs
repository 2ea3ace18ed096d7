//! Planner front of tick update tasks. A view stock expands into one
//! dependency task per referenced stock.

use std::sync::Arc;

use async_trait::async_trait;
use factorkeeper_lib::config::is_stock_view;
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_metadb::MetaDb;

use crate::handlers::{TaskCallback, TaskHandler, UPDATE_TICK_TASK_TYPE};
use crate::manager::TaskManager;
use crate::registry::{CommandMethod, WorkerInfo, WorkerRegistry};
use crate::task::{Task, TaskPayload};

pub struct TickUpdateHandler {
    registry: Arc<WorkerRegistry>,
    store: MetaDb,
}

impl TickUpdateHandler {
    pub fn new(registry: Arc<WorkerRegistry>, store: MetaDb) -> Self {
        Self { registry, store }
    }
}

pub(crate) fn tick_task_desc(stock_code: &str) -> String {
    format!("UpdateTickData$${stock_code}")
}

#[async_trait]
impl TaskHandler for TickUpdateHandler {
    fn task_type(&self) -> &'static str {
        UPDATE_TICK_TASK_TYPE
    }

    async fn normalize(&self, payload: TaskPayload) -> FkResult<TaskPayload> {
        match payload {
            TaskPayload::UpdateTick { .. } => Ok(payload),
            _ => Err(ErrorKind::ParameterMissingOrInvalid),
        }
    }

    fn gen_task_desc(&self, payload: &TaskPayload) -> FkResult<String> {
        let TaskPayload::UpdateTick { stock_code } = payload else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };
        Ok(tick_task_desc(stock_code))
    }

    async fn new_task(&self, payload: &TaskPayload, manager: &TaskManager) -> FkResult<Task> {
        let TaskPayload::UpdateTick { stock_code } = payload else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };

        let available = self.store.tick_source().is_stock_available(stock_code).await?;

        if is_stock_view(stock_code) {
            if !available {
                return Err(ErrorKind::TickStockViewNotExists);
            }
            if !self.store.is_view_table_exists(stock_code).await? {
                let relation = self.store.get_stock_view_relation(stock_code).await?;
                self.store.create_view_table(stock_code, &relation).await?;
            }
        } else {
            if !available {
                return Err(ErrorKind::TickDataNotAvailable);
            }
            if !self.store.is_tick_table_exists(stock_code).await? {
                self.store.create_tick_table(stock_code).await?;
            }
        }

        let task = Task::new(self.gen_task_desc(payload)?, payload.clone());

        if is_stock_view(stock_code) {
            let relation = self.store.get_stock_view_relation(stock_code).await?;
            for dep_stock in relation.keys() {
                // views on views are rejected at creation; enforce anyway
                if is_stock_view(dep_stock) {
                    return Err(ErrorKind::InvalidStockViewRelation);
                }
                let dep_payload = TaskPayload::UpdateTick {
                    stock_code: dep_stock.clone(),
                };
                let dep_task = Box::pin(self.new_task(&dep_payload, manager)).await?;
                task.add_dependency(&dep_task)?;
            }
        }

        Ok(task)
    }

    async fn start_task(&self, task: &Task) -> FkResult<(String, WorkerInfo)> {
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
        let worker = worker.ok_or(ErrorKind::ServerInternalError)?;
        Ok((msg, worker))
    }

    async fn query_status(&self, task: &Task) -> FkResult<String> {
        let worker = task.worker().ok_or(ErrorKind::TaskNotExists)?;
        let fields = vec![("task_id".to_string(), task.task_id())];
        let (msg, _) = self
            .registry
            .send_command(
                "update_tick_data/status",
                CommandMethod::Post,
                &fields,
                Some(&worker),
                false,
            )
            .await?;
        Ok(msg)
    }

    async fn stop_task(&self, task: &Task) -> FkResult<String> {
        let worker = task.worker().ok_or(ErrorKind::TaskNotExists)?;
        let fields = vec![("task_id".to_string(), task.task_id())];
        let (msg, _) = self
            .registry
            .send_command(
                "update_tick_data/stop",
                CommandMethod::Post,
                &fields,
                Some(&worker),
                false,
            )
            .await?;
        Ok(msg)
    }

    async fn call_back(&self, callback: TaskCallback) -> FkResult<()> {
        let TaskCallback::TickFrame {
            stock_code,
            day,
            frame,
            ..
        } = callback
        else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };

        self.store.ingest_tick_frame(&stock_code, day, &frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_desc() {
        assert_eq!(tick_task_desc("000001.SZ"), "UpdateTickData$$000001.SZ");
        assert_ne!(tick_task_desc("A"), tick_task_desc("B"));
    }
}
