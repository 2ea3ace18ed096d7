//! Planner front of factor update tasks.

use std::sync::Arc;

use async_trait::async_trait;
use factorkeeper_lib::proto::DATE_FORMAT;
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_metadb::MetaDb;

use crate::handlers::{TaskCallback, TaskHandler, UPDATE_FACTOR_TASK_TYPE, UPDATE_TICK_TASK_TYPE};
use crate::manager::TaskManager;
use crate::registry::{CommandMethod, WorkerInfo, WorkerRegistry};
use crate::task::{Task, TaskPayload};

pub struct FactorUpdateHandler {
    registry: Arc<WorkerRegistry>,
    store: MetaDb,
}

impl FactorUpdateHandler {
    pub fn new(registry: Arc<WorkerRegistry>, store: MetaDb) -> Self {
        Self { registry, store }
    }
}

pub(crate) fn factor_task_desc(factor: &str, version: &str, stock_code: &str) -> String {
    format!("UpdateFactor$${factor}$${version}$${stock_code}")
}

#[async_trait]
impl TaskHandler for FactorUpdateHandler {
    fn task_type(&self) -> &'static str {
        UPDATE_FACTOR_TASK_TYPE
    }

    async fn normalize(&self, payload: TaskPayload) -> FkResult<TaskPayload> {
        let TaskPayload::UpdateFactor {
            factor,
            version,
            stock_code,
        } = payload
        else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };
        Ok(TaskPayload::UpdateFactor {
            factor: self.store.resolve_group(&factor).await?,
            version,
            stock_code,
        })
    }

    fn gen_task_desc(&self, payload: &TaskPayload) -> FkResult<String> {
        let TaskPayload::UpdateFactor {
            factor,
            version,
            stock_code,
        } = payload
        else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };
        Ok(factor_task_desc(factor, version, stock_code))
    }

    async fn new_task(&self, payload: &TaskPayload, manager: &TaskManager) -> FkResult<Task> {
        let TaskPayload::UpdateFactor {
            factor,
            version,
            stock_code,
        } = payload
        else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };

        let linkage_id = self.store.get_linkage_id(factor, version, stock_code).await?;

        if !self.store.is_result_table_exists(linkage_id).await? {
            if self.store.is_group_factor(factor).await? {
                let members = self.store.get_members(factor, Some(version)).await?;
                self.store
                    .create_group_result_table(&members, linkage_id)
                    .await?;
            } else {
                self.store.create_result_table(factor, linkage_id).await?;
            }
        }

        let task = Task::new(self.gen_task_desc(payload)?, payload.clone());

        // stale tick data gets refreshed first, as a dependency
        if !self.store.is_tick_data_current(stock_code).await? {
            let tick_handler = manager.handler(UPDATE_TICK_TASK_TYPE)?;
            let tick_payload = TaskPayload::UpdateTick {
                stock_code: stock_code.clone(),
            };
            let tick_task = tick_handler.new_task(&tick_payload, manager).await?;
            task.add_dependency(&tick_task)?;
        }

        Ok(task)
    }

    async fn start_task(&self, task: &Task) -> FkResult<(String, WorkerInfo)> {
        let TaskPayload::UpdateFactor {
            factor,
            version,
            stock_code,
        } = task.payload()
        else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };

        let fields = vec![
            ("task_id".to_string(), task.task_id()),
            ("factor".to_string(), factor.clone()),
            ("version".to_string(), version.clone()),
            ("stock_code".to_string(), stock_code.clone()),
        ];
        let (msg, worker) = self
            .registry
            .send_command("update_factor", CommandMethod::Post, &fields, None, false)
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
                "update_factor/status",
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
                "update_factor/stop",
                CommandMethod::Post,
                &fields,
                Some(&worker),
                false,
            )
            .await?;
        Ok(msg)
    }

    async fn call_back(&self, callback: TaskCallback) -> FkResult<()> {
        let TaskCallback::FactorFrame {
            factor,
            version,
            stock_code,
            day,
            frame,
            ..
        } = callback
        else {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        };

        self.store
            .ingest_factor_frame(&factor, &version, &stock_code, day, &frame)
            .await?;
        tracing::info!(
            factor,
            version,
            stock_code,
            day = %day.format(DATE_FORMAT),
            "factor frame ingested"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_is_pure_and_unique_per_args() {
        let a = factor_task_desc("alpha", "v1", "000001.SZ");
        let b = factor_task_desc("alpha", "v1", "000002.SZ");
        let c = factor_task_desc("alpha", "v2", "000001.SZ");
        assert_eq!(a, "UpdateFactor$$alpha$$v1$$000001.SZ");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
