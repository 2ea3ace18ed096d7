//! Persistence of retired coordinator tasks and their dependency edges.

use chrono::NaiveDateTime;
use factorkeeper_lib::FkResult;
use sqlx::FromRow;

use crate::{db_err, MetaDb, SCHEMA_META, TABLE_FINISHED_TASK, TABLE_FINISHED_TASK_DEPENDENCY};

/// What gets written when a task retires. Counts are whatever the worker
/// reported; a task that never ran leaves them empty.
#[derive(Debug, Clone, FromRow)]
pub struct FinishedTaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub commit_time: NaiveDateTime,
    pub finish_time: NaiveDateTime,
    pub final_status: String,
    pub total_sub_tasks: Option<i32>,
    pub finished: Option<i32>,
    pub aborted: Option<i32>,
    pub is_sub_task: i32,
    pub worker_id: Option<String>,
}

/// A finished task with its recursively attached dependencies.
#[derive(Debug, Clone)]
pub struct FinishedTaskInfo {
    pub record: FinishedTaskRecord,
    pub dependencies: Vec<FinishedTaskInfo>,
}

impl MetaDb {
    pub async fn record_finished_task(&self, record: &FinishedTaskRecord) -> FkResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO "{SCHEMA_META}"."{TABLE_FINISHED_TASK}"
                (task_id, task_type, commit_time, finish_time, final_status,
                 total_sub_tasks, finished, aborted, is_sub_task, worker_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#
        ))
        .bind(&record.task_id)
        .bind(&record.task_type)
        .bind(record.commit_time)
        .bind(record.finish_time)
        .bind(&record.final_status)
        .bind(record.total_sub_tasks)
        .bind(record.finished)
        .bind(record.aborted)
        .bind(record.is_sub_task)
        .bind(&record.worker_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn record_task_dependencies(
        &self,
        base_task_id: &str,
        dependency_ids: &[String],
    ) -> FkResult<()> {
        for dependency_id in dependency_ids {
            sqlx::query(&format!(
                r#"
                INSERT INTO "{SCHEMA_META}"."{TABLE_FINISHED_TASK_DEPENDENCY}"
                    (base_task_id, dependency_task_id)
                VALUES ($1, $2)
                "#
            ))
            .bind(base_task_id)
            .bind(dependency_id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    /// The `limit` most recent root tasks, newest first, each with its
    /// dependency tree attached.
    pub async fn recent_finished_tasks(&self, limit: i64) -> FkResult<Vec<FinishedTaskInfo>> {
        let records: Vec<FinishedTaskRecord> = sqlx::query_as(&format!(
            r#"
            SELECT task_id, task_type, commit_time, finish_time, final_status,
                   total_sub_tasks, finished, aborted, is_sub_task, worker_id
            FROM "{SCHEMA_META}"."{TABLE_FINISHED_TASK}"
            WHERE is_sub_task = 0
            ORDER BY id DESC LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        let mut tasks = Vec::with_capacity(records.len());
        for record in records {
            let dependencies = self.load_dependencies(&record.task_id).await?;
            tasks.push(FinishedTaskInfo {
                record,
                dependencies,
            });
        }
        Ok(tasks)
    }

    /// Walk the dependency edges iteratively; the planners only ever build
    /// shallow trees but nothing here assumes that.
    async fn load_dependencies(&self, task_id: &str) -> FkResult<Vec<FinishedTaskInfo>> {
        let dependency_ids: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT dependency_task_id FROM "{SCHEMA_META}"."{TABLE_FINISHED_TASK_DEPENDENCY}"
            WHERE base_task_id = $1
            "#
        ))
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        let mut dependencies = Vec::new();
        for (dependency_id,) in dependency_ids {
            let record: Option<FinishedTaskRecord> = sqlx::query_as(&format!(
                r#"
                SELECT task_id, task_type, commit_time, finish_time, final_status,
                       total_sub_tasks, finished, aborted, is_sub_task, worker_id
                FROM "{SCHEMA_META}"."{TABLE_FINISHED_TASK}"
                WHERE task_id = $1
                "#
            ))
            .bind(&dependency_id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

            if let Some(record) = record {
                let nested = Box::pin(self.load_dependencies(&record.task_id)).await?;
                dependencies.push(FinishedTaskInfo {
                    record,
                    dependencies: nested,
                });
            }
        }
        Ok(dependencies)
    }
}
