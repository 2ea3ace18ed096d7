//! Typed gateway to the relational store.
//!
//! Four schemas: `fk_meta` (factors, versions, groups, linkages, update
//! logs, finished tasks, stock views), `fk_factor_data` (one result table
//! per linkage), `fk_tick_data` and `fk_stock_view_data` (one table per
//! stock or view). Store faults collapse to `DB_EXECUTION_FAILED`; every
//! other kind a method returns is part of its contract.

mod bootstrap;
mod finished;
mod getters;
mod ingest;
mod meta;
mod status;
mod tick;
mod views;

use std::sync::Arc;

use factorkeeper_lib::{ErrorKind, FkResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use finished::{FinishedTaskInfo, FinishedTaskRecord};
pub use tick::{PgTickSource, TickSource};

pub const SCHEMA_META: &str = "fk_meta";
pub const SCHEMA_FACTOR_DATA: &str = "fk_factor_data";
pub const SCHEMA_TICK_DATA: &str = "fk_tick_data";
pub const SCHEMA_STOCK_VIEW_DATA: &str = "fk_stock_view_data";

pub const TABLE_FACTOR_LIST: &str = "factor_list";
pub const TABLE_FACTOR_VERSION: &str = "factor_version";
pub const TABLE_GROUP_FACTOR: &str = "group_factor";
pub const TABLE_LINKAGE: &str = "factor_tick_linkage";
pub const TABLE_FACTOR_UPDATE_LOG: &str = "factor_update_log";
pub const TABLE_TICK_UPDATE_LOG: &str = "tick_update_log";
pub const TABLE_FINISHED_TASK: &str = "finished_task";
pub const TABLE_FINISHED_TASK_DEPENDENCY: &str = "finished_task_dependency";
pub const TABLE_STOCK_VIEW_LIST: &str = "stock_view_list";

pub const RESULT_TABLE_PREFIX: &str = "RESULT_";
pub const TICK_TABLE_PREFIX: &str = "TICK_";
pub const VIEW_TABLE_PREFIX: &str = "VIEW_";

/// Handle to the store. Cheap to clone; unit tasks open their own handle
/// with a single connection instead of sharing a pool.
#[derive(Debug, Clone)]
pub struct MetaDb {
    pool: PgPool,
    tick_source: Arc<dyn TickSource>,
}

impl MetaDb {
    pub async fn connect(database_url: &str, max_connections: u32) -> FkResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        let tick_source = Arc::new(PgTickSource::new(pool.clone()));
        Ok(Self { pool, tick_source })
    }

    /// A fresh single-connection handle, the shape unit tasks use.
    pub async fn connect_single(database_url: &str) -> FkResult<Self> {
        Self::connect(database_url, 1).await
    }

    pub fn with_tick_source(mut self, tick_source: Arc<dyn TickSource>) -> Self {
        self.tick_source = tick_source;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tick_source(&self) -> &Arc<dyn TickSource> {
        &self.tick_source
    }

    pub fn result_table(linkage_id: i32) -> String {
        format!("{RESULT_TABLE_PREFIX}{linkage_id}")
    }

    pub fn tick_table(stock_code: &str) -> String {
        format!("{TICK_TABLE_PREFIX}{stock_code}")
    }

    pub fn view_table(view_name: &str) -> String {
        format!("{VIEW_TABLE_PREFIX}{view_name}")
    }
}

/// Collapse a store fault to the taxonomy, keeping the cause in the log.
pub(crate) fn db_err(err: sqlx::Error) -> ErrorKind {
    tracing::error!("store execution failed: {err}");
    ErrorKind::DbExecutionFailed
}

/// Identifiers interpolated into SQL (factor names become result columns,
/// stock codes become table suffixes) must stay inside this alphabet; the
/// values themselves always travel as bind parameters.
pub(crate) fn safe_ident(ident: &str) -> FkResult<&str> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '#'));
    if ok {
        Ok(ident)
    } else {
        Err(ErrorKind::ParameterMissingOrInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_ident() {
        assert!(safe_ident("close_price").is_ok());
        assert!(safe_ident("000001.SZ").is_ok());
        assert!(safe_ident("G#alpha#beta").is_ok());
        assert!(safe_ident("").is_err());
        assert!(safe_ident("drop table\"; --").is_err());
        assert!(safe_ident("a b").is_err());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(MetaDb::result_table(7), "RESULT_7");
        assert_eq!(MetaDb::tick_table("000001.SZ"), "TICK_000001.SZ");
        assert_eq!(MetaDb::view_table("B.VIEW"), "VIEW_B.VIEW");
    }
}
