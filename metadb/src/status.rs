//! Existence checks, including the `pg_tables` probes for the dynamically
//! created result, tick and view tables.

use factorkeeper_lib::FkResult;

use crate::{
    db_err, MetaDb, SCHEMA_FACTOR_DATA, SCHEMA_STOCK_VIEW_DATA, SCHEMA_TICK_DATA,
};

impl MetaDb {
    pub async fn is_factor_exists(&self, factor: &str) -> FkResult<bool> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        crate::meta::factor_exists(&mut conn, factor, true).await
    }

    pub async fn is_version_exists(&self, factor: &str, version: &str) -> FkResult<bool> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        crate::meta::version_exists(&mut conn, factor, version).await
    }

    pub async fn is_result_table_exists(&self, linkage_id: i32) -> FkResult<bool> {
        self.table_exists(SCHEMA_FACTOR_DATA, &Self::result_table(linkage_id))
            .await
    }

    pub async fn is_tick_table_exists(&self, stock_code: &str) -> FkResult<bool> {
        self.table_exists(SCHEMA_TICK_DATA, &Self::tick_table(stock_code))
            .await
    }

    pub async fn is_view_table_exists(&self, view_name: &str) -> FkResult<bool> {
        self.table_exists(SCHEMA_STOCK_VIEW_DATA, &Self::view_table(view_name))
            .await
    }

    async fn table_exists(&self, schema: &str, table: &str) -> FkResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(1) FROM pg_tables WHERE schemaname = $1 AND tablename = $2"#,
        )
        .bind(schema)
        .bind(table)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(count > 0)
    }
}
