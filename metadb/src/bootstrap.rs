//! One-off schema bootstrap plus the dynamic per-linkage and per-stock
//! table DDL. Everything is `IF NOT EXISTS` so both node kinds can run it
//! at startup.

use std::collections::BTreeMap;

use factorkeeper_lib::FkResult;

use crate::{
    db_err, safe_ident, MetaDb, SCHEMA_FACTOR_DATA, SCHEMA_META, SCHEMA_STOCK_VIEW_DATA,
    SCHEMA_TICK_DATA, TABLE_FACTOR_LIST, TABLE_FACTOR_UPDATE_LOG, TABLE_FACTOR_VERSION,
    TABLE_FINISHED_TASK, TABLE_FINISHED_TASK_DEPENDENCY, TABLE_GROUP_FACTOR, TABLE_LINKAGE,
    TABLE_STOCK_VIEW_LIST, TABLE_TICK_UPDATE_LOG,
};

/// Columns of every tick table: ten order-book levels on both sides plus
/// last trade price and volume.
pub fn tick_columns() -> Vec<String> {
    let mut columns = Vec::new();
    for i in 1..=10 {
        columns.push(format!("ask{i}"));
        columns.push(format!("bid{i}"));
        columns.push(format!("asize{i}"));
        columns.push(format!("bsize{i}"));
    }
    columns.push("last".to_string());
    columns.push("volume".to_string());
    columns
}

/// Column name of one view entry: `<column>_<stock>`.
pub fn view_column(column: &str, stock_code: &str) -> String {
    format!("{column}_{stock_code}")
}

impl MetaDb {
    /// Create the four schemas and every fixed meta table.
    pub async fn bootstrap(&self) -> FkResult<()> {
        for schema in [
            SCHEMA_META,
            SCHEMA_FACTOR_DATA,
            SCHEMA_TICK_DATA,
            SCHEMA_STOCK_VIEW_DATA,
        ] {
            self.execute_ddl(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{schema}""#))
                .await?;
        }

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_FACTOR_LIST}" (
                factor text PRIMARY KEY NOT NULL,
                create_time timestamp without time zone NOT NULL
            )
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_FACTOR_VERSION}" (
                version_id serial PRIMARY KEY NOT NULL,
                factor text NOT NULL,
                version text NOT NULL,
                code bytea NOT NULL,
                UNIQUE (factor, version)
            );
            CREATE INDEX IF NOT EXISTS factor_version_name_index
                ON "{SCHEMA_META}"."{TABLE_FACTOR_VERSION}"(factor, version)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}" (
                id serial PRIMARY KEY NOT NULL,
                group_factor_name text NOT NULL,
                sub_factor_name text NOT NULL,
                version text NOT NULL
            );
            CREATE INDEX IF NOT EXISTS group_factor_member_index
                ON "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"(sub_factor_name)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_LINKAGE}" (
                linkage_id serial PRIMARY KEY NOT NULL,
                version_id int NOT NULL,
                stock_code text NOT NULL,
                create_time timestamp without time zone NOT NULL,
                update_time timestamp without time zone NOT NULL,
                UNIQUE (version_id, stock_code)
            );
            CREATE INDEX IF NOT EXISTS linkage_version_index
                ON "{SCHEMA_META}"."{TABLE_LINKAGE}"(version_id);
            CREATE INDEX IF NOT EXISTS linkage_stock_index
                ON "{SCHEMA_META}"."{TABLE_LINKAGE}"(stock_code)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_FACTOR_UPDATE_LOG}" (
                log_id serial PRIMARY KEY NOT NULL,
                linkage_id int NOT NULL,
                factor_date date NOT NULL,
                start_update_time timestamp without time zone NOT NULL,
                end_update_time timestamp without time zone
            );
            CREATE INDEX IF NOT EXISTS factor_update_log_linkage_index
                ON "{SCHEMA_META}"."{TABLE_FACTOR_UPDATE_LOG}"(linkage_id);
            CREATE INDEX IF NOT EXISTS factor_update_log_date_index
                ON "{SCHEMA_META}"."{TABLE_FACTOR_UPDATE_LOG}"(factor_date)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_TICK_UPDATE_LOG}" (
                log_id serial PRIMARY KEY NOT NULL,
                stock_code text NOT NULL,
                update_date date NOT NULL,
                start_update_time timestamp without time zone NOT NULL,
                end_update_time timestamp without time zone
            );
            CREATE INDEX IF NOT EXISTS tick_update_log_stock_index
                ON "{SCHEMA_META}"."{TABLE_TICK_UPDATE_LOG}"(stock_code);
            CREATE INDEX IF NOT EXISTS tick_update_log_date_index
                ON "{SCHEMA_META}"."{TABLE_TICK_UPDATE_LOG}"(update_date)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_FINISHED_TASK}" (
                id serial PRIMARY KEY NOT NULL,
                task_id text UNIQUE NOT NULL,
                task_type text NOT NULL,
                commit_time timestamp without time zone NOT NULL,
                finish_time timestamp without time zone NOT NULL,
                final_status text NOT NULL,
                total_sub_tasks integer,
                finished integer,
                aborted integer,
                is_sub_task integer NOT NULL,
                worker_id text
            );
            CREATE INDEX IF NOT EXISTS finished_task_type_index
                ON "{SCHEMA_META}"."{TABLE_FINISHED_TASK}"(task_type);
            CREATE INDEX IF NOT EXISTS finished_task_commit_index
                ON "{SCHEMA_META}"."{TABLE_FINISHED_TASK}"(commit_time)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_FINISHED_TASK_DEPENDENCY}" (
                id serial PRIMARY KEY NOT NULL,
                base_task_id text NOT NULL,
                dependency_task_id text NOT NULL
            );
            CREATE INDEX IF NOT EXISTS finished_task_dependency_base_index
                ON "{SCHEMA_META}"."{TABLE_FINISHED_TASK_DEPENDENCY}"(base_task_id)
            "#
        ))
        .await?;

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_META}"."{TABLE_STOCK_VIEW_LIST}" (
                stock_view_name text PRIMARY KEY NOT NULL,
                stock_view_relation text NOT NULL
            )
            "#
        ))
        .await?;

        Ok(())
    }

    /// Result table of an atomic factor: one double-precision column named
    /// after the factor.
    pub async fn create_result_table(&self, factor: &str, linkage_id: i32) -> FkResult<()> {
        self.create_result_table_with_columns(&[factor.to_string()], linkage_id)
            .await
    }

    /// Result table of a group factor: one column per member.
    pub async fn create_group_result_table(
        &self,
        members: &[String],
        linkage_id: i32,
    ) -> FkResult<()> {
        self.create_result_table_with_columns(members, linkage_id)
            .await
    }

    async fn create_result_table_with_columns(
        &self,
        columns: &[String],
        linkage_id: i32,
    ) -> FkResult<()> {
        let table = Self::result_table(linkage_id);
        let fields = columns
            .iter()
            .map(|column| Ok(format!(r#""{}" double precision"#, safe_ident(column)?)))
            .collect::<FkResult<Vec<_>>>()?
            .join(", ");

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_FACTOR_DATA}"."{table}" (
                "datetime" timestamp without time zone NOT NULL,
                "date" date NOT NULL,
                {fields}
            );
            CREATE INDEX IF NOT EXISTS "result_datetime_index_{linkage_id}"
                ON "{SCHEMA_FACTOR_DATA}"."{table}"(datetime);
            CREATE INDEX IF NOT EXISTS "result_date_index_{linkage_id}"
                ON "{SCHEMA_FACTOR_DATA}"."{table}"(date)
            "#
        ))
        .await
    }

    pub async fn create_tick_table(&self, stock_code: &str) -> FkResult<()> {
        let stock_code = safe_ident(stock_code)?;
        let table = Self::tick_table(stock_code);
        let fields = tick_columns()
            .iter()
            .map(|column| format!(r#""{column}" double precision"#))
            .collect::<Vec<_>>()
            .join(", ");

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_TICK_DATA}"."{table}" (
                "datetime" timestamp without time zone NOT NULL,
                "date" date NOT NULL,
                {fields}
            );
            CREATE INDEX IF NOT EXISTS "tick_datetime_index_{stock_code}"
                ON "{SCHEMA_TICK_DATA}"."{table}"(datetime);
            CREATE INDEX IF NOT EXISTS "tick_date_index_{stock_code}"
                ON "{SCHEMA_TICK_DATA}"."{table}"(date)
            "#
        ))
        .await
    }

    /// View table: one `<column>_<stock>` field per relation entry.
    pub async fn create_view_table(
        &self,
        view_name: &str,
        relation: &BTreeMap<String, Vec<String>>,
    ) -> FkResult<()> {
        let view_name = safe_ident(view_name)?;
        let table = Self::view_table(view_name);

        let mut fields = Vec::new();
        for (stock, columns) in relation {
            for column in columns {
                fields.push(format!(
                    r#""{}" double precision"#,
                    view_column(safe_ident(column)?, safe_ident(stock)?)
                ));
            }
        }

        self.execute_ddl(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{SCHEMA_STOCK_VIEW_DATA}"."{table}" (
                "datetime" timestamp without time zone NOT NULL,
                "date" date NOT NULL,
                {}
            );
            CREATE INDEX IF NOT EXISTS "view_datetime_index_{view_name}"
                ON "{SCHEMA_STOCK_VIEW_DATA}"."{table}"(datetime);
            CREATE INDEX IF NOT EXISTS "view_date_index_{view_name}"
                ON "{SCHEMA_STOCK_VIEW_DATA}"."{table}"(date)
            "#,
            fields.join(", ")
        ))
        .await
    }

    async fn execute_ddl(&self, sql: &str) -> FkResult<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_columns_cover_ten_levels() {
        let columns = tick_columns();
        assert_eq!(columns.len(), 42);
        assert!(columns.contains(&"ask1".to_string()));
        assert!(columns.contains(&"bsize10".to_string()));
        assert!(columns.contains(&"last".to_string()));
        assert!(columns.contains(&"volume".to_string()));
    }

    #[test]
    fn test_view_column_name() {
        assert_eq!(view_column("ask1", "000001.SZ"), "ask1_000001.SZ");
    }
}
