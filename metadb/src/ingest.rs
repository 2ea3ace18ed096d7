//! Result and tick ingestion: the idempotent day-write bracket.
//!
//! A day becomes visible to readers only once its update-log row gets an
//! `end_update_time`. Clearing the day's rows before appending makes
//! re-delivery of the same callback harmless, which is what lets the rest
//! of the system be at-least-once.

use chrono::{Local, NaiveDate};
use factorkeeper_lib::config::{is_stock_view, FACTOR_LENGTH, TICK_LENGTH};
use factorkeeper_lib::{ErrorKind, FkResult, ResultFrame};
use tracing::info;

use crate::{
    db_err, safe_ident, MetaDb, SCHEMA_FACTOR_DATA, SCHEMA_META, SCHEMA_STOCK_VIEW_DATA,
    SCHEMA_TICK_DATA, TABLE_FACTOR_UPDATE_LOG, TABLE_TICK_UPDATE_LOG,
};

impl MetaDb {
    /// Commit one day of factor results for a linkage.
    pub async fn ingest_factor_frame(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        day: NaiveDate,
        frame: &ResultFrame,
    ) -> FkResult<()> {
        frame.validate_row_count(FACTOR_LENGTH, ErrorKind::InvalidFactorResult)?;

        // group frames must carry every member column; atomic frames the
        // factor's own column
        let factor = self.resolve_group(factor).await?;
        let signature = if self.is_group_factor(&factor).await? {
            let members = self.get_members(&factor, Some(version)).await?;
            if !frame.covers_signature(&members) {
                return Err(ErrorKind::GroupFactorSignatureNotMatched);
            }
            members
        } else {
            vec![factor.clone()]
        };
        let frame = frame.select_columns(&signature).map_err(|_| {
            if signature.len() == 1 {
                ErrorKind::InvalidFactorResult
            } else {
                ErrorKind::GroupFactorSignatureNotMatched
            }
        })?;

        let linkage_id = self.get_linkage_id(&factor, version, stock_code).await?;
        if self.is_result_table_exists(linkage_id).await? {
            self.clean_factor_day(linkage_id, day).await?;
        }

        let log_id = self.start_update_log(linkage_id, day).await?;
        let table = Self::result_table(linkage_id);
        self.append_frame(SCHEMA_FACTOR_DATA, &table, &frame).await?;
        self.finish_update_log(log_id).await?;

        info!(factor, version, stock_code, %day, "factor day committed");
        Ok(())
    }

    /// Commit one day of tick data. View frames go to the view schema,
    /// plain frames to the tick schema.
    pub async fn ingest_tick_frame(
        &self,
        stock_code: &str,
        day: NaiveDate,
        frame: &ResultFrame,
    ) -> FkResult<()> {
        frame.validate_row_count(TICK_LENGTH, ErrorKind::TickResultIncorrect)?;

        let (schema, table) = if is_stock_view(stock_code) {
            (SCHEMA_STOCK_VIEW_DATA, Self::view_table(stock_code))
        } else {
            (SCHEMA_TICK_DATA, Self::tick_table(stock_code))
        };

        self.clean_day(schema, &table, day).await?;

        let log_id = self.start_tick_log(stock_code, day).await?;
        self.append_frame(schema, &table, frame).await?;
        self.finish_tick_log(log_id).await?;

        info!(stock_code, %day, "tick day committed");
        Ok(())
    }

    /// Drop whatever a previously failed update left behind for a day.
    pub async fn clean_factor_day(&self, linkage_id: i32, day: NaiveDate) -> FkResult<()> {
        let table = Self::result_table(linkage_id);
        self.clean_day(SCHEMA_FACTOR_DATA, &table, day).await
    }

    async fn clean_day(&self, schema: &str, table: &str, day: NaiveDate) -> FkResult<()> {
        sqlx::query(&format!(
            r#"DELETE FROM "{schema}"."{table}" WHERE "date" = $1"#
        ))
        .bind(day)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn start_update_log(&self, linkage_id: i32, day: NaiveDate) -> FkResult<i32> {
        let (log_id,): (i32,) = sqlx::query_as(&format!(
            r#"
            INSERT INTO "{SCHEMA_META}"."{TABLE_FACTOR_UPDATE_LOG}"
                (linkage_id, factor_date, start_update_time)
            VALUES ($1, $2, $3)
            RETURNING log_id
            "#
        ))
        .bind(linkage_id)
        .bind(day)
        .bind(Local::now().naive_local())
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(log_id)
    }

    pub async fn finish_update_log(&self, log_id: i32) -> FkResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE "{SCHEMA_META}"."{TABLE_FACTOR_UPDATE_LOG}"
            SET end_update_time = $1 WHERE log_id = $2
            "#
        ))
        .bind(Local::now().naive_local())
        .bind(log_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn start_tick_log(&self, stock_code: &str, day: NaiveDate) -> FkResult<i32> {
        let (log_id,): (i32,) = sqlx::query_as(&format!(
            r#"
            INSERT INTO "{SCHEMA_META}"."{TABLE_TICK_UPDATE_LOG}"
                (stock_code, update_date, start_update_time)
            VALUES ($1, $2, $3)
            RETURNING log_id
            "#
        ))
        .bind(stock_code)
        .bind(day)
        .bind(Local::now().naive_local())
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(log_id)
    }

    pub async fn finish_tick_log(&self, log_id: i32) -> FkResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE "{SCHEMA_META}"."{TABLE_TICK_UPDATE_LOG}"
            SET end_update_time = $1 WHERE log_id = $2
            "#
        ))
        .bind(Local::now().naive_local())
        .bind(log_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Append a frame to a data table with chunked multi-row inserts.
    async fn append_frame(&self, schema: &str, table: &str, frame: &ResultFrame) -> FkResult<()> {
        let names = frame.factor_columns();
        let mut columns = Vec::with_capacity(names.len());
        for name in &names {
            safe_ident(name)?;
            columns.push((
                *name,
                frame.column(name).ok_or(ErrorKind::InvalidFactorResult)?,
            ));
        }

        let column_sql = names
            .iter()
            .map(|name| format!(r#""{name}""#))
            .collect::<Vec<_>>()
            .join(", ");

        // stay far below the bind-parameter ceiling even for wide groups
        const CHUNK_ROWS: usize = 500;
        let mut start = 0;
        while start < frame.row_count() {
            let end = (start + CHUNK_ROWS).min(frame.row_count());

            let mut builder = sqlx::QueryBuilder::new(format!(
                r#"INSERT INTO "{schema}"."{table}" ("datetime", "date", {column_sql}) "#
            ));
            builder.push_values(start..end, |mut row, i| {
                row.push_bind(frame.datetime()[i]);
                row.push_bind(frame.date()[i]);
                for (_, values) in &columns {
                    row.push_bind(values[i]);
                }
            });
            builder
                .build()
                .execute(self.pool())
                .await
                .map_err(db_err)?;

            start = end;
        }
        Ok(())
    }
}
