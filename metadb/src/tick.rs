//! Tick data reads plus the seam to the external import source.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use factorkeeper_lib::config::is_stock_view;
use factorkeeper_lib::{ErrorKind, FkResult, ResultFrame};
use sqlx::{PgPool, Row};

use crate::bootstrap::view_column;
use crate::{
    db_err, safe_ident, MetaDb, SCHEMA_META, SCHEMA_STOCK_VIEW_DATA, SCHEMA_TICK_DATA,
    TABLE_TICK_UPDATE_LOG,
};

/// The out-of-scope import adapter: where raw tick data comes from before
/// this system has ingested it. The default implementation reads a source
/// schema in the same Postgres instance.
#[async_trait]
pub trait TickSource: Send + Sync + std::fmt::Debug + 'static {
    async fn is_stock_available(&self, stock_code: &str) -> FkResult<bool>;
    async fn available_dates(&self, stock_code: &str) -> FkResult<Vec<NaiveDate>>;
    async fn load_day(&self, stock_code: &str, day: NaiveDate) -> FkResult<ResultFrame>;
}

pub const SOURCE_SCHEMA: &str = "fk_tick_source";

#[derive(Debug, Clone)]
pub struct PgTickSource {
    pool: PgPool,
}

impl PgTickSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TickSource for PgTickSource {
    async fn is_stock_available(&self, stock_code: &str) -> FkResult<bool> {
        if is_stock_view(stock_code) {
            // views exist once registered, their inputs are checked per member
            let (count,): (i64,) = sqlx::query_as(&format!(
                r#"
                SELECT COUNT(1) FROM "{SCHEMA_META}"."{}"
                WHERE stock_view_name = $1
                "#,
                crate::TABLE_STOCK_VIEW_LIST
            ))
            .bind(stock_code)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            return Ok(count > 0);
        }

        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(1) FROM pg_tables WHERE schemaname = $1 AND tablename = $2"#,
        )
        .bind(SOURCE_SCHEMA)
        .bind(stock_code)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn available_dates(&self, stock_code: &str) -> FkResult<Vec<NaiveDate>> {
        if !self.is_stock_available(stock_code).await? {
            return Err(ErrorKind::TickStockNotExists);
        }
        let table = safe_ident(stock_code)?;
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(&format!(
            r#"SELECT DISTINCT "date" FROM "{SOURCE_SCHEMA}"."{table}" ORDER BY "date""#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(date,)| date).collect())
    }

    async fn load_day(&self, stock_code: &str, day: NaiveDate) -> FkResult<ResultFrame> {
        let table = safe_ident(stock_code)?;
        load_frame(
            &self.pool,
            SOURCE_SCHEMA,
            table,
            day,
            None,
            ErrorKind::TickDataNotExists,
        )
        .await
    }
}

impl MetaDb {
    /// Days of a stock with a closed tick-log bracket.
    pub async fn list_tick_updated_dates(&self, stock_code: &str) -> FkResult<Vec<NaiveDate>> {
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(&format!(
            r#"
            SELECT DISTINCT update_date FROM "{SCHEMA_META}"."{TABLE_TICK_UPDATE_LOG}"
            WHERE stock_code = $1 AND end_update_time IS NOT NULL
            ORDER BY update_date
            "#
        ))
        .bind(stock_code)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(date,)| date).collect())
    }

    /// Days a stock could be ingested for. A plain stock asks the import
    /// source; a view can cover the days every referenced stock has
    /// already ingested.
    pub async fn available_tick_dates(&self, stock_code: &str) -> FkResult<Vec<NaiveDate>> {
        if !is_stock_view(stock_code) {
            return self.tick_source().available_dates(stock_code).await;
        }

        let relation = self.get_stock_view_relation(stock_code).await?;
        let mut shared: Option<std::collections::BTreeSet<NaiveDate>> = None;
        for member in relation.keys() {
            let days: std::collections::BTreeSet<NaiveDate> = self
                .list_tick_updated_dates(member)
                .await?
                .into_iter()
                .collect();
            shared = Some(match shared {
                None => days,
                Some(current) => current.intersection(&days).copied().collect(),
            });
        }
        Ok(shared.unwrap_or_default().into_iter().collect())
    }

    /// True when every day the source offers has been ingested.
    pub async fn is_tick_data_current(&self, stock_code: &str) -> FkResult<bool> {
        let available = self.available_tick_dates(stock_code).await?;
        let updated = self.list_tick_updated_dates(stock_code).await?;
        let updated: std::collections::BTreeSet<NaiveDate> = updated.into_iter().collect();
        Ok(available.iter().all(|day| updated.contains(day)))
    }

    /// One ingested day of tick data, optionally narrowed to `columns`.
    /// View stocks read from the view schema.
    pub async fn load_tick_day(
        &self,
        stock_code: &str,
        day: NaiveDate,
        columns: Option<&[String]>,
    ) -> FkResult<ResultFrame> {
        let stock = safe_ident(stock_code)?;
        let (schema, table) = if is_stock_view(stock) {
            (SCHEMA_STOCK_VIEW_DATA, Self::view_table(stock))
        } else {
            (SCHEMA_TICK_DATA, Self::tick_table(stock))
        };
        load_frame(
            self.pool(),
            schema,
            &table,
            day,
            columns,
            ErrorKind::TickDataNotExists,
        )
        .await
    }

    /// Compose one view day column-wise from the ingested member stocks.
    pub async fn compose_view_day(
        &self,
        view_name: &str,
        relation: &BTreeMap<String, Vec<String>>,
        day: NaiveDate,
    ) -> FkResult<ResultFrame> {
        let _ = safe_ident(view_name)?;
        let mut composed: Option<ResultFrame> = None;

        for (stock, columns) in relation {
            let member = self.load_tick_day(stock, day, Some(columns)).await?;

            let mut renamed = BTreeMap::new();
            for column in columns {
                let values = member
                    .column(column)
                    .ok_or(ErrorKind::InvalidStockViewRelation)?
                    .to_vec();
                renamed.insert(view_column(column, stock), values);
            }
            let frame = ResultFrame::from_columns(
                member.datetime().to_vec(),
                member.date().to_vec(),
                renamed,
            )?;

            match composed.as_mut() {
                None => composed = Some(frame),
                Some(target) => target
                    .merge_columns(&frame)
                    .map_err(|_| ErrorKind::TickResultIncorrect)?,
            }
        }

        composed.ok_or(ErrorKind::InvalidStockViewRelation)
    }

    /// Updated vs. still-pending dates of one stock, for status listings.
    pub async fn stock_status(
        &self,
        stock_code: &str,
    ) -> FkResult<(Vec<NaiveDate>, Vec<NaiveDate>)> {
        let updated = self.list_tick_updated_dates(stock_code).await?;
        let available = self.available_tick_dates(stock_code).await?;

        let done: std::collections::BTreeSet<NaiveDate> = updated.iter().copied().collect();
        let pending = available
            .into_iter()
            .filter(|day| !done.contains(day))
            .collect();
        Ok((updated, pending))
    }
}

/// Read one day of a data table into a frame, every non-time column as
/// `f64`.
async fn load_frame(
    pool: &PgPool,
    schema: &str,
    table: &str,
    day: NaiveDate,
    columns: Option<&[String]>,
    empty_kind: ErrorKind,
) -> FkResult<ResultFrame> {
    let column_sql = match columns {
        None => "*".to_string(),
        Some(names) => {
            let mut parts = vec![r#""datetime""#.to_string(), r#""date""#.to_string()];
            for name in names {
                parts.push(format!(r#""{}""#, safe_ident(name)?));
            }
            parts.join(", ")
        }
    };

    let rows = sqlx::query(&format!(
        r#"
        SELECT {column_sql} FROM "{schema}"."{table}"
        WHERE "date" = $1 ORDER BY "datetime"
        "#
    ))
    .bind(day)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    if rows.is_empty() {
        return Err(empty_kind);
    }

    let mut datetime = Vec::with_capacity(rows.len());
    let mut date = Vec::with_capacity(rows.len());
    let mut values: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for row in &rows {
        datetime.push(row.try_get("datetime").map_err(db_err)?);
        date.push(row.try_get("date").map_err(db_err)?);
        for column in row.columns() {
            let name = sqlx::Column::name(column);
            if name == "datetime" || name == "date" || name == "id" {
                continue;
            }
            let value: Option<f64> = row.try_get(name).map_err(db_err)?;
            values
                .entry(name.to_string())
                .or_default()
                .push(value.unwrap_or(f64::NAN));
        }
    }

    ResultFrame::from_columns(datetime, date, values)
}
