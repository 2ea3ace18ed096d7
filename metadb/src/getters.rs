//! Read side of the gateway: listings, group resolution, linkage lookup
//! and factor result loads.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use factorkeeper_lib::{ErrorKind, FkResult, ResultFrame};

use crate::meta::{factor_exists, members_of};
use crate::{
    db_err, safe_ident, MetaDb, SCHEMA_FACTOR_DATA, SCHEMA_META, TABLE_FACTOR_LIST,
    TABLE_FACTOR_UPDATE_LOG, TABLE_FACTOR_VERSION, TABLE_GROUP_FACTOR, TABLE_LINKAGE,
};

impl MetaDb {
    pub async fn list_factors(&self) -> FkResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            r#"SELECT factor FROM "{SCHEMA_META}"."{TABLE_FACTOR_LIST}" ORDER BY factor"#
        ))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(factor,)| factor).collect())
    }

    /// Versions of a factor. A member name lists the versions of the
    /// group it belongs to.
    pub async fn list_versions(&self, factor: &str) -> FkResult<Vec<String>> {
        let rows: Vec<(String,)> = match self.get_group_for_member(factor).await? {
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT version FROM "{SCHEMA_META}"."{TABLE_FACTOR_VERSION}"
                    WHERE factor = $1 ORDER BY version_id
                    "#
                ))
                .bind(factor)
                .fetch_all(self.pool())
                .await
            }
            Some(group) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT DISTINCT version FROM "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"
                    WHERE group_factor_name = $1 AND sub_factor_name = $2
                    "#
                ))
                .bind(group)
                .bind(factor)
                .fetch_all(self.pool())
                .await
            }
        }
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(version,)| version).collect())
    }

    pub async fn get_latest_version(&self, factor: &str) -> FkResult<String> {
        let row: Option<(String,)> = match self.get_group_for_member(factor).await? {
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT version FROM "{SCHEMA_META}"."{TABLE_FACTOR_VERSION}"
                    WHERE factor = $1 ORDER BY version_id DESC LIMIT 1
                    "#
                ))
                .bind(factor)
                .fetch_optional(self.pool())
                .await
            }
            Some(group) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT version FROM "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"
                    WHERE group_factor_name = $1 AND sub_factor_name = $2
                    ORDER BY id DESC LIMIT 1
                    "#
                ))
                .bind(group)
                .bind(factor)
                .fetch_optional(self.pool())
                .await
            }
        }
        .map_err(db_err)?;

        row.map(|(version,)| version)
            .ok_or(ErrorKind::FactorNotExists)
    }

    /// The group a member belongs to, `None` for atomic factors.
    pub async fn get_group_for_member(&self, member: &str) -> FkResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT group_factor_name FROM "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"
            WHERE sub_factor_name = $1 LIMIT 1
            "#
        ))
        .bind(member)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        Ok(row.map(|(group,)| group))
    }

    /// Member name to its owning group, anything else to itself.
    pub async fn resolve_group(&self, factor: &str) -> FkResult<String> {
        Ok(self
            .get_group_for_member(factor)
            .await?
            .unwrap_or_else(|| factor.to_string()))
    }

    pub async fn get_members(&self, group_name: &str, version: Option<&str>) -> FkResult<Vec<String>> {
        let mut conn = self.pool().acquire().await.map_err(db_err)?;
        members_of(&mut conn, group_name, version).await
    }

    pub async fn is_group_factor(&self, name: &str) -> FkResult<bool> {
        Ok(!self.get_members(name, None).await?.is_empty())
    }

    pub async fn get_version_id(&self, factor: &str, version: &str) -> FkResult<i32> {
        let row: Option<(i32,)> = sqlx::query_as(&format!(
            r#"
            SELECT version_id FROM "{SCHEMA_META}"."{TABLE_FACTOR_VERSION}"
            WHERE factor = $1 AND version = $2
            "#
        ))
        .bind(factor)
        .bind(version)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        match row {
            Some((version_id,)) => Ok(version_id),
            None => {
                let mut conn = self.pool().acquire().await.map_err(db_err)?;
                if factor_exists(&mut conn, factor, true).await? {
                    Err(ErrorKind::FactorVersionNotExists)
                } else {
                    Err(ErrorKind::FactorNotExists)
                }
            }
        }
    }

    /// Linkage id of `(factor, version, stock)`; member names resolve to
    /// their group first.
    pub async fn get_linkage_id(&self, factor: &str, version: &str, stock_code: &str) -> FkResult<i32> {
        let factor = self.resolve_group(factor).await?;
        let version_id = self.get_version_id(&factor, version).await?;

        let row: Option<(i32,)> = sqlx::query_as(&format!(
            r#"
            SELECT linkage_id FROM "{SCHEMA_META}"."{TABLE_LINKAGE}"
            WHERE version_id = $1 AND stock_code = $2
            "#
        ))
        .bind(version_id)
        .bind(stock_code)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.map(|(linkage_id,)| linkage_id)
            .ok_or(ErrorKind::LinkageNotExists)
    }

    pub async fn list_linked_stocks(&self, factor: &str, version: &str) -> FkResult<Vec<String>> {
        let factor = self.resolve_group(factor).await?;
        let version_id = self.get_version_id(&factor, version).await?;

        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT stock_code FROM "{SCHEMA_META}"."{TABLE_LINKAGE}"
            WHERE version_id = $1 ORDER BY stock_code
            "#
        ))
        .bind(version_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(stock,)| stock).collect())
    }

    /// Days with a closed update-log bracket: the set readers may trust.
    pub async fn list_updated_dates(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
    ) -> FkResult<Vec<NaiveDate>> {
        let linkage_id = self.get_linkage_id(factor, version, stock_code).await?;

        let rows: Vec<(NaiveDate,)> = sqlx::query_as(&format!(
            r#"
            SELECT DISTINCT factor_date FROM "{SCHEMA_META}"."{TABLE_FACTOR_UPDATE_LOG}"
            WHERE linkage_id = $1 AND end_update_time IS NOT NULL
            ORDER BY factor_date
            "#
        ))
        .bind(linkage_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(date,)| date).collect())
    }

    /// Archived generator code of a version. Member names resolve to their
    /// group, whose version rows own the code.
    pub async fn get_version_code(&self, factor: &str, version: &str) -> FkResult<Vec<u8>> {
        let factor = self.resolve_group(factor).await?;

        let row: Option<(Vec<u8>,)> = sqlx::query_as(&format!(
            r#"
            SELECT code FROM "{SCHEMA_META}"."{TABLE_FACTOR_VERSION}"
            WHERE factor = $1 AND version = $2
            "#
        ))
        .bind(&factor)
        .bind(version)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.map(|(code,)| code)
            .ok_or(ErrorKind::FactorVersionNotExists)
    }

    /// One day of one factor. The owning group locates the result table;
    /// the caller's own name picks the column.
    pub async fn load_factor_result(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        day: NaiveDate,
    ) -> FkResult<ResultFrame> {
        self.load_result_range(factor, version, stock_code, day, day)
            .await
    }

    pub async fn load_factor_result_by_range(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FkResult<ResultFrame> {
        self.load_result_range(factor, version, stock_code, start, end)
            .await
    }

    async fn load_result_range(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FkResult<ResultFrame> {
        let column = safe_ident(factor)?;
        let linkage_id = self.get_linkage_id(factor, version, stock_code).await?;
        let table = Self::result_table(linkage_id);

        let rows: Vec<(chrono::NaiveDateTime, NaiveDate, Option<f64>)> =
            sqlx::query_as(&format!(
                r#"
                SELECT "datetime", "date", "{column}"
                FROM "{SCHEMA_FACTOR_DATA}"."{table}"
                WHERE "date" >= $1 AND "date" <= $2
                ORDER BY "datetime"
                "#
            ))
            .bind(start)
            .bind(end)
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;

        if rows.is_empty() {
            return Err(ErrorKind::FactorResultNotExists);
        }

        let mut datetime = Vec::with_capacity(rows.len());
        let mut date = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for (ts, day, value) in rows {
            datetime.push(ts);
            date.push(day);
            values.push(value.unwrap_or(f64::NAN));
        }

        ResultFrame::from_single_column(factor, values, datetime, date)
    }

    /// Joined frame of several factors on one day.
    pub async fn load_multi_factors(
        &self,
        factors: &[(String, Option<String>)],
        stock_code: &str,
        day: NaiveDate,
    ) -> FkResult<ResultFrame> {
        self.load_multi_factors_by_range(factors, stock_code, day, day)
            .await
    }

    /// Joined frame of several factors over a date range. Rows are kept
    /// for the dates every factor has updated.
    pub async fn load_multi_factors_by_range(
        &self,
        factors: &[(String, Option<String>)],
        stock_code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FkResult<ResultFrame> {
        if factors.is_empty() {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        }

        let mut frames = Vec::with_capacity(factors.len());
        for (factor, version) in factors {
            let version = match version {
                Some(version) => version.clone(),
                None => self.get_latest_version(factor).await?,
            };
            let frame = self
                .load_factor_result_by_range(factor, &version, stock_code, start, end)
                .await?;
            frames.push(frame);
        }

        // align on the dates all factors share
        let mut shared: BTreeSet<NaiveDate> =
            frames[0].date().iter().copied().collect();
        for frame in &frames[1..] {
            let dates: BTreeSet<NaiveDate> = frame.date().iter().copied().collect();
            shared = shared.intersection(&dates).copied().collect();
        }
        if shared.is_empty() {
            return Err(ErrorKind::FactorResultNotExists);
        }

        let mut merged: Option<ResultFrame> = None;
        for frame in &frames {
            let filtered = filter_frame_by_dates(frame, &shared)?;
            match merged.as_mut() {
                None => merged = Some(filtered),
                Some(target) => target.merge_columns(&filtered)?,
            }
        }
        Ok(merged.expect("at least one factor frame"))
    }
}

fn filter_frame_by_dates(frame: &ResultFrame, keep: &BTreeSet<NaiveDate>) -> FkResult<ResultFrame> {
    let mask: Vec<bool> = frame.date().iter().map(|day| keep.contains(day)).collect();

    let datetime = frame
        .datetime()
        .iter()
        .zip(&mask)
        .filter_map(|(ts, keep)| keep.then_some(*ts))
        .collect();
    let date = frame
        .date()
        .iter()
        .zip(&mask)
        .filter_map(|(day, keep)| keep.then_some(*day))
        .collect();

    let mut columns = std::collections::BTreeMap::new();
    for name in frame.factor_columns() {
        let values = frame
            .column(name)
            .expect("listed column present")
            .iter()
            .zip(&mask)
            .filter_map(|(value, keep)| keep.then_some(*value))
            .collect();
        columns.insert(name.to_string(), values);
    }

    ResultFrame::from_columns(datetime, date, columns)
}
