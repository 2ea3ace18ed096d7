//! Factor / version / group / linkage creation. Multi-statement writes run
//! inside one transaction together with the reads that gate them.

use chrono::Local;
use factorkeeper_lib::config::{group_factor_name, INIT_VERSION};
use factorkeeper_lib::{ErrorKind, FkResult};
use sqlx::PgConnection;

use crate::{db_err, MetaDb, SCHEMA_META, TABLE_FACTOR_LIST, TABLE_GROUP_FACTOR, TABLE_LINKAGE};

impl MetaDb {
    /// Create a bare factor row.
    pub async fn create_factor(&self, factor: &str) -> FkResult<()> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        if factor_exists(&mut *tx, factor, true).await? {
            return Err(ErrorKind::FactorAlreadyExists);
        }
        insert_factor(&mut *tx, factor).await?;

        tx.commit().await.map_err(db_err)
    }

    /// `POST /factor`: create the factor and its initial version in one go.
    pub async fn register_factor(&self, factor: &str, code: &[u8]) -> FkResult<()> {
        match self.create_factor(factor).await {
            Ok(()) | Err(ErrorKind::FactorAlreadyExists) => {}
            Err(err) => return Err(err),
        }

        match self.create_version(factor, INIT_VERSION, code).await {
            Err(ErrorKind::FactorVersionAlreadyExists) => Err(ErrorKind::FactorAlreadyExists),
            other => other,
        }
    }

    /// Create the canonical group factor row for `members`.
    pub async fn create_group_factor(&self, members: &[String]) -> FkResult<String> {
        let group_name = group_factor_name(members);
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        for name in members.iter().chain(std::iter::once(&group_name)) {
            if factor_exists(&mut *tx, name, true).await? {
                return Err(ErrorKind::FactorAlreadyExists);
            }
        }
        insert_factor(&mut *tx, &group_name).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(group_name)
    }

    /// `POST /group_factor`: group row plus its initial version.
    pub async fn register_group_factor(
        &self,
        members: &[String],
        code: &[u8],
    ) -> FkResult<String> {
        if members.is_empty() {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        }

        let group_name = match self.create_group_factor(members).await {
            Ok(name) => name,
            Err(ErrorKind::FactorAlreadyExists) => group_factor_name(members),
            Err(err) => return Err(err),
        };

        match self
            .create_group_version(&group_name, members, INIT_VERSION, code)
            .await
        {
            Err(ErrorKind::FactorVersionAlreadyExists) | Err(ErrorKind::FactorNotExists) => {
                Err(ErrorKind::FactorAlreadyExists)
            }
            other => other.map(|_| group_name),
        }
    }

    /// New version of an existing atomic factor.
    pub async fn create_version(&self, factor: &str, version: &str, code: &[u8]) -> FkResult<()> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        if !factor_exists(&mut *tx, factor, true).await? {
            return Err(ErrorKind::FactorNotExists);
        }
        if version_exists(&mut *tx, factor, version).await? {
            return Err(ErrorKind::FactorVersionAlreadyExists);
        }
        insert_version(&mut *tx, factor, version, code).await?;

        tx.commit().await.map_err(db_err)
    }

    /// New version of a group factor, with the member set active for it.
    pub async fn create_group_version(
        &self,
        group_name: &str,
        members: &[String],
        version: &str,
        code: &[u8],
    ) -> FkResult<()> {
        if members.is_empty() {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        }

        let mut tx = self.pool().begin().await.map_err(db_err)?;

        if version_exists(&mut *tx, group_name, version).await? {
            return Err(ErrorKind::FactorVersionAlreadyExists);
        }

        // a new member name must not collide with a standalone factor
        let known = members_of(&mut *tx, group_name, None).await?;
        for member in members {
            if !known.contains(member) && factor_exists(&mut *tx, member, false).await? {
                return Err(ErrorKind::SubFactorConflictWithOtherFactor);
            }
        }

        for member in members {
            sqlx::query(&format!(
                r#"
                INSERT INTO "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"
                    (group_factor_name, sub_factor_name, version)
                VALUES ($1, $2, $3)
                "#
            ))
            .bind(group_name)
            .bind(member)
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        insert_version(&mut *tx, group_name, version, code).await?;

        tx.commit().await.map_err(db_err)
    }

    /// Resolve the version set for `members` to their common group and
    /// create a new version of it.
    pub async fn create_group_version_for_members(
        &self,
        members: &[String],
        version: &str,
        code: &[u8],
    ) -> FkResult<()> {
        if members.is_empty() {
            return Err(ErrorKind::ParameterMissingOrInvalid);
        }

        let mut group_name: Option<String> = None;
        for member in members {
            if let Some(owner) = self.get_group_for_member(member).await? {
                match &group_name {
                    None => group_name = Some(owner),
                    Some(current) if *current != owner => {
                        return Err(ErrorKind::GroupFactorSourceConflict)
                    }
                    Some(_) => {}
                }
            }
        }

        let group_name = group_name.ok_or(ErrorKind::GroupFactorNotExists)?;
        self.create_group_version(&group_name, members, version, code)
            .await
    }

    /// Bind a factor version to a stock. Member names resolve to their
    /// owning group before the linkage is touched.
    pub async fn create_linkage(&self, factor: &str, version: &str, stock_code: &str) -> FkResult<()> {
        let factor = self.resolve_group(factor).await?;

        if !self.tick_source().is_stock_available(stock_code).await? {
            return Err(ErrorKind::TickStockNotExists);
        }

        match self.get_linkage_id(&factor, version, stock_code).await {
            Ok(_) => return Err(ErrorKind::LinkageAlreadyExists),
            Err(ErrorKind::LinkageNotExists) => {}
            Err(err) => return Err(err),
        }

        let version_id = self.get_version_id(&factor, version).await?;
        let now = Local::now().naive_local();

        sqlx::query(&format!(
            r#"
            INSERT INTO "{SCHEMA_META}"."{TABLE_LINKAGE}"
                (version_id, stock_code, create_time, update_time)
            VALUES ($1, $2, $3, $4)
            "#
        ))
        .bind(version_id)
        .bind(stock_code)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

async fn insert_factor(conn: &mut PgConnection, factor: &str) -> FkResult<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO "{SCHEMA_META}"."{TABLE_FACTOR_LIST}" (factor, create_time)
        VALUES ($1, $2)
        "#
    ))
    .bind(factor)
    .bind(Local::now().naive_local())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_version(
    conn: &mut PgConnection,
    factor: &str,
    version: &str,
    code: &[u8],
) -> FkResult<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO "{SCHEMA_META}"."{}" (factor, version, code)
        VALUES ($1, $2, $3)
        "#,
        crate::TABLE_FACTOR_VERSION
    ))
    .bind(factor)
    .bind(version)
    .bind(code)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn factor_exists(
    conn: &mut PgConnection,
    factor: &str,
    check_group_membership: bool,
) -> FkResult<bool> {
    let (count,): (i64,) = sqlx::query_as(&format!(
        r#"SELECT COUNT(1) FROM "{SCHEMA_META}"."{TABLE_FACTOR_LIST}" WHERE factor = $1"#
    ))
    .bind(factor)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;

    if count > 0 {
        return Ok(true);
    }
    if !check_group_membership {
        return Ok(false);
    }

    let (members,): (i64,) = sqlx::query_as(&format!(
        r#"SELECT COUNT(1) FROM "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}" WHERE sub_factor_name = $1"#
    ))
    .bind(factor)
    .fetch_one(conn)
    .await
    .map_err(db_err)?;
    Ok(members > 0)
}

pub(crate) async fn version_exists(
    conn: &mut PgConnection,
    factor: &str,
    version: &str,
) -> FkResult<bool> {
    let (count,): (i64,) = sqlx::query_as(&format!(
        r#"
        SELECT COUNT(1) FROM "{SCHEMA_META}"."{}"
        WHERE factor = $1 AND version = $2
        "#,
        crate::TABLE_FACTOR_VERSION
    ))
    .bind(factor)
    .bind(version)
    .fetch_one(conn)
    .await
    .map_err(db_err)?;
    Ok(count > 0)
}

pub(crate) async fn members_of(
    conn: &mut PgConnection,
    group_name: &str,
    version: Option<&str>,
) -> FkResult<Vec<String>> {
    let rows: Vec<(String,)> = match version {
        Some(version) => {
            sqlx::query_as(&format!(
                r#"
                SELECT DISTINCT sub_factor_name FROM "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"
                WHERE group_factor_name = $1 AND version = $2
                "#
            ))
            .bind(group_name)
            .bind(version)
            .fetch_all(conn)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                r#"
                SELECT DISTINCT sub_factor_name FROM "{SCHEMA_META}"."{TABLE_GROUP_FACTOR}"
                WHERE group_factor_name = $1
                "#
            ))
            .bind(group_name)
            .fetch_all(conn)
            .await
        }
    }
    .map_err(db_err)?;

    Ok(rows.into_iter().map(|(name,)| name).collect())
}
