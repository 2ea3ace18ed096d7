//! Stock views: synthetic stocks composed column-wise from real ones.

use std::collections::BTreeMap;

use factorkeeper_lib::config::{is_stock_view, is_valid_stock_view_name};
use factorkeeper_lib::{ErrorKind, FkResult};

use crate::{db_err, MetaDb, SCHEMA_META, TABLE_STOCK_VIEW_LIST};

impl MetaDb {
    /// Register a view. The relation maps each referenced stock to the
    /// columns taken from it; views cannot reference other views.
    pub async fn create_stock_view(
        &self,
        view_name: &str,
        relation: &BTreeMap<String, Vec<String>>,
    ) -> FkResult<()> {
        if !is_valid_stock_view_name(view_name) {
            return Err(ErrorKind::InvalidStockViewName);
        }
        if relation.is_empty() {
            return Err(ErrorKind::InvalidStockViewRelation);
        }
        for (stock, columns) in relation {
            if is_stock_view(stock) || columns.is_empty() {
                return Err(ErrorKind::InvalidStockViewRelation);
            }
            if !self.tick_source().is_stock_available(stock).await? {
                return Err(ErrorKind::TickStockNotExists);
            }
        }
        if self.is_stock_view_exists(view_name).await? {
            return Err(ErrorKind::InvalidStockViewName);
        }

        let relation_json =
            serde_json::to_string(relation).map_err(|_| ErrorKind::ServerInternalError)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO "{SCHEMA_META}"."{TABLE_STOCK_VIEW_LIST}"
                (stock_view_name, stock_view_relation)
            VALUES ($1, $2)
            "#
        ))
        .bind(view_name)
        .bind(relation_json)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn is_stock_view_exists(&self, view_name: &str) -> FkResult<bool> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(1) FROM "{SCHEMA_META}"."{TABLE_STOCK_VIEW_LIST}"
            WHERE stock_view_name = $1
            "#
        ))
        .bind(view_name)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(count > 0)
    }

    pub async fn get_stock_view_relation(
        &self,
        view_name: &str,
    ) -> FkResult<BTreeMap<String, Vec<String>>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            r#"
            SELECT stock_view_relation FROM "{SCHEMA_META}"."{TABLE_STOCK_VIEW_LIST}"
            WHERE stock_view_name = $1
            "#
        ))
        .bind(view_name)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        let (raw,) = row.ok_or(ErrorKind::TickStockViewNotExists)?;
        serde_json::from_str(&raw).map_err(|_| ErrorKind::InvalidStockViewRelation)
    }
}
