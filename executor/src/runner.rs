//! The unit-task body: load one day of tick data, run the generator in
//! its own OS process, coerce the result to a frame and call the
//! coordinator back.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use factorkeeper_lib::config::{is_stock_view, TICK_LENGTH};
use factorkeeper_lib::proto::DATE_FORMAT;
use factorkeeper_lib::{ErrorKind, FkResult, ResultFrame};
use factorkeeper_metadb::MetaDb;
use factorkeeper_pool::{UnitContext, UnitOutcome, UnitRunner, UnitSpec, UnitTask};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::code_cache::CodeCache;
use crate::sender::CoordinatorClient;

/// Days with fewer ticks than this are halted sessions; they are skipped
/// rather than failed.
const MIN_DAY_TICKS: usize = 1000;

pub struct ExecutorRunner {
    database_url: String,
    code_cache: CodeCache,
    client: Arc<CoordinatorClient>,
}

impl ExecutorRunner {
    pub fn new(database_url: String, code_cache: CodeCache, client: Arc<CoordinatorClient>) -> Self {
        Self {
            database_url,
            code_cache,
            client,
        }
    }

    async fn factor_day(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        day: NaiveDate,
        ctx: &UnitContext,
    ) -> FkResult<()> {
        ctx.logger.info("factor update unit starting...").await;

        // units share nothing; each opens its own store handle
        let store = MetaDb::connect_single(&self.database_url).await?;

        let day_frame = store.load_tick_day(stock_code, day, None).await?;
        if day_frame.row_count() < MIN_DAY_TICKS {
            ctx.logger
                .info(format!("too few ticks ({}), day skipped", day_frame.row_count()))
                .await;
            return Ok(());
        }

        let signature = if store.is_group_factor(factor).await? {
            store.get_members(factor, Some(version)).await?
        } else {
            vec![factor.to_string()]
        };

        let generator = self.code_cache.ensure(&store, factor, version).await?;
        let stdout = run_generator(&generator, stock_code, day, &day_frame).await?;
        let frame = coerce_generator_output(&stdout, &signature, &day_frame)?;

        self.client
            .send_factor_frame(factor, version, stock_code, day, &frame, &ctx.group_id)
            .await
            .map_err(|err| match err {
                ErrorKind::TaskNotExists => ErrorKind::TaskNotExists,
                ErrorKind::HttpConnectionFailed => ErrorKind::FailedToCallbackMaster,
                other => other,
            })?;

        ctx.logger.info("factor day committed").await;
        Ok(())
    }

    async fn tick_day(&self, stock_code: &str, day: NaiveDate, ctx: &UnitContext) -> FkResult<()> {
        ctx.logger.info("tick update unit starting...").await;

        let store = MetaDb::connect_single(&self.database_url).await?;

        let frame = if is_stock_view(stock_code) {
            let relation = store.get_stock_view_relation(stock_code).await?;
            store.compose_view_day(stock_code, &relation, day).await?
        } else {
            store.tick_source().load_day(stock_code, day).await?
        };
        frame.validate_row_count(TICK_LENGTH, ErrorKind::TickResultIncorrect)?;

        self.client
            .send_tick_frame(stock_code, day, &frame, &ctx.group_id)
            .await
            .map_err(|err| match err {
                ErrorKind::TaskNotExists => ErrorKind::TaskNotExists,
                ErrorKind::HttpConnectionFailed => ErrorKind::FailedToCallbackMaster,
                other => other,
            })?;

        ctx.logger.info("tick day committed").await;
        Ok(())
    }
}

#[async_trait]
impl UnitRunner for ExecutorRunner {
    async fn run(&self, unit: UnitTask, ctx: UnitContext) -> UnitOutcome {
        let result = match &unit.spec {
            UnitSpec::FactorDay {
                factor,
                version,
                stock_code,
                day,
            } => {
                self.factor_day(factor, version, stock_code, *day, &ctx)
                    .await
            }
            UnitSpec::TickDay { stock_code, day } => self.tick_day(stock_code, *day, &ctx).await,
        };

        match result {
            Ok(()) => UnitOutcome::Finished,
            // the coordinator no longer knows our group
            Err(ErrorKind::TaskNotExists) => UnitOutcome::StaleGroup,
            Err(err) => {
                ctx.logger.error(format!("unit failed: {err}")).await;
                UnitOutcome::Aborted(err)
            }
        }
    }
}

/// Run the generator executable: one day of tick data on stdin, the
/// stock and date as arguments, the factor values on stdout. The child
/// dies with this future, which is what ties it to pool cancellation.
async fn run_generator(
    path: &Path,
    stock_code: &str,
    day: NaiveDate,
    input: &ResultFrame,
) -> FkResult<String> {
    let mut child = Command::new(path)
        .arg(stock_code)
        .arg(day.format(DATE_FORMAT).to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|_| ErrorKind::FailedToLoadFactorGeneratorModule)?;

    let payload = input.to_json()?;
    let mut stdin = child.stdin.take().ok_or(ErrorKind::ServerInternalError)?;
    stdin
        .write_all(payload.as_bytes())
        .await
        .map_err(|_| ErrorKind::FactorGenerateFailed)?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|_| ErrorKind::FactorGenerateFailed)?;
    if !output.status.success() {
        return Err(ErrorKind::FactorGenerateFailed);
    }
    String::from_utf8(output.stdout).map_err(|_| ErrorKind::InvalidFactorResult)
}

/// Accept either a bare array of values (atomic factor) or a column map
/// covering the signature (group factor), aligned to the tick day's time
/// axis.
fn coerce_generator_output(
    stdout: &str,
    signature: &[String],
    day_frame: &ResultFrame,
) -> FkResult<ResultFrame> {
    let value: serde_json::Value =
        serde_json::from_str(stdout.trim()).map_err(|_| ErrorKind::InvalidFactorResult)?;

    match value {
        serde_json::Value::Array(items) => {
            if signature.len() != 1 {
                return Err(ErrorKind::GroupFactorSignatureNotMatched);
            }
            let values = numbers(&items, day_frame.row_count())?;
            ResultFrame::from_single_column(
                &signature[0],
                values,
                day_frame.datetime().to_vec(),
                day_frame.date().to_vec(),
            )
        }
        serde_json::Value::Object(map) => {
            let mut columns = BTreeMap::new();
            for name in signature {
                let column = map
                    .get(name)
                    .ok_or(ErrorKind::GroupFactorSignatureNotMatched)?;
                let serde_json::Value::Array(items) = column else {
                    return Err(ErrorKind::InvalidFactorResult);
                };
                columns.insert(name.clone(), numbers(items, day_frame.row_count())?);
            }
            ResultFrame::from_columns(
                day_frame.datetime().to_vec(),
                day_frame.date().to_vec(),
                columns,
            )
        }
        _ => Err(ErrorKind::InvalidFactorResult),
    }
}

fn numbers(items: &[serde_json::Value], expected: usize) -> FkResult<Vec<f64>> {
    if items.len() != expected {
        return Err(ErrorKind::InvalidFactorResult);
    }
    items
        .iter()
        .map(|item| match item {
            serde_json::Value::Number(n) => {
                n.as_f64().ok_or(ErrorKind::InvalidFactorResult)
            }
            serde_json::Value::Null => Ok(f64::NAN),
            _ => Err(ErrorKind::InvalidFactorResult),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn day_frame(rows: usize) -> ResultFrame {
        let day = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        let start = day.and_time(NaiveTime::from_hms_opt(9, 30, 3).unwrap());
        let datetime = (0..rows)
            .map(|i| start + chrono::Duration::seconds(3 * i as i64))
            .collect();
        let date = vec![day; rows];
        let mut columns = BTreeMap::new();
        columns.insert("last".to_string(), vec![10.0; rows]);
        ResultFrame::from_columns(datetime, date, columns).unwrap()
    }

    #[test]
    fn test_bare_array_becomes_single_column() {
        let ticks = day_frame(3);
        let frame =
            coerce_generator_output("[1.0, 2.0, 3.0]", &["alpha".to_string()], &ticks).unwrap();
        assert_eq!(frame.factor_columns(), vec!["alpha"]);
        assert_eq!(frame.column("alpha").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(frame.datetime(), ticks.datetime());
    }

    #[test]
    fn test_bare_array_rejected_for_groups() {
        let ticks = day_frame(2);
        let signature = vec!["f1".to_string(), "f2".to_string()];
        assert_eq!(
            coerce_generator_output("[1.0, 2.0]", &signature, &ticks),
            Err(ErrorKind::GroupFactorSignatureNotMatched)
        );
    }

    #[test]
    fn test_column_map_covers_signature() {
        let ticks = day_frame(2);
        let signature = vec!["f1".to_string(), "f2".to_string()];
        let frame = coerce_generator_output(
            r#"{"f1": [1.0, 2.0], "f2": [3.0, 4.0], "extra": [0, 0]}"#,
            &signature,
            &ticks,
        )
        .unwrap();
        // extra columns are dropped, the signature is kept
        assert_eq!(frame.factor_columns(), vec!["f1", "f2"]);
    }

    #[test]
    fn test_column_map_missing_member_rejected() {
        let ticks = day_frame(2);
        let signature = vec!["f1".to_string(), "f2".to_string()];
        assert_eq!(
            coerce_generator_output(r#"{"f1": [1.0, 2.0]}"#, &signature, &ticks),
            Err(ErrorKind::GroupFactorSignatureNotMatched)
        );
    }

    #[test]
    fn test_wrong_length_rejected() {
        let ticks = day_frame(3);
        assert_eq!(
            coerce_generator_output("[1.0]", &["alpha".to_string()], &ticks),
            Err(ErrorKind::InvalidFactorResult)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        let ticks = day_frame(1);
        assert_eq!(
            coerce_generator_output("not json", &["alpha".to_string()], &ticks),
            Err(ErrorKind::InvalidFactorResult)
        );
        assert_eq!(
            coerce_generator_output("42", &["alpha".to_string()], &ticks),
            Err(ErrorKind::InvalidFactorResult)
        );
    }

    #[test]
    fn test_null_values_become_nan() {
        let ticks = day_frame(2);
        let frame =
            coerce_generator_output("[1.0, null]", &["alpha".to_string()], &ticks).unwrap();
        assert!(frame.column("alpha").unwrap()[1].is_nan());
    }
}
