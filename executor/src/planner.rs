//! Expand a logical task into the set of per-day unit tasks.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_metadb::MetaDb;
use factorkeeper_pool::{TaskGroup, UnitKind, UnitSpec, UnitTask, WorkerPool};
use tracing::info;

use crate::code_cache::CodeCache;

pub struct UpdatePlanner {
    store: MetaDb,
    pool: WorkerPool,
    code_cache: CodeCache,
}

impl UpdatePlanner {
    pub fn new(store: MetaDb, pool: WorkerPool, code_cache: CodeCache) -> Self {
        Self {
            store,
            pool,
            code_cache,
        }
    }

    /// Plan one factor update: every ingested tick day the linkage has
    /// not produced yet becomes a unit task.
    pub async fn update_factor(
        &self,
        factor: &str,
        version: &str,
        stock_code: &str,
        task_id: &str,
    ) -> FkResult<usize> {
        // fetch and unpack the generator before any unit needs it
        self.code_cache.ensure(&self.store, factor, version).await?;

        let updated = self
            .store
            .list_updated_dates(factor, version, stock_code)
            .await?;
        let tick_days = self.store.list_tick_updated_dates(stock_code).await?;

        let todo = date_diff(&tick_days, &updated);
        if todo.is_empty() {
            return Err(ErrorKind::TaskHasNothingToBeDone);
        }

        let mut group = TaskGroup::new(UnitKind::UpdateFactor, task_id);
        for day in &todo {
            group.add_task(UnitTask::new(
                UnitKind::UpdateFactor,
                format!("{factor}_{version}_{stock_code}_{day}"),
                UnitSpec::FactorDay {
                    factor: factor.to_string(),
                    version: version.to_string(),
                    stock_code: stock_code.to_string(),
                    day: *day,
                },
            ));
        }

        info!(factor, version, stock_code, days = todo.len(), "factor update planned");
        self.pool.apply_task_group(group).await?;
        Ok(todo.len())
    }

    /// Plan one tick update: every day the source offers that has not
    /// been ingested becomes a unit task. For a view, "the source" is
    /// the set of days every referenced stock has ingested.
    pub async fn update_tick(&self, stock_code: &str, task_id: &str) -> FkResult<usize> {
        let available = self.store.available_tick_dates(stock_code).await?;
        if available.is_empty() {
            return Err(ErrorKind::TickDataNotAvailable);
        }

        let updated = self.store.list_tick_updated_dates(stock_code).await?;
        let todo = date_diff(&available, &updated);
        if todo.is_empty() {
            return Err(ErrorKind::TaskHasNothingToBeDone);
        }

        let mut group = TaskGroup::new(UnitKind::UpdateTick, task_id);
        for day in &todo {
            group.add_task(UnitTask::new(
                UnitKind::UpdateTick,
                format!("{stock_code}:{day}"),
                UnitSpec::TickDay {
                    stock_code: stock_code.to_string(),
                    day: *day,
                },
            ));
        }

        info!(stock_code, days = todo.len(), "tick update planned");
        self.pool.apply_task_group(group).await?;
        Ok(todo.len())
    }
}

/// Sorted `have − done`.
fn date_diff(have: &[NaiveDate], done: &[NaiveDate]) -> Vec<NaiveDate> {
    let done: BTreeSet<NaiveDate> = done.iter().copied().collect();
    let todo: BTreeSet<NaiveDate> = have
        .iter()
        .filter(|day| !done.contains(day))
        .copied()
        .collect();
    todo.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_date_diff_sorted_and_deduped() {
        let have = vec![day(14), day(11), day(12), day(11)];
        let done = vec![day(12)];
        assert_eq!(date_diff(&have, &done), vec![day(11), day(14)]);
    }

    #[test]
    fn test_date_diff_empty_when_caught_up() {
        let have = vec![day(11), day(12)];
        assert!(date_diff(&have, &have).is_empty());
        assert!(date_diff(&[], &[]).is_empty());
    }
}
