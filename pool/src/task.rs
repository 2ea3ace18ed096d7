use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

/// The two unit-task families an executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    UpdateFactor,
    UpdateTick,
}

impl UnitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::UpdateFactor => "UPDATE_FACTOR",
            UnitKind::UpdateTick => "UPDATE_TICK_DATA",
        }
    }
}

/// What a single unit computes: one day of one factor linkage, or one day
/// of tick data for one stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSpec {
    FactorDay {
        factor: String,
        version: String,
        stock_code: String,
        day: NaiveDate,
    },
    TickDay {
        stock_code: String,
        day: NaiveDate,
    },
}

/// The smallest schedulable item.
#[derive(Debug, Clone)]
pub struct UnitTask {
    kind: UnitKind,
    sub_id: String,
    pub spec: UnitSpec,
}

impl UnitTask {
    pub fn new(kind: UnitKind, sub_id: impl Into<String>, spec: UnitSpec) -> Self {
        Self {
            kind,
            sub_id: sub_id.into(),
            spec,
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn task_id(&self) -> String {
        make_task_id(self.kind, &self.sub_id)
    }
}

pub fn make_task_id(kind: UnitKind, sub_id: &str) -> String {
    format!("{}_{}", kind.as_str(), sub_id.replace(' ', "_"))
}

/// Completion counters reported to the coordinator when a group retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatus {
    pub total: usize,
    pub finished: usize,
    pub aborted: usize,
}

/// All units derived from one logical task. `group_id` equals the
/// coordinator's task id.
#[derive(Debug)]
pub struct TaskGroup {
    pub group_id: String,
    pub kind: UnitKind,
    running: HashMap<String, UnitTask>,
    finished: HashSet<String>,
    aborted: HashSet<String>,
    task_num: usize,
}

impl TaskGroup {
    pub fn new(kind: UnitKind, group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            kind,
            running: HashMap::new(),
            finished: HashSet::new(),
            aborted: HashSet::new(),
            task_num: 0,
        }
    }

    pub fn add_task(&mut self, task: UnitTask) {
        self.running.insert(task.task_id(), task);
        self.task_num += 1;
    }

    /// Mark one unit finished or aborted. Unknown ids are stale echoes of
    /// a previous pool generation and are ignored.
    pub fn complete(&mut self, task_id: &str, aborted: bool) {
        if self.running.remove(task_id).is_none() {
            return;
        }
        if aborted {
            self.aborted.insert(task_id.to_string());
        } else {
            self.finished.insert(task_id.to_string());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.running.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.task_num == 0
    }

    pub fn running_tasks(&self) -> impl Iterator<Item = &UnitTask> {
        self.running.values()
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            total: self.task_num,
            finished: self.finished.len(),
            aborted: self.aborted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(sub_id: &str) -> UnitTask {
        UnitTask::new(
            UnitKind::UpdateTick,
            sub_id,
            UnitSpec::TickDay {
                stock_code: "000001.SZ".into(),
                day: NaiveDate::from_ymd_opt(2024, 3, 11).unwrap(),
            },
        )
    }

    #[test]
    fn test_task_id_has_no_spaces() {
        let task = unit("000001.SZ 2024-03-11");
        assert_eq!(task.task_id(), "UPDATE_TICK_DATA_000001.SZ_2024-03-11");
    }

    #[test]
    fn test_group_accounting() {
        let mut group = TaskGroup::new(UnitKind::UpdateTick, "g1");
        assert!(group.is_empty());

        let a = unit("a");
        let b = unit("b");
        group.add_task(a.clone());
        group.add_task(b.clone());
        assert!(!group.is_finished());

        group.complete(&a.task_id(), false);
        group.complete(&b.task_id(), true);
        assert!(group.is_finished());
        assert_eq!(
            group.status(),
            GroupStatus {
                total: 2,
                finished: 1,
                aborted: 1
            }
        );
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut group = TaskGroup::new(UnitKind::UpdateTick, "g1");
        group.add_task(unit("a"));
        group.complete("UPDATE_TICK_DATA_ghost", true);
        assert_eq!(group.status().aborted, 0);
        assert!(!group.is_finished());
    }
}
