//! Explicit periodic-task scheduler for the tick loop.
//!
//! Each task keeps its own next-fire tick. When several tasks fall due on
//! the same tick they are returned in [`TaskKind`] order, so queue estimation
//! always publishes before the controllers read it.

use serde::{Deserialize, Serialize};

/// Periodic work driven by the discrete clock. Declaration order is
/// execution order within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    QueueEstimation,
    ControlUpdate,
}

/// A task that fires every `interval_ticks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub kind: TaskKind,
    pub interval_ticks: u64,
    pub next_fire: u64,
}

impl PeriodicTask {
    /// First firing is one full interval after tick zero.
    pub fn new(kind: TaskKind, interval_ticks: u64) -> Self {
        let interval_ticks = interval_ticks.max(1);
        Self {
            kind,
            interval_ticks,
            next_fire: interval_ticks,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    pub fn new(tasks: impl IntoIterator<Item = PeriodicTask>) -> Self {
        let mut tasks: Vec<_> = tasks.into_iter().collect();
        tasks.sort_by_key(|t| t.kind);
        Self { tasks }
    }

    pub fn tasks(&self) -> &[PeriodicTask] {
        &self.tasks
    }

    /// Tasks due at `tick`, in execution order. Each returned task is
    /// rescheduled; a task that fell behind fires once and skips ahead.
    pub fn due(&mut self, tick: u64) -> Vec<TaskKind> {
        let mut due = Vec::new();
        for task in &mut self.tasks {
            if tick >= task.next_fire {
                due.push(task.kind);
                let missed = (tick - task.next_fire) / task.interval_ticks;
                task.next_fire += (missed + 1) * task.interval_ticks;
            }
        }
        due
    }

    /// Tick at which `kind` fires next, if scheduled.
    pub fn next_fire(&self, kind: TaskKind) -> Option<u64> {
        self.tasks
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.next_fire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire_log(scheduler: &mut Scheduler, ticks: u64) -> Vec<(u64, TaskKind)> {
        (1..=ticks)
            .flat_map(|tick| {
                scheduler
                    .due(tick)
                    .into_iter()
                    .map(move |kind| (tick, kind))
            })
            .collect()
    }

    #[test]
    fn test_estimation_runs_before_control_on_shared_tick() {
        // Registered in the "wrong" order on purpose
        let mut scheduler = Scheduler::new([
            PeriodicTask::new(TaskKind::ControlUpdate, 30),
            PeriodicTask::new(TaskKind::QueueEstimation, 30),
        ]);
        assert!(scheduler.due(29).is_empty());
        assert_eq!(
            scheduler.due(30),
            vec![TaskKind::QueueEstimation, TaskKind::ControlUpdate]
        );
        assert_eq!(scheduler.next_fire(TaskKind::ControlUpdate), Some(60));
    }

    #[test]
    fn test_independent_cadences() {
        let mut scheduler = Scheduler::new([
            PeriodicTask::new(TaskKind::QueueEstimation, 10),
            PeriodicTask::new(TaskKind::ControlUpdate, 30),
        ]);
        let log = fire_log(&mut scheduler, 60);
        assert_eq!(
            log,
            vec![
                (10, TaskKind::QueueEstimation),
                (20, TaskKind::QueueEstimation),
                (30, TaskKind::QueueEstimation),
                (30, TaskKind::ControlUpdate),
                (40, TaskKind::QueueEstimation),
                (50, TaskKind::QueueEstimation),
                (60, TaskKind::QueueEstimation),
                (60, TaskKind::ControlUpdate),
            ]
        );
    }

    #[test]
    fn test_late_poll_fires_once_and_realigns() {
        let mut scheduler = Scheduler::new([PeriodicTask::new(TaskKind::ControlUpdate, 30)]);
        assert_eq!(scheduler.due(95), vec![TaskKind::ControlUpdate]);
        assert_eq!(scheduler.next_fire(TaskKind::ControlUpdate), Some(120));
    }

    #[test]
    fn test_zero_interval_is_every_tick() {
        let mut scheduler = Scheduler::new([PeriodicTask::new(TaskKind::QueueEstimation, 0)]);
        assert_eq!(scheduler.due(1), vec![TaskKind::QueueEstimation]);
        assert_eq!(scheduler.due(2), vec![TaskKind::QueueEstimation]);
    }
}
