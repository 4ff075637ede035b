use crate::types::{Task, TaskStatus};

/// Select the next actionable task from a phase's task list.
///
/// Pure function: no I/O, no async, trivially testable.
///
/// Priority rules, highest first:
/// 1. Earliest `CiFix` task.
/// 2. Earliest `Todo` task.
///
/// Within a tier the lowest index wins, which keeps selection stable across
/// state reloads. `InProgress` is never pickable; it means active work or a
/// crashed predecessor (startup reconciliation handles the latter).
///
/// Returns `None` when no actionable task exists.
pub fn pick_next_task(tasks: &[Task]) -> Option<usize> {
    if let Some(index) = tasks.iter().position(|t| t.status == TaskStatus::CiFix) {
        return Some(index);
    }
    tasks.iter().position(|t| t.status == TaskStatus::Todo)
}
