use crate::log_info;
use crate::types::{Phase, ProjectState};

/// A single preflight validation error with actionable context.
///
/// Preflight failures are deterministic and never routed to AI recovery;
/// they require a human fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightError {
    /// What condition failed.
    pub condition: String,
    /// Where the error originates.
    pub context: String,
    /// How to fix it.
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Preflight error: {}\n  Context: {}\n  Fix: {}",
            self.condition, self.context, self.suggested_fix
        )
    }
}

impl std::error::Error for PreflightError {}

/// Whether a phase may start executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseExecutionGate {
    /// Non-terminal status: normal execution.
    Open,
    /// Terminal status but actionable tasks remain; allowed, logged.
    Resumable,
    /// Terminal status and nothing actionable; refuse to run.
    Closed,
}

/// Compute the execution gate for a phase.
pub fn compute_gate(phase: &Phase) -> PhaseExecutionGate {
    if !phase.status.is_terminal() {
        return PhaseExecutionGate::Open;
    }
    if phase.has_actionable_tasks() {
        PhaseExecutionGate::Resumable
    } else {
        PhaseExecutionGate::Closed
    }
}

/// Resolve the phase the runner should execute.
///
/// `active_phase_id` wins when set; a dangling ID is an error; with no
/// active ID the first phase runs.
pub fn resolve_active_phase(state: &ProjectState) -> Result<&Phase, PreflightError> {
    match state.active_phase_id {
        Some(id) => state.phase(id).ok_or_else(|| PreflightError {
            condition: format!("Active phase {} not found in project state", id),
            context: "state → active_phase_id".to_string(),
            suggested_fix: "Clear active_phase_id or point it at an existing phase".to_string(),
        }),
        None => state.phases.first().ok_or_else(|| PreflightError {
            condition: "Project has no phases".to_string(),
            context: "state → phases".to_string(),
            suggested_fix: "Create a phase before running the orchestrator".to_string(),
        }),
    }
}

/// Run all preflight checks and return the phase to execute.
///
/// Checks, in order:
/// 1. Active phase resolves.
/// 2. Execution gate is not closed (terminal status with no actionable
///    tasks). Resumable phases are allowed and logged.
/// 3. Branch name is non-empty.
pub fn run_preflight(state: &ProjectState) -> Result<&Phase, PreflightError> {
    let phase = resolve_active_phase(state)?;

    match compute_gate(phase) {
        PhaseExecutionGate::Open => {}
        PhaseExecutionGate::Resumable => {
            log_info!(
                "[preflight] Phase '{}' is {} but has actionable tasks, resuming",
                phase.name,
                phase.status
            );
        }
        PhaseExecutionGate::Closed => {
            return Err(PreflightError {
                condition: format!(
                    "Phase '{}' is {} with no actionable tasks",
                    phase.name, phase.status
                ),
                context: format!("phase {} → status/tasks", phase.id),
                suggested_fix: "Pick a different phase or add tasks before re-running".to_string(),
            });
        }
    }

    if phase.branch_name.trim().is_empty() {
        return Err(PreflightError {
            condition: format!("Phase '{}' has an empty branch name", phase.name),
            context: format!("phase {} → branch_name", phase.id),
            suggested_fix: "Set a branch name on the phase".to_string(),
        });
    }

    Ok(phase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PhaseStatus, Task, TaskStatus};
    use uuid::Uuid;

    fn phase_with(status: PhaseStatus, task_status: Option<TaskStatus>) -> Phase {
        let mut phase = Phase::new("alpha", "feature/alpha");
        phase.status = status;
        if let Some(ts) = task_status {
            let mut task = Task::new("t", "");
            task.status = ts;
            phase.tasks.push(task);
        }
        phase
    }

    #[test]
    fn gate_open_for_non_terminal() {
        let phase = phase_with(PhaseStatus::Coding, None);
        assert_eq!(compute_gate(&phase), PhaseExecutionGate::Open);
    }

    #[test]
    fn gate_closed_for_terminal_without_actionable_tasks() {
        let phase = phase_with(PhaseStatus::Done, Some(TaskStatus::Done));
        assert_eq!(compute_gate(&phase), PhaseExecutionGate::Closed);
    }

    #[test]
    fn gate_resumable_for_terminal_with_ci_fix() {
        let phase = phase_with(PhaseStatus::CiFailed, Some(TaskStatus::CiFix));
        assert_eq!(compute_gate(&phase), PhaseExecutionGate::Resumable);
    }

    #[test]
    fn dangling_active_phase_id_is_an_error() {
        let state = ProjectState {
            project_name: "p".to_string(),
            active_phase_id: Some(Uuid::new_v4()),
            phases: vec![phase_with(PhaseStatus::Planning, None)],
            ..Default::default()
        };
        let err = resolve_active_phase(&state).unwrap_err();
        assert!(err.condition.contains("not found"));
    }

    #[test]
    fn first_phase_used_when_no_active_id() {
        let state = ProjectState {
            project_name: "p".to_string(),
            phases: vec![
                phase_with(PhaseStatus::Planning, None),
                phase_with(PhaseStatus::Coding, None),
            ],
            ..Default::default()
        };
        let phase = resolve_active_phase(&state).unwrap();
        assert_eq!(phase.id, state.phases[0].id);
    }

    #[test]
    fn empty_branch_name_fails_preflight() {
        let mut phase = phase_with(PhaseStatus::Planning, None);
        phase.branch_name = "  ".to_string();
        let state = ProjectState {
            project_name: "p".to_string(),
            phases: vec![phase],
            ..Default::default()
        };
        let err = run_preflight(&state).unwrap_err();
        assert!(err.condition.contains("empty branch name"));
    }
}
