use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Enums ---

/// States of the phase state machine.
///
/// Success path: Planning → Branching → Coding → CreatingPr → AwaitingCi →
/// ReadyForReview. `Done` is used when CI is disabled; `CiFailed` is a
/// terminal-with-resumable-work side branch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Planning,
    Branching,
    Coding,
    CreatingPr,
    AwaitingCi,
    ReadyForReview,
    CiFailed,
    Done,
}

impl PhaseStatus {
    /// Terminal statuses may still carry resumable work (see preflight).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Done
                | PhaseStatus::AwaitingCi
                | PhaseStatus::ReadyForReview
                | PhaseStatus::CiFailed
        )
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Planning => "planning",
            PhaseStatus::Branching => "branching",
            PhaseStatus::Coding => "coding",
            PhaseStatus::CreatingPr => "creating_pr",
            PhaseStatus::AwaitingCi => "awaiting_ci",
            PhaseStatus::ReadyForReview => "ready_for_review",
            PhaseStatus::CiFailed => "ci_failed",
            PhaseStatus::Done => "done",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Failed,
    CiFix,
}

impl TaskStatus {
    /// Actionable statuses are the ones the scheduler may pick.
    pub fn is_actionable(&self) -> bool {
        matches!(self, TaskStatus::Todo | TaskStatus::CiFix)
    }
}

/// Closed enumeration of supported external CLIs. `MockCli` exists for tests.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterId {
    #[default]
    Claude,
    Codex,
    Gemini,
    MockCli,
}

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterId::Claude => "claude",
            AdapterId::Codex => "codex",
            AdapterId::Gemini => "gemini",
            AdapterId::MockCli => "mock_cli",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_adapter_id(s: &str) -> Result<AdapterId, String> {
    match s.to_lowercase().as_str() {
        "claude" => Ok(AdapterId::Claude),
        "codex" => Ok(AdapterId::Codex),
        "gemini" => Ok(AdapterId::Gemini),
        "mock_cli" | "mock-cli" => Ok(AdapterId::MockCli),
        _ => Err(format!(
            "Invalid adapter '{}': expected claude, codex, gemini, or mock_cli",
            s
        )),
    }
}

/// High-level classification of engine exceptions.
///
/// `Unknown` is never recoverable. `AgentFailure` recoverability depends on
/// the adapter failure kind.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionCategory {
    DirtyWorktree,
    MissingCommit,
    AgentFailure,
    Unknown,
}

impl std::fmt::Display for ExceptionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExceptionCategory::DirtyWorktree => "dirty_worktree",
            ExceptionCategory::MissingCommit => "missing_commit",
            ExceptionCategory::AgentFailure => "agent_failure",
            ExceptionCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterFailureKind {
    Auth,
    Network,
    MissingBinary,
    Timeout,
    Unknown,
}

impl std::fmt::Display for AdapterFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterFailureKind::Auth => "auth",
            AdapterFailureKind::Network => "network",
            AdapterFailureKind::MissingBinary => "missing-binary",
            AdapterFailureKind::Timeout => "timeout",
            AdapterFailureKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Why a phase ended in `CiFailed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFailureKind {
    Branching,
    TaskExecution,
    Tester,
    RemoteCi,
    Validation,
    Recovery,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Fixed,
    Unfixable,
}

/// State of a single remote CI check.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckState {
    Success,
    Failure,
    Cancelled,
    Pending,
    Unknown,
}

impl CheckState {
    /// A blocking check prevents the phase from advancing to review.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            CheckState::Failure | CheckState::Cancelled | CheckState::Unknown
        )
    }

    /// Pending is the only non-terminal overall state.
    pub fn is_terminal(&self) -> bool {
        *self != CheckState::Pending
    }
}

impl std::fmt::Display for CheckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckState::Success => "SUCCESS",
            CheckState::Failure => "FAILURE",
            CheckState::Cancelled => "CANCELLED",
            CheckState::Pending => "PENDING",
            CheckState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Operator,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_role(s: &str) -> Result<Role, String> {
    match s.to_lowercase().as_str() {
        "owner" => Ok(Role::Owner),
        "admin" => Ok(Role::Admin),
        "operator" => Ok(Role::Operator),
        "viewer" => Ok(Role::Viewer),
        _ => Err(format!(
            "Invalid role '{}': expected owner, admin, operator, or viewer",
            s
        )),
    }
}

/// Which orchestration source holds the execution lock.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockOwner {
    CliPhaseRun,
    WebAutoMode,
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockOwner::CliPhaseRun => "CLI_PHASE_RUN",
            LockOwner::WebAutoMode => "WEB_AUTO_MODE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

// --- Structs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<AdapterId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ExceptionCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_failure_kind: Option<AdapterFailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_context: Option<String>,
}

impl Task {
    pub fn new(title: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Todo,
            assignee: None,
            dependencies: Vec::new(),
            error_logs: None,
            error_category: None,
            adapter_failure_kind: None,
            result_context: None,
        }
    }
}

/// A phase owns its tasks exclusively and maps one-to-one to a PR.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Phase {
    pub id: Uuid,
    pub name: String,
    pub branch_name: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_status_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<PhaseFailureKind>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Phase {
    pub fn new(name: &str, branch_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            branch_name: branch_name.to_string(),
            status: PhaseStatus::Planning,
            pr_url: None,
            ci_status_context: None,
            failure_kind: None,
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Any task left in an actionable status.
    pub fn has_actionable_tasks(&self) -> bool {
        self.tasks.iter().any(|t| t.status.is_actionable())
    }
}

/// Full project state as handed out by the state store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ProjectState {
    pub schema_version: u32,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_phase_id: Option<Uuid>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_attempts: Vec<RecoveryAttemptRecord>,
}

impl ProjectState {
    pub fn phase(&self, id: Uuid) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: Uuid) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }
}

/// Typed description of an engine exception, carried through recovery.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExceptionMetadata {
    pub category: ExceptionCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_failure_kind: Option<AdapterFailureKind>,
}

impl std::fmt::Display for ExceptionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Strict result contract the recovery adapter must produce.
/// Extra keys are rejected at parse time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecoveryResult {
    pub status: RecoveryStatus,
    pub reasoning: String,
    #[serde(default)]
    pub actions_taken: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RecoveryAttemptRecord {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub attempt_number: u32,
    pub exception: ExceptionMetadata,
    pub result: RecoveryResult,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CiCheck {
    pub name: String,
    pub state: CheckState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CiStatusSummary {
    pub overall: CheckState,
    #[serde(default)]
    pub checks: Vec<CiCheck>,
}

/// Per-role pattern lists. Patterns: literal action, `"*"`, or `"ns:*"`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct RolePolicy {
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AuthPolicy {
    pub version: u32,
    #[serde(default)]
    pub roles: HashMap<Role, RolePolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LockRecord {
    pub pid: i32,
    pub owner: LockOwner,
    pub project_name: String,
    pub acquired_at: DateTime<Utc>,
}

/// Strict reviewer output contract for the CI validation loop.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReviewOutcome {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub comments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phase_statuses() {
        assert!(PhaseStatus::Done.is_terminal());
        assert!(PhaseStatus::AwaitingCi.is_terminal());
        assert!(PhaseStatus::ReadyForReview.is_terminal());
        assert!(PhaseStatus::CiFailed.is_terminal());
        assert!(!PhaseStatus::Planning.is_terminal());
        assert!(!PhaseStatus::Coding.is_terminal());
    }

    #[test]
    fn actionable_task_statuses() {
        assert!(TaskStatus::Todo.is_actionable());
        assert!(TaskStatus::CiFix.is_actionable());
        assert!(!TaskStatus::InProgress.is_actionable());
        assert!(!TaskStatus::Done.is_actionable());
        assert!(!TaskStatus::Failed.is_actionable());
    }

    #[test]
    fn blocking_check_states() {
        assert!(CheckState::Failure.is_blocking());
        assert!(CheckState::Cancelled.is_blocking());
        assert!(CheckState::Unknown.is_blocking());
        assert!(!CheckState::Success.is_blocking());
        assert!(!CheckState::Pending.is_blocking());
    }

    #[test]
    fn recovery_result_rejects_extra_fields() {
        let raw = r#"{"status":"fixed","reasoning":"ok","actions_taken":[],"files_touched":[],"confidence":0.9}"#;
        let parsed: Result<RecoveryResult, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn recovery_result_round_trips() {
        let raw = r#"{"status":"unfixable","reasoning":"broken rebase","actions_taken":["git add -A"],"files_touched":["src/lib.rs"]}"#;
        let parsed: RecoveryResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, RecoveryStatus::Unfixable);
        let back = serde_json::to_string(&parsed).unwrap();
        let again: RecoveryResult = serde_json::from_str(&back).unwrap();
        assert_eq!(parsed, again);
    }

    #[test]
    fn review_outcome_parses_screaming_verdicts() {
        let raw = r#"{"verdict":"CHANGES_REQUESTED","comments":["Add regression test"]}"#;
        let parsed: ReviewOutcome = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.verdict, ReviewVerdict::ChangesRequested);
        assert_eq!(parsed.comments.len(), 1);
    }
}
