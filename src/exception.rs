use uuid::Uuid;

use crate::authz::OrchestrationAuthorizationDenied;
use crate::hooks::LifecycleHookExecutionError;
use crate::preflight::PreflightError;
use crate::process::ProcessExecutionError;
use crate::types::{AdapterFailureKind, ExceptionCategory, ExceptionMetadata};

// --- Adapter failure classification ---

/// Map a raw error message (and optional OS-style error code) to an adapter
/// failure kind, using case-insensitive substring checks.
pub fn classify_adapter_failure(message: &str, code: Option<&str>) -> AdapterFailureKind {
    let haystack = message.to_lowercase();
    let code = code.map(|c| c.to_uppercase());

    let contains_any = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if contains_any(&[
        "unauthorized",
        "authentication",
        "invalid api key",
        "credential",
        "401",
        "403",
    ]) {
        return AdapterFailureKind::Auth;
    }

    if code.as_deref() == Some("ENOENT")
        || contains_any(&["enoent", "no such file", "command not found", "not found on path"])
    {
        return AdapterFailureKind::MissingBinary;
    }

    if code.as_deref() == Some("ETIMEDOUT") || contains_any(&["etimedout", "timed out", "timeout"])
    {
        return AdapterFailureKind::Timeout;
    }

    if matches!(
        code.as_deref(),
        Some("ECONNREFUSED") | Some("ECONNRESET") | Some("ENOTFOUND")
    ) || contains_any(&[
        "econnrefused",
        "econnreset",
        "enotfound",
        "network",
        "socket hang up",
        "dns",
    ]) {
        return AdapterFailureKind::Network;
    }

    AdapterFailureKind::Unknown
}

/// Recoverability policy for adapter failure kinds. `auth` and
/// `missing-binary` need a human; everything else may be retried through
/// recovery.
pub fn is_recoverable_kind(kind: AdapterFailureKind) -> bool {
    !matches!(
        kind,
        AdapterFailureKind::Auth | AdapterFailureKind::MissingBinary
    )
}

// --- Metadata constructors ---

impl ExceptionMetadata {
    pub fn dirty_worktree(message: &str) -> Self {
        Self {
            category: ExceptionCategory::DirtyWorktree,
            message: message.to_string(),
            phase_id: None,
            task_id: None,
            adapter_failure_kind: None,
        }
    }

    pub fn missing_commit(message: &str) -> Self {
        Self {
            category: ExceptionCategory::MissingCommit,
            message: message.to_string(),
            phase_id: None,
            task_id: None,
            adapter_failure_kind: None,
        }
    }

    pub fn agent_failure(message: &str, kind: AdapterFailureKind) -> Self {
        Self {
            category: ExceptionCategory::AgentFailure,
            message: message.to_string(),
            phase_id: None,
            task_id: None,
            adapter_failure_kind: Some(kind),
        }
    }

    pub fn unknown(message: &str) -> Self {
        Self {
            category: ExceptionCategory::Unknown,
            message: message.to_string(),
            phase_id: None,
            task_id: None,
            adapter_failure_kind: None,
        }
    }

    pub fn with_phase(mut self, phase_id: Uuid) -> Self {
        self.phase_id = Some(phase_id);
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Whether the recovery loop may attempt this exception at all.
    pub fn is_recoverable(&self) -> bool {
        match self.category {
            ExceptionCategory::Unknown => false,
            ExceptionCategory::AgentFailure => self
                .adapter_failure_kind
                .map(is_recoverable_kind)
                .unwrap_or(true),
            ExceptionCategory::DirtyWorktree | ExceptionCategory::MissingCommit => true,
        }
    }
}

/// Derive exception metadata from a failed subprocess invocation of an
/// adapter.
pub fn from_process_error(err: &ProcessExecutionError) -> ExceptionMetadata {
    match err {
        ProcessExecutionError::Spawn { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            ExceptionMetadata::agent_failure(&err.to_string(), AdapterFailureKind::MissingBinary)
        }
        ProcessExecutionError::Timeout { .. } => {
            ExceptionMetadata::agent_failure(&err.to_string(), AdapterFailureKind::Timeout)
        }
        ProcessExecutionError::NonZeroExit { output, .. } => {
            let combined = format!("{} {}", output.stderr, output.stdout);
            let kind = classify_adapter_failure(&combined, None);
            ExceptionMetadata::agent_failure(&err.to_string(), kind)
        }
        _ => ExceptionMetadata::agent_failure(
            &err.to_string(),
            classify_adapter_failure(&err.to_string(), None),
        ),
    }
}

// --- Engine error taxonomy ---

/// Crate-wide error hierarchy with an explicit category discriminator.
///
/// Authorization and preflight errors are never routed to recovery;
/// `Exception` variants are, when their metadata says they are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    AuthorizationDenied(#[from] OrchestrationAuthorizationDenied),

    #[error("{0}")]
    Preflight(PreflightError),

    #[error("{0}")]
    Exception(ExceptionMetadata),

    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("CI_FIX fan-out cap exceeded ({0})")]
    FanOutCapExceeded(u32),

    #[error("CI_FIX cascade depth cap exceeded ({0})")]
    DepthCapExceeded(u32),

    #[error("State store error: {0}")]
    State(String),

    #[error(transparent)]
    Process(#[from] ProcessExecutionError),

    #[error(transparent)]
    Hook(#[from] LifecycleHookExecutionError),
}

impl EngineError {
    pub fn exception(&self) -> Option<&ExceptionMetadata> {
        match self {
            EngineError::Exception(meta) => Some(meta),
            _ => None,
        }
    }

    /// Only recoverable engine exceptions go through the recovery loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Exception(meta) if meta.is_recoverable())
    }
}

impl From<ExceptionMetadata> for EngineError {
    fn from(meta: ExceptionMetadata) -> Self {
        EngineError::Exception(meta)
    }
}

impl From<PreflightError> for EngineError {
    fn from(err: PreflightError) -> Self {
        EngineError::Preflight(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_failures() {
        assert_eq!(
            classify_adapter_failure("API error 401 Unauthorized", None),
            AdapterFailureKind::Auth
        );
        assert_eq!(
            classify_adapter_failure("invalid API key provided", None),
            AdapterFailureKind::Auth
        );
    }

    #[test]
    fn classifies_missing_binary_via_code_and_message() {
        assert_eq!(
            classify_adapter_failure("spawn failed", Some("ENOENT")),
            AdapterFailureKind::MissingBinary
        );
        assert_eq!(
            classify_adapter_failure("claude: command not found", None),
            AdapterFailureKind::MissingBinary
        );
    }

    #[test]
    fn classifies_timeout_and_network() {
        assert_eq!(
            classify_adapter_failure("request timed out after 30s", None),
            AdapterFailureKind::Timeout
        );
        assert_eq!(
            classify_adapter_failure("getaddrinfo ENOTFOUND api.example.com", None),
            AdapterFailureKind::Network
        );
        assert_eq!(
            classify_adapter_failure("something exploded", None),
            AdapterFailureKind::Unknown
        );
    }

    #[test]
    fn recoverability_policy() {
        assert!(!is_recoverable_kind(AdapterFailureKind::Auth));
        assert!(!is_recoverable_kind(AdapterFailureKind::MissingBinary));
        assert!(is_recoverable_kind(AdapterFailureKind::Timeout));
        assert!(is_recoverable_kind(AdapterFailureKind::Network));
        assert!(is_recoverable_kind(AdapterFailureKind::Unknown));
    }

    #[test]
    fn unknown_category_is_never_recoverable() {
        assert!(!ExceptionMetadata::unknown("???").is_recoverable());
        assert!(ExceptionMetadata::dirty_worktree("m").is_recoverable());
        assert!(ExceptionMetadata::missing_commit("m").is_recoverable());
        assert!(
            !ExceptionMetadata::agent_failure("m", AdapterFailureKind::Auth).is_recoverable()
        );
        assert!(
            ExceptionMetadata::agent_failure("m", AdapterFailureKind::Network).is_recoverable()
        );
    }
}
