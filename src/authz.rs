use crate::types::{AuthPolicy, Role, RolePolicy};

/// Current policy schema version understood by the evaluator.
pub const POLICY_VERSION: u32 = 1;

/// Action string constants used across the orchestrator.
pub mod actions {
    pub const STATUS_READ: &str = "status:read";
    pub const TASKS_READ: &str = "tasks:read";
    pub const LOGS_READ: &str = "logs:read";
    pub const USAGE_READ: &str = "usage:read";
    pub const EXECUTION_START: &str = "execution:start";
    pub const EXECUTION_STOP: &str = "execution:stop";
    pub const EXECUTION_NEXT: &str = "execution:next";
    pub const PHASE_CREATE: &str = "phase:create";
    pub const TASK_CREATE: &str = "task:create";
    pub const TASK_UPDATE: &str = "task:update";
    pub const GIT_BRANCH_CREATE: &str = "git:privileged:branch-create";
    pub const GIT_PUSH: &str = "git:privileged:push";
    pub const GIT_REBASE: &str = "git:privileged:rebase";
    pub const GIT_PR_OPEN: &str = "git:privileged:pr-open";
    pub const GIT_PR_MERGE: &str = "git:privileged:pr-merge";
    pub const CONFIG_WRITE: &str = "config:write";
    pub const AGENT_KILL: &str = "agent:kill";
    pub const AGENT_RESTART: &str = "agent:restart";
    pub const ORCHESTRATOR_CI_INTEGRATION_RUN: &str = "orchestrator:ci-integration:run";
    pub const ORCHESTRATOR_EXCEPTION_RECOVERY_RUN: &str = "orchestrator:exception-recovery:run";
    pub const ORCHESTRATOR_CI_VALIDATION_RUN: &str = "orchestrator:ci-validation:run";
}

/// Every action the orchestrator may ask the evaluator about.
pub const KNOWN_ACTIONS: &[&str] = &[
    actions::STATUS_READ,
    actions::TASKS_READ,
    actions::LOGS_READ,
    actions::USAGE_READ,
    actions::EXECUTION_START,
    actions::EXECUTION_STOP,
    actions::EXECUTION_NEXT,
    actions::PHASE_CREATE,
    actions::TASK_CREATE,
    actions::TASK_UPDATE,
    actions::GIT_BRANCH_CREATE,
    actions::GIT_PUSH,
    actions::GIT_REBASE,
    actions::GIT_PR_OPEN,
    actions::GIT_PR_MERGE,
    actions::CONFIG_WRITE,
    actions::AGENT_KILL,
    actions::AGENT_RESTART,
    actions::ORCHESTRATOR_CI_INTEGRATION_RUN,
    actions::ORCHESTRATOR_EXCEPTION_RECOVERY_RUN,
    actions::ORCHESTRATOR_CI_VALIDATION_RUN,
];

// --- Decisions ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    NoRole,
    DenylistMatch,
    NoAllowlistMatch,
    PolicyLoadFailed(String),
    RoleResolutionFailed(String),
    EvaluatorError(String),
    MissingActionMapping(String),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NoRole => write!(f, "no-role"),
            DenyReason::DenylistMatch => write!(f, "denylist-match"),
            DenyReason::NoAllowlistMatch => write!(f, "no-allowlist-match"),
            DenyReason::PolicyLoadFailed(msg) => write!(f, "policy-load-failed: {}", msg),
            DenyReason::RoleResolutionFailed(msg) => write!(f, "role-resolution-failed: {}", msg),
            DenyReason::EvaluatorError(msg) => write!(f, "evaluator-error: {}", msg),
            DenyReason::MissingActionMapping(action) => {
                write!(f, "missing-action-mapping: {}", action)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow { matched_pattern: String },
    Deny { reason: DenyReason },
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow { .. })
    }

    /// Short decision label for audit entries.
    pub fn label(&self) -> &'static str {
        match self {
            AuthDecision::Allow { .. } => "allow",
            AuthDecision::Deny { .. } => "deny",
        }
    }

    pub fn reason_string(&self) -> String {
        match self {
            AuthDecision::Allow { matched_pattern } => format!("matched: {}", matched_pattern),
            AuthDecision::Deny { reason } => reason.to_string(),
        }
    }
}

/// Typed rejection surfaced when a privileged orchestrator step is denied.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Authorization denied for '{action}': {reason}")]
pub struct OrchestrationAuthorizationDenied {
    pub action: String,
    pub reason: DenyReason,
}

// --- Pattern matching ---

/// Pattern semantics: `"*"` matches any action; `"ns:*"` matches actions
/// starting with `"ns:"` but not the bare `"ns"`; anything else is an exact
/// match.
pub fn matches_pattern(pattern: &str, action: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if prefix.ends_with(':') {
            return action.starts_with(prefix);
        }
    }
    pattern == action
}

fn first_match<'a>(patterns: &'a [String], action: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| matches_pattern(p, action))
        .map(|p| p.as_str())
}

// --- Evaluation ---

/// Evaluate a role against an action under a policy.
///
/// Check order is fixed:
/// 1. No role → deny `no-role`.
/// 2. Any denylist match → deny `denylist-match` (wins over any allowlist
///    entry, including `"*"`).
/// 3. First allowlist match → allow.
/// 4. Default deny `no-allowlist-match`.
pub fn evaluate(role: Option<Role>, action: &str, policy: &AuthPolicy) -> AuthDecision {
    let Some(role) = role else {
        return AuthDecision::Deny {
            reason: DenyReason::NoRole,
        };
    };

    static EMPTY: RolePolicy = RolePolicy {
        allowlist: Vec::new(),
        denylist: Vec::new(),
    };
    let role_policy = policy.roles.get(&role).unwrap_or(&EMPTY);

    if first_match(&role_policy.denylist, action).is_some() {
        return AuthDecision::Deny {
            reason: DenyReason::DenylistMatch,
        };
    }

    if let Some(pattern) = first_match(&role_policy.allowlist, action) {
        return AuthDecision::Allow {
            matched_pattern: pattern.to_string(),
        };
    }

    AuthDecision::Deny {
        reason: DenyReason::NoAllowlistMatch,
    }
}

/// Orchestrator-level authorization: resolves the role, loads the policy,
/// and evaluates, mapping each failure mode to its deny reason with the
/// underlying message preserved.
pub fn authorize_orchestrator_action(
    role_source: impl FnOnce() -> Result<Option<Role>, String>,
    policy_source: impl FnOnce() -> Result<AuthPolicy, String>,
    action: &str,
) -> AuthDecision {
    if !KNOWN_ACTIONS.contains(&action) {
        return AuthDecision::Deny {
            reason: DenyReason::MissingActionMapping(action.to_string()),
        };
    }

    let policy = match policy_source() {
        Ok(policy) => policy,
        Err(e) => {
            return AuthDecision::Deny {
                reason: DenyReason::PolicyLoadFailed(e),
            }
        }
    };

    if policy.version != POLICY_VERSION {
        return AuthDecision::Deny {
            reason: DenyReason::EvaluatorError(format!(
                "unsupported policy version {} (expected {})",
                policy.version, POLICY_VERSION
            )),
        };
    }

    let role = match role_source() {
        Ok(role) => role,
        Err(e) => {
            return AuthDecision::Deny {
                reason: DenyReason::RoleResolutionFailed(e),
            }
        }
    };

    evaluate(role, action, &policy)
}

/// Convert a decision into a result, for call sites that abort on deny.
pub fn require_allowed(
    decision: AuthDecision,
    action: &str,
) -> Result<String, OrchestrationAuthorizationDenied> {
    match decision {
        AuthDecision::Allow { matched_pattern } => Ok(matched_pattern),
        AuthDecision::Deny { reason } => Err(OrchestrationAuthorizationDenied {
            action: action.to_string(),
            reason,
        }),
    }
}

// --- Default policy ---

/// The built-in role policy.
///
/// `owner` and `admin` get everything; `operator` gets read + planning +
/// execution but no privileged git, config writes, or agent control;
/// `viewer` is read-only.
pub fn default_policy() -> AuthPolicy {
    let all = |patterns: &[&str]| patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>();

    let mut roles = std::collections::HashMap::new();
    roles.insert(
        Role::Owner,
        RolePolicy {
            allowlist: all(&["*"]),
            denylist: Vec::new(),
        },
    );
    roles.insert(
        Role::Admin,
        RolePolicy {
            allowlist: all(&["*"]),
            denylist: Vec::new(),
        },
    );
    roles.insert(
        Role::Operator,
        RolePolicy {
            allowlist: all(&[
                "status:read",
                "tasks:read",
                "logs:read",
                "usage:read",
                "execution:*",
                "phase:create",
                "task:*",
                "orchestrator:*",
            ]),
            denylist: all(&[
                "git:privileged:*",
                "config:write",
                "agent:kill",
                "agent:restart",
            ]),
        },
    );
    roles.insert(
        Role::Viewer,
        RolePolicy {
            allowlist: all(&["status:read", "tasks:read", "logs:read", "usage:read"]),
            denylist: all(&[
                "execution:*",
                "phase:create",
                "task:*",
                "git:privileged:*",
                "config:write",
                "agent:*",
            ]),
        },
    );

    AuthPolicy {
        version: POLICY_VERSION,
        roles,
    }
}
