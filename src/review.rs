use uuid::Uuid;

use crate::audit::AuditLog;
use crate::authz::{self, actions};
use crate::exception::EngineError;
use crate::git::GitClient;
use crate::process::ProcessRunner;
use crate::prompt;
use crate::recovery::extract_json_object;
use crate::state::{InternalWorkRequest, StateStore};
use crate::types::{AdapterId, AuthPolicy, ReviewOutcome, ReviewVerdict, Role};
use crate::log_info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Approved,
    MaxRetriesExceeded { pending_comments: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub reviews: Vec<ReviewOutcome>,
    pub fix_attempts: u32,
}

/// Parse reviewer output into the strict verdict contract.
pub fn parse_review_outcome(text: &str) -> Result<ReviewOutcome, String> {
    let object = extract_json_object(text)?;
    serde_json::from_str(&object)
        .map_err(|e| format!("Review outcome does not match the contract: {}", e))
}

/// Reviewer→fixer cycle over the working diff.
///
/// Loop: an empty diff is an immediate approval; otherwise the reviewer
/// judges the diff against the base branch. `CHANGES_REQUESTED` must carry
/// at least one comment (a bare rejection is a contract violation). Fixes
/// are attempted until `max_retries` is exhausted; the fixer resumes its
/// session after its first attempt.
#[allow(clippy::too_many_arguments)]
pub async fn run_validation_loop<S: StateStore, R: ProcessRunner>(
    store: &S,
    git: &GitClient<R>,
    audit: &AuditLog,
    role: Option<Role>,
    policy: &AuthPolicy,
    reviewer: AdapterId,
    fixer: AdapterId,
    base_branch: &str,
    max_retries: u32,
    phase_id: Uuid,
) -> Result<ValidationReport, EngineError> {
    let action = actions::ORCHESTRATOR_CI_VALIDATION_RUN;
    let decision = authz::evaluate(role, action, policy);
    audit
        .record_decision(
            "ci-validation",
            role,
            action,
            &phase_id.to_string(),
            &decision,
            None,
        )
        .map_err(EngineError::State)?;
    authz::require_allowed(decision, action)?;

    let mut reviews: Vec<ReviewOutcome> = Vec::new();
    let mut fix_attempts: u32 = 0;

    loop {
        let diff = git
            .diff_against(base_branch)
            .await
            .map_err(EngineError::State)?;

        if diff.trim().is_empty() {
            log_info!("[review] Working diff is empty, approving");
            return Ok(ValidationReport {
                status: ValidationStatus::Approved,
                reviews,
                fix_attempts,
            });
        }

        let reviewer_output = store
            .run_internal_work(InternalWorkRequest {
                assignee: reviewer,
                prompt: prompt::build_reviewer_prompt(&diff),
                phase_id: Some(phase_id),
                task_id: None,
                resume: false,
            })
            .await
            .map_err(EngineError::State)?;

        let review = parse_review_outcome(&reviewer_output.stdout).map_err(EngineError::Contract)?;

        if review.verdict == ReviewVerdict::ChangesRequested && review.comments.is_empty() {
            return Err(EngineError::Contract(
                "Reviewer returned CHANGES_REQUESTED with no comments".to_string(),
            ));
        }

        let comments = review.comments.clone();
        let verdict = review.verdict;
        reviews.push(review);

        if verdict == ReviewVerdict::Approved {
            log_info!(
                "[review] Approved after {} fix attempt(s), {} review(s)",
                fix_attempts,
                reviews.len()
            );
            return Ok(ValidationReport {
                status: ValidationStatus::Approved,
                reviews,
                fix_attempts,
            });
        }

        if fix_attempts >= max_retries {
            log_info!(
                "[review] Retries exhausted with {} pending comment(s)",
                comments.len()
            );
            return Ok(ValidationReport {
                status: ValidationStatus::MaxRetriesExceeded {
                    pending_comments: comments,
                },
                reviews,
                fix_attempts,
            });
        }

        store
            .run_internal_work(InternalWorkRequest {
                assignee: fixer,
                prompt: prompt::build_fixer_prompt(&comments),
                phase_id: Some(phase_id),
                task_id: None,
                resume: fix_attempts > 0,
            })
            .await
            .map_err(EngineError::State)?;

        fix_attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_review_outcome() {
        let text = "verdict below\n```json\n{\"verdict\":\"APPROVED\",\"comments\":[]}\n```";
        let outcome = parse_review_outcome(text).unwrap();
        assert_eq!(outcome.verdict, ReviewVerdict::Approved);
        assert!(outcome.comments.is_empty());
    }

    #[test]
    fn rejects_unknown_review_fields() {
        let text = r#"{"verdict":"APPROVED","comments":[],"score":10}"#;
        assert!(parse_review_outcome(text).is_err());
    }
}
