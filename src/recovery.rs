use chrono::Utc;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::authz::{self, actions};
use crate::exception::{self, EngineError};
use crate::git::GitClient;
use crate::process::ProcessRunner;
use crate::prompt;
use crate::state::{InternalWorkRequest, StateStore};
use crate::types::{
    AdapterId, AuthPolicy, ExceptionCategory, ExceptionMetadata, RecoveryAttemptRecord,
    RecoveryResult, RecoveryStatus, Role,
};
use crate::{log_info, log_warn};

// --- Robust JSON extraction ---

/// Extract a JSON object from model output.
///
/// Tries, in order: the whole trimmed text, a fenced ```json block, and a
/// balanced-brace scan that honors strings and escapes. This tolerates
/// prose before the object, markdown fencing, and trailing text after it.
pub fn extract_json_object(text: &str) -> Result<String, String> {
    let trimmed = text.trim();
    if parses_as_object(trimmed) {
        return Ok(trimmed.to_string());
    }

    if let Some(block) = fenced_json_block(text) {
        let block = block.trim();
        if parses_as_object(block) {
            return Ok(block.to_string());
        }
    }

    if let Some(candidate) = find_balanced_object(text) {
        if parses_as_object(candidate) {
            return Ok(candidate.to_string());
        }
    }

    Err("No JSON object found in adapter output".to_string())
}

fn parses_as_object(text: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(serde_json::Value::Object(_))
    )
}

fn fenced_json_block(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// First balanced `{...}` object, tracking string and escape state so braces
/// inside string values do not confuse the depth count.
fn find_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        let idx = start + offset;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse adapter output into the strict recovery result contract.
pub fn parse_recovery_result(text: &str) -> Result<RecoveryResult, String> {
    let object = extract_json_object(text)?;
    serde_json::from_str(&object)
        .map_err(|e| format!("Recovery result does not match the contract: {}", e))
}

// --- Action guardrails ---

/// Validate the adapter's claimed actions against the git guardrails.
///
/// Only `git add …` and `git commit …` are permitted git commands; any
/// other git subcommand (and any form of push or rebase) is rejected.
/// Non-git actions pass through unchanged.
pub fn validate_actions(actions_taken: &[String]) -> Result<(), String> {
    for action in actions_taken {
        let lowered = action.trim().to_lowercase();
        let mut words = lowered.split_whitespace();
        if words.next() != Some("git") {
            continue;
        }
        match words.next() {
            Some("add") | Some("commit") => {}
            Some(sub) => {
                return Err(format!(
                    "Recovery action '{}' uses forbidden git subcommand '{}' (only add and commit are allowed)",
                    action.trim(),
                    sub
                ));
            }
            None => {
                return Err(format!(
                    "Recovery action '{}' is a bare git invocation",
                    action.trim()
                ));
            }
        }
    }
    Ok(())
}

// --- Postconditions ---

/// Verify that a claimed fix actually holds for the exception category.
///
/// Dirty-worktree and missing-commit fixes both require a clean tree
/// afterwards; agent failures have no mechanical postcondition.
pub async fn verify_postcondition<R: ProcessRunner>(
    category: ExceptionCategory,
    git: &GitClient<R>,
) -> Result<bool, String> {
    match category {
        ExceptionCategory::DirtyWorktree | ExceptionCategory::MissingCommit => git.is_clean().await,
        ExceptionCategory::AgentFailure | ExceptionCategory::Unknown => Ok(true),
    }
}

// --- One recovery attempt ---

#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub assignee: AdapterId,
    pub exception: ExceptionMetadata,
    pub attempt_number: u32,
    pub role: Option<Role>,
    pub policy: AuthPolicy,
}

/// Run a single recovery attempt for one exception.
///
/// Flow: authorize → audit → build prompt → invoke adapter → parse strict
/// JSON (unless the attempt-1 dirty-worktree nudge applies) → validate
/// actions → verify the postcondition when the adapter claims `fixed`.
/// The returned record's status reflects the verified outcome.
pub async fn run_exception_recovery<S: StateStore, R: ProcessRunner>(
    store: &S,
    git: &GitClient<R>,
    audit: &AuditLog,
    request: &RecoveryRequest,
) -> Result<RecoveryAttemptRecord, EngineError> {
    let action = actions::ORCHESTRATOR_EXCEPTION_RECOVERY_RUN;
    let decision = authz::evaluate(request.role, action, &request.policy);
    let target = request.exception.category.to_string();
    audit
        .record_decision("recovery", request.role, action, &target, &decision, None)
        .map_err(EngineError::State)?;
    authz::require_allowed(decision, action)?;

    audit
        .record_event("recovery", "recovery:detected", &request.exception.to_string())
        .map_err(EngineError::State)?;

    let recovery_prompt = prompt::build_recovery_prompt(&request.exception, request.attempt_number);

    audit
        .record_event(
            "recovery",
            "recovery:adapter-invoked",
            &format!("{} attempt {}", request.assignee, request.attempt_number),
        )
        .map_err(EngineError::State)?;

    let work = store
        .run_internal_work(InternalWorkRequest {
            assignee: request.assignee,
            prompt: recovery_prompt.text.clone(),
            phase_id: request.exception.phase_id,
            task_id: request.exception.task_id,
            resume: recovery_prompt.resume,
        })
        .await
        .map_err(|e| {
            EngineError::Exception(ExceptionMetadata::agent_failure(
                &e,
                exception::classify_adapter_failure(&e, None),
            ))
        })?;

    let mut result = if recovery_prompt.expects_json {
        let parsed = parse_recovery_result(&work.stdout).map_err(EngineError::Contract)?;
        validate_actions(&parsed.actions_taken).map_err(EngineError::Contract)?;
        parsed
    } else {
        RecoveryResult {
            status: RecoveryStatus::Fixed,
            reasoning: "Adapter was asked to stage and commit outstanding changes".to_string(),
            actions_taken: Vec::new(),
            files_touched: Vec::new(),
        }
    };

    if result.status == RecoveryStatus::Fixed {
        let holds = verify_postcondition(request.exception.category, git)
            .await
            .map_err(EngineError::State)?;
        if !holds {
            log_warn!(
                "[recovery] Adapter claimed fixed but the {} postcondition does not hold",
                request.exception.category
            );
            result.status = RecoveryStatus::Unfixable;
            result
                .reasoning
                .push_str(" (postcondition verification failed)");
        }
    }

    let record = RecoveryAttemptRecord {
        id: Uuid::new_v4(),
        occurred_at: Utc::now(),
        attempt_number: request.attempt_number,
        exception: request.exception.clone(),
        result,
    };

    store
        .record_recovery_attempt(record.clone())
        .await
        .map_err(EngineError::State)?;

    audit
        .record_event(
            "recovery",
            "recovery:parsed-result",
            &format!("attempt {} -> {:?}", record.attempt_number, record.result.status),
        )
        .map_err(EngineError::State)?;

    Ok(record)
}

// --- Outer retry loop ---

/// Drive recovery attempts for one exception until it is fixed or the
/// attempt budget is exhausted.
///
/// Authorization denials propagate immediately and are never retried.
/// Exhaustion surfaces the original exception with a `Recovery:` prefix so
/// the caller can fail the phase with that context.
#[allow(clippy::too_many_arguments)]
pub async fn attempt_exception_recovery<S: StateStore, R: ProcessRunner>(
    store: &S,
    git: &GitClient<R>,
    audit: &AuditLog,
    assignee: AdapterId,
    exception: ExceptionMetadata,
    role: Option<Role>,
    policy: &AuthPolicy,
    max_attempts: u32,
) -> Result<u32, EngineError> {
    if !exception.is_recoverable() {
        return Err(EngineError::Exception(exception));
    }

    let mut last_failure: Option<String> = None;

    for attempt in 1..=max_attempts {
        log_info!(
            "[recovery] Attempt {}/{} for {}",
            attempt,
            max_attempts,
            exception.category
        );

        let request = RecoveryRequest {
            assignee,
            exception: exception.clone(),
            attempt_number: attempt,
            role,
            policy: policy.clone(),
        };

        match run_exception_recovery(store, git, audit, &request).await {
            Ok(record) if record.result.status == RecoveryStatus::Fixed => {
                log_info!("[recovery] Fixed on attempt {}", attempt);
                return Ok(attempt);
            }
            Ok(record) => {
                last_failure = Some(record.result.reasoning);
            }
            Err(EngineError::AuthorizationDenied(denied)) => {
                return Err(EngineError::AuthorizationDenied(denied));
            }
            Err(e) => {
                last_failure = Some(e.to_string());
            }
        }
    }

    let mut exhausted = exception;
    exhausted.message = format!(
        "Recovery: exhausted {} attempt(s): {}",
        max_attempts,
        last_failure.unwrap_or_else(|| exhausted.message.clone())
    );
    Err(EngineError::Exception(exhausted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_direct_object() {
        let text = r#"{"status":"fixed","reasoning":"ok"}"#;
        assert_eq!(extract_json_object(text).unwrap(), text);
    }

    #[test]
    fn extracts_from_fenced_block() {
        let text = "Here is my result:\n```json\n{\"status\":\"fixed\",\"reasoning\":\"ok\"}\n```\nDone.";
        let object = extract_json_object(text).unwrap();
        assert_eq!(object, r#"{"status":"fixed","reasoning":"ok"}"#);
    }

    #[test]
    fn extracts_embedded_object_with_braces_in_strings() {
        let text = r#"Some prose first {"status":"unfixable","reasoning":"file has a { in it"} trailing words"#;
        let object = extract_json_object(text).unwrap();
        let parsed: RecoveryResult = serde_json::from_str(&object).unwrap();
        assert_eq!(parsed.status, RecoveryStatus::Unfixable);
        assert!(parsed.reasoning.contains('{'));
    }

    #[test]
    fn rejects_output_without_an_object() {
        assert!(extract_json_object("all good, nothing to report").is_err());
        assert!(extract_json_object("[1, 2, 3]").is_err());
    }

    #[test]
    fn strict_parse_rejects_extra_keys() {
        let text = r#"{"status":"fixed","reasoning":"ok","extra":true}"#;
        assert!(parse_recovery_result(text).is_err());
    }

    #[test]
    fn git_add_and_commit_are_allowed() {
        let actions = vec![
            "git add -A".to_string(),
            "git commit -m 'fix'".to_string(),
            "cargo fmt".to_string(),
            "edited src/lib.rs".to_string(),
        ];
        assert!(validate_actions(&actions).is_ok());
    }

    #[test]
    fn push_rebase_and_other_git_subcommands_are_rejected() {
        for action in [
            "git push",
            "git push --force origin main",
            "GIT PUSH",
            "git rebase -i HEAD~3",
            "git reset --hard",
            "git checkout main",
            "git",
        ] {
            assert!(
                validate_actions(&[action.to_string()]).is_err(),
                "expected '{}' to be rejected",
                action
            );
        }
    }
}
