use crate::types::{ExceptionMetadata, Task};

/// Attempt-1 nudge for a dirty worktree: a plain cleanup request resumed in
/// the adapter's previous session, no structured output expected.
pub const DIRTY_WORKTREE_NUDGE: &str = "You left uncommitted changes. Please `git add` and `git commit` all your work with a descriptive message, then verify the repository is clean.";

/// A built recovery prompt plus how the adapter should be driven with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPrompt {
    pub text: String,
    pub resume: bool,
    pub expects_json: bool,
}

/// Build the prompt for one recovery attempt.
///
/// Attempt 1 on a dirty worktree gets the plain nudge (the adapter most
/// likely just forgot to commit); every other case gets the strict JSON
/// contract.
pub fn build_recovery_prompt(exception: &ExceptionMetadata, attempt_number: u32) -> RecoveryPrompt {
    use crate::types::ExceptionCategory;

    if exception.category == ExceptionCategory::DirtyWorktree && attempt_number == 1 {
        return RecoveryPrompt {
            text: DIRTY_WORKTREE_NUDGE.to_string(),
            resume: true,
            expects_json: false,
        };
    }

    let text = format!(
        "## Failure Recovery\n\n\
        You are running autonomously as a recovery agent for a development \
        orchestrator. No human is available for questions.\n\n\
        A failure occurred that you must attempt to fix:\n\n\
        - **Category:** {category}\n\
        - **Details:** {message}\n\
        - **Attempt:** {attempt}\n\n\
        ## Constraints\n\n\
        - You may inspect the repository and make the minimal change that \
        resolves the failure.\n\
        - The only git commands you may run are `git add` and `git commit`. \
        Never push, rebase, reset, or force anything.\n\
        - If the failure cannot be fixed from inside the repository, report \
        it as unfixable with your reasoning.\n\n\
        ## Structured Output\n\n\
        Reply with a single JSON object matching exactly this schema, with \
        no extra keys, no comments, and no trailing commas:\n\n\
        ```json\n\
        {{\n\
        \x20 \"status\": \"fixed | unfixable\",\n\
        \x20 \"reasoning\": \"What you found and what you did\",\n\
        \x20 \"actions_taken\": [\"command or step, one per entry\"],\n\
        \x20 \"files_touched\": [\"relative/path\"]\n\
        }}\n\
        ```",
        category = exception.category,
        message = exception.message,
        attempt = attempt_number,
    );

    RecoveryPrompt {
        text,
        resume: false,
        expects_json: true,
    }
}

/// Build the prompt for executing one scheduled task.
pub fn build_task_prompt(task: &Task, phase_name: &str, previous_context: Option<&str>) -> String {
    let mut sections = vec![format!(
        "## Task\n\n\
        You are running autonomously inside the '{phase}' development phase. \
        No human is available for questions, so use your judgment.\n\n\
        - **Title:** {title}\n\n\
        {description}",
        phase = phase_name,
        title = task.title,
        description = task.description,
    )];

    if let Some(logs) = &task.error_logs {
        sections.push(format!(
            "## Previous Failure\n\nThe last attempt at this task failed:\n\n{}",
            logs
        ));
    }

    if let Some(context) = previous_context {
        sections.push(format!("## Context From Previous Task\n\n{}", context));
    }

    sections.push(
        "## Completion\n\n\
        Implement the task fully. Commit your work with `git add` and \
        `git commit` using a descriptive message before finishing."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Build the reviewer prompt for the CI validation loop.
pub fn build_reviewer_prompt(diff: &str) -> String {
    format!(
        "## Change Review\n\n\
        You are reviewing the following diff as the final gate before a pull \
        request is marked ready. Judge correctness, test coverage, and \
        obvious regressions. Do not restyle working code.\n\n\
        ```diff\n{diff}\n```\n\n\
        ## Structured Output\n\n\
        Reply with a single JSON object matching exactly this schema, with no \
        extra keys:\n\n\
        ```json\n\
        {{\n\
        \x20 \"verdict\": \"APPROVED | CHANGES_REQUESTED\",\n\
        \x20 \"comments\": [\"One actionable finding per entry\"]\n\
        }}\n\
        ```\n\n\
        If the verdict is CHANGES_REQUESTED, `comments` must contain at \
        least one entry.",
        diff = diff,
    )
}

/// Build the fixer prompt from reviewer comments.
pub fn build_fixer_prompt(comments: &[String]) -> String {
    let findings = comments
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "## Review Fixes\n\n\
        A reviewer requested changes on the current branch. Address every \
        finding below, then commit your work with `git add` and `git commit`.\n\n\
        {findings}\n\n\
        Do not push. Do not start unrelated work.",
        findings = findings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdapterFailureKind, ExceptionMetadata};

    #[test]
    fn dirty_worktree_first_attempt_is_the_plain_nudge() {
        let exception = ExceptionMetadata::dirty_worktree(" M file.ts");
        let prompt = build_recovery_prompt(&exception, 1);
        assert_eq!(prompt.text, DIRTY_WORKTREE_NUDGE);
        assert!(prompt.resume);
        assert!(!prompt.expects_json);
    }

    #[test]
    fn dirty_worktree_second_attempt_uses_json_contract() {
        let exception = ExceptionMetadata::dirty_worktree(" M file.ts");
        let prompt = build_recovery_prompt(&exception, 2);
        assert!(!prompt.resume);
        assert!(prompt.expects_json);
        assert!(prompt.text.contains("\"status\": \"fixed | unfixable\""));
    }

    #[test]
    fn other_categories_always_use_json_contract() {
        let exception =
            ExceptionMetadata::agent_failure("timed out", AdapterFailureKind::Timeout);
        let prompt = build_recovery_prompt(&exception, 1);
        assert!(prompt.expects_json);
        assert!(prompt.text.contains("agent_failure"));
        assert!(prompt.text.contains("timed out"));
    }

    #[test]
    fn reviewer_prompt_embeds_diff_and_schema() {
        let prompt = build_reviewer_prompt("+ fn new() {}");
        assert!(prompt.contains("+ fn new() {}"));
        assert!(prompt.contains("APPROVED | CHANGES_REQUESTED"));
    }
}
