use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::authz::{self, actions};
use crate::exception::EngineError;
use crate::git::GitClient;
use crate::process::{ProcessRequest, ProcessRunner};
use crate::types::{AuthPolicy, ExceptionMetadata, Phase, Role, Task, TaskStatus};
use crate::log_info;

/// PR titles are clipped to what the hosting service accepts.
pub const MAX_PR_TITLE_CHARS: usize = 250;

/// PR bodies are clipped well below the hosting service's hard limit.
pub const MAX_PR_BODY_CHARS: usize = 60000;

const BODY_FOOTER: &str = "---\nOpened by the ixado orchestrator.";

/// Maps a branch prefix to a PR template body.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TemplateMapping {
    pub branch_prefix: String,
    pub template: String,
}

#[derive(Debug, Clone, Default)]
pub struct PrOptions {
    pub draft: bool,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub template_mappings: Vec<TemplateMapping>,
    pub default_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiIntegrationOutcome {
    pub pr_url: String,
    pub branch: String,
    pub commit_sha: String,
}

// --- PR metadata derivation ---

/// PR title: the phase name, trimmed, newlines flattened, clipped.
pub fn derive_pr_title(phase_name: &str) -> String {
    let flattened: String = phase_name
        .trim()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    flattened.chars().take(MAX_PR_TITLE_CHARS).collect()
}

/// PR body: phase heading, the completed tasks sorted by title, an optional
/// template, and the attribution footer.
pub fn derive_pr_body(phase: &Phase, template: Option<&str>) -> String {
    let mut completed: Vec<&Task> = phase
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .collect();
    completed.sort_by(|a, b| a.title.cmp(&b.title));

    let mut sections = vec![format!("## Phase: {}", phase.name)];

    if !completed.is_empty() {
        let list = completed
            .iter()
            .map(|t| format!("- {}", t.title))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("### Completed tasks\n\n{}", list));
    }

    if let Some(template) = template {
        sections.push(template.trim().to_string());
    }

    sections.push(BODY_FOOTER.to_string());

    let body = sections.join("\n\n");
    body.chars().take(MAX_PR_BODY_CHARS).collect()
}

/// Resolve the PR template for a head branch.
///
/// Mappings are tried longest prefix first; the first prefix match wins.
/// Falls back to the default template, which may be absent.
pub fn resolve_template<'a>(
    mappings: &'a [TemplateMapping],
    head_branch: &str,
    default_template: Option<&'a str>,
) -> Option<&'a str> {
    let mut sorted: Vec<&TemplateMapping> = mappings.iter().collect();
    sorted.sort_by(|a, b| b.branch_prefix.len().cmp(&a.branch_prefix.len()));

    sorted
        .iter()
        .find(|m| head_branch.starts_with(&m.branch_prefix))
        .map(|m| m.template.as_str())
        .or(default_template)
}

fn parse_pr_url(stdout: &str) -> Result<String, EngineError> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("http"))
        .map(|line| line.to_string())
        .ok_or_else(|| {
            EngineError::Contract(format!(
                "Host CLI did not print a PR URL (output: {})",
                stdout.trim()
            ))
        })
}

// --- Integration sequence ---

/// Stage, commit, push, and open the PR for a finished phase.
///
/// Every privileged step (push, PR create) is authorized independently and
/// audited; a denial aborts before the corresponding subprocess is spawned.
/// Missing staged changes after stage-all is a recoverable missing-commit
/// exception.
pub async fn run_ci_integration<R: ProcessRunner>(
    runner: &R,
    git: &GitClient<R>,
    audit: &AuditLog,
    role: Option<Role>,
    policy: &AuthPolicy,
    phase: &Phase,
    options: &PrOptions,
) -> Result<CiIntegrationOutcome, EngineError> {
    let action = actions::ORCHESTRATOR_CI_INTEGRATION_RUN;
    let decision = authz::evaluate(role, action, policy);
    audit
        .record_decision("ci-integrator", role, action, &phase.name, &decision, None)
        .map_err(EngineError::State)?;
    authz::require_allowed(decision, action)?;

    git.stage_all().await.map_err(EngineError::State)?;

    if !git.has_staged_changes().await.map_err(EngineError::State)? {
        return Err(EngineError::Exception(
            ExceptionMetadata::missing_commit(&format!(
                "No staged changes to finalize for phase '{}'",
                phase.name
            ))
            .with_phase(phase.id),
        ));
    }

    let commit_message = format!("chore: finalize {}", phase.name);
    let commit_sha = git
        .commit(&commit_message)
        .await
        .map_err(EngineError::State)?;

    let branch = git.current_branch().await.map_err(EngineError::State)?;

    // Push, independently authorized
    let push_line = format!("git push --set-upstream origin {}", branch);
    let decision = authz::evaluate(role, actions::GIT_PUSH, policy);
    audit
        .record_decision(
            "ci-integrator",
            role,
            actions::GIT_PUSH,
            &branch,
            &decision,
            Some(&push_line),
        )
        .map_err(EngineError::State)?;
    authz::require_allowed(decision, actions::GIT_PUSH)?;
    git.push_set_upstream(&branch)
        .await
        .map_err(EngineError::State)?;

    // PR create, independently authorized
    let title = derive_pr_title(&phase.name);
    let template = resolve_template(
        &options.template_mappings,
        &branch,
        options.default_template.as_deref(),
    );
    let body = derive_pr_body(phase, template);

    let mut args: Vec<String> = vec![
        "pr".to_string(),
        "create".to_string(),
        "--title".to_string(),
        title,
        "--body".to_string(),
        body,
    ];
    if options.draft {
        args.push("--draft".to_string());
    }
    for label in &options.labels {
        args.push("--label".to_string());
        args.push(label.clone());
    }
    for assignee in &options.assignees {
        args.push("--assignee".to_string());
        args.push(assignee.clone());
    }

    let arg_refs: Vec<&str> = args.iter().map(|a| a.as_str()).collect();
    let request = ProcessRequest::new("gh", &arg_refs, git.cwd());
    let pr_line = request.command_line();

    let decision = authz::evaluate(role, actions::GIT_PR_OPEN, policy);
    audit
        .record_decision(
            "ci-integrator",
            role,
            actions::GIT_PR_OPEN,
            &branch,
            &decision,
            Some(&pr_line),
        )
        .map_err(EngineError::State)?;
    authz::require_allowed(decision, actions::GIT_PR_OPEN)?;

    let output = runner.run(request).await?;
    let pr_url = parse_pr_url(&output.stdout)?;

    log_info!("[ci] Opened PR {} from branch {}", pr_url, branch);

    Ok(CiIntegrationOutcome {
        pr_url,
        branch,
        commit_sha,
    })
}

/// Flip a draft PR to ready for review. Authorized and audited like any
/// other privileged host-CLI call.
pub async fn mark_pr_ready<R: ProcessRunner>(
    runner: &R,
    git: &GitClient<R>,
    audit: &AuditLog,
    role: Option<Role>,
    policy: &AuthPolicy,
    pr_url: &str,
) -> Result<(), EngineError> {
    let request = ProcessRequest::new("gh", &["pr", "ready", pr_url], git.cwd());
    let line = request.command_line();

    let decision = authz::evaluate(role, actions::GIT_PR_OPEN, policy);
    audit
        .record_decision(
            "ci-integrator",
            role,
            actions::GIT_PR_OPEN,
            pr_url,
            &decision,
            Some(&line),
        )
        .map_err(EngineError::State)?;
    authz::require_allowed(decision, actions::GIT_PR_OPEN)?;

    runner.run(request).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_trimmed_flattened_and_clipped() {
        assert_eq!(derive_pr_title("  add auth\nflow  "), "add auth flow");
        let long = "x".repeat(400);
        assert_eq!(derive_pr_title(&long).chars().count(), MAX_PR_TITLE_CHARS);
    }

    #[test]
    fn body_lists_completed_tasks_sorted() {
        let mut phase = Phase::new("auth", "feature/auth");
        for (title, status) in [
            ("zeta work", TaskStatus::Done),
            ("alpha work", TaskStatus::Done),
            ("skipped", TaskStatus::Todo),
        ] {
            let mut task = Task::new(title, "");
            task.status = status;
            phase.tasks.push(task);
        }

        let body = derive_pr_body(&phase, None);
        assert!(body.starts_with("## Phase: auth"));
        let alpha = body.find("- alpha work").unwrap();
        let zeta = body.find("- zeta work").unwrap();
        assert!(alpha < zeta);
        assert!(!body.contains("- skipped"));
        assert!(body.contains(BODY_FOOTER));
    }

    #[test]
    fn template_resolution_prefers_longest_prefix() {
        let mappings = vec![
            TemplateMapping {
                branch_prefix: "feature/".to_string(),
                template: "generic feature".to_string(),
            },
            TemplateMapping {
                branch_prefix: "feature/auth".to_string(),
                template: "auth feature".to_string(),
            },
        ];
        assert_eq!(
            resolve_template(&mappings, "feature/auth-login", None),
            Some("auth feature")
        );
        assert_eq!(
            resolve_template(&mappings, "feature/billing", None),
            Some("generic feature")
        );
        assert_eq!(
            resolve_template(&mappings, "hotfix/x", Some("default body")),
            Some("default body")
        );
        assert_eq!(resolve_template(&mappings, "hotfix/x", None), None);
    }

    #[test]
    fn pr_url_is_last_http_line() {
        let stdout = "Creating pull request for feature/auth into main\nhttps://github.com/acme/app/pull/42\n";
        assert_eq!(
            parse_pr_url(stdout).unwrap(),
            "https://github.com/acme/app/pull/42"
        );
        assert!(parse_pr_url("no url here").is_err());
    }
}
