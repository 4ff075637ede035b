use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{EventFamily, EventLevel, RuntimeEvent, RuntimeEventBus};
use crate::exception::EngineError;
use crate::process::{ProcessRequest, ProcessRunner};
use crate::types::{CheckState, CiCheck, CiStatusSummary, Task, TaskStatus};
use crate::{log_debug, log_info};

/// Terminal states must be observed this many times consecutively before
/// polling stops. Rides out the race between a rerun trigger and the first
/// read of the new run.
pub const DEFAULT_TERMINAL_CONFIRMATIONS: u32 = 2;

pub const CI_FIX_TITLE_PREFIX: &str = "CI_FIX: ";
const TESTER_FIX_TITLE_PREFIX: &str = "Fix tests after ";

// --- Host CLI rollup parsing ---

#[derive(Debug, Deserialize)]
struct RollupEnvelope {
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: Vec<RollupCheck>,
}

#[derive(Debug, Deserialize)]
struct RollupCheck {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(rename = "detailsUrl", default)]
    details_url: Option<String>,
}

/// Map one rollup entry to a check state.
///
/// A missing conclusion on a check that has not completed is an in-flight
/// check, so `PENDING`; a completed check with no recognizable conclusion
/// is `UNKNOWN`.
fn map_check_state(status: Option<&str>, conclusion: Option<&str>) -> CheckState {
    match conclusion.map(|c| c.to_uppercase()) {
        Some(c) if c == "SUCCESS" || c == "SKIPPED" || c == "NEUTRAL" => CheckState::Success,
        Some(c) if c == "FAILURE" || c == "TIMED_OUT" || c == "STARTUP_FAILURE" => {
            CheckState::Failure
        }
        Some(c) if c == "CANCELLED" => CheckState::Cancelled,
        Some(_) => CheckState::Unknown,
        None => {
            if status.map(|s| s.to_uppercase()) == Some("COMPLETED".to_string()) {
                CheckState::Unknown
            } else {
                CheckState::Pending
            }
        }
    }
}

/// Derive the overall state from individual checks.
pub fn derive_overall(checks: &[CiCheck]) -> CheckState {
    let any = |state: CheckState| checks.iter().any(|c| c.state == state);
    if any(CheckState::Failure) {
        CheckState::Failure
    } else if any(CheckState::Cancelled) {
        CheckState::Cancelled
    } else if any(CheckState::Pending) {
        CheckState::Pending
    } else if any(CheckState::Unknown) {
        CheckState::Unknown
    } else {
        CheckState::Success
    }
}

/// Parse `gh pr view --json statusCheckRollup` output.
pub fn parse_status_rollup(json: &str) -> Result<CiStatusSummary, String> {
    let envelope: RollupEnvelope = serde_json::from_str(json)
        .map_err(|e| format!("Failed to parse status check rollup: {}", e))?;

    let checks: Vec<CiCheck> = envelope
        .status_check_rollup
        .into_iter()
        .map(|c| CiCheck {
            state: map_check_state(c.status.as_deref(), c.conclusion.as_deref()),
            name: c.name,
            details_url: c.details_url,
        })
        .collect();

    Ok(CiStatusSummary {
        overall: derive_overall(&checks),
        checks,
    })
}

// --- Poller ---

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub terminal_confirmations: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(45 * 60),
            terminal_confirmations: DEFAULT_TERMINAL_CONFIRMATIONS,
        }
    }
}

fn transition_event(name: &str, message: &str) -> RuntimeEvent {
    RuntimeEvent::new(
        EventFamily::CiPrLifecycle,
        name,
        EventLevel::Important,
        message,
    )
}

/// Poll the host CLI until a terminal overall state has been observed
/// `terminal_confirmations` times consecutively.
///
/// Emits transition events on every overall-state change, distinguishing
/// the first observation, rerun detection (terminal back to pending), and
/// the final terminal confirmation. Honors cancellation between ticks.
pub async fn poll_until_terminal<R: ProcessRunner>(
    runner: &R,
    cwd: &Path,
    pr_url: &str,
    config: &PollConfig,
    events: &RuntimeEventBus,
    cancel: &CancellationToken,
) -> Result<CiStatusSummary, EngineError> {
    let deadline = tokio::time::Instant::now() + config.timeout;
    let mut previous: Option<CheckState> = None;
    let mut confirmations: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::State("CI polling cancelled".to_string()));
        }

        let request = ProcessRequest::new(
            "gh",
            &["pr", "view", pr_url, "--json", "statusCheckRollup"],
            cwd,
        );
        let output = runner.run(request).await?;
        let summary = parse_status_rollup(&output.stdout).map_err(EngineError::State)?;
        let overall = summary.overall;

        match previous {
            None => {
                events.publish(transition_event(
                    "ci.poll.first-observation",
                    &format!("CI overall state: {}", overall),
                ));
            }
            Some(last) if last != overall => {
                if last.is_terminal() && overall == CheckState::Pending {
                    events.publish(transition_event(
                        "ci.poll.rerun-detected",
                        &format!("CI went {} -> {} (rerun in flight)", last, overall),
                    ));
                } else {
                    events.publish(transition_event(
                        "ci.poll.state-change",
                        &format!("CI went {} -> {}", last, overall),
                    ));
                }
            }
            Some(_) => {}
        }

        if overall.is_terminal() {
            confirmations = if previous == Some(overall) {
                confirmations + 1
            } else {
                1
            };
            log_debug!(
                "[ci-poll] Terminal {} confirmation {}/{}",
                overall,
                confirmations,
                config.terminal_confirmations
            );
            if confirmations >= config.terminal_confirmations {
                events.publish(transition_event(
                    "ci.poll.terminal-confirmed",
                    &format!("CI settled on {}", overall),
                ));
                return Ok(summary);
            }
        } else {
            confirmations = 0;
        }

        previous = Some(overall);

        if tokio::time::Instant::now() + config.interval > deadline {
            return Err(EngineError::State(format!(
                "CI poll timed out after {:?} (last overall: {})",
                config.timeout, overall
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EngineError::State("CI polling cancelled".to_string()));
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

// --- Check mapper ---

/// Normalize a check name for titles and dedup keys: lowercase, separators
/// to spaces, whitespace collapsed.
pub fn normalize_check_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c == '-' || c == '_' || c == '/' {
                ' '
            } else {
                c
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A targeted fix task derived from a blocking check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiFixTaskSpec {
    pub title: String,
    pub description: String,
}

/// Outcome of one mapping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingReport {
    pub created: Vec<CiFixTaskSpec>,
    pub skipped_existing: Vec<String>,
}

impl MappingReport {
    /// Context line persisted onto the phase.
    pub fn context_line(&self) -> String {
        format!(
            "CI_FIX mapping: created={}, skipped_existing={}",
            self.created.len(),
            self.skipped_existing.len()
        )
    }
}

fn fix_task_description(pr_url: &str, check: &CiCheck, normalized: &str) -> String {
    let details = check
        .details_url
        .as_deref()
        .unwrap_or("(no details URL reported)");
    format!(
        "Remote CI reported a blocking check on {pr_url}.\n\n\
        Check: {name}\n\
        State: {state}\n\
        Details: {details}\n\n\
        Next action: open the details page, reproduce the '{normalized}' \
        failure locally, fix it, and commit.",
        pr_url = pr_url,
        name = check.name,
        state = check.state,
        details = details,
        normalized = normalized,
    )
}

/// Derive targeted `CI_FIX` tasks from a status summary.
///
/// Blocking checks are sorted by (normalized name, state, details URL) so
/// mapping is order-stable; duplicates within the pass collapse on the
/// normalized name; checks that already have a live `CI_FIX` task with the
/// same title are recorded as skipped. A terminal-non-success summary with
/// zero blocking checks yields one fallback pipeline task. The fan-out cap
/// bounds how many new tasks one pass may create.
pub fn map_checks_to_fix_tasks(
    summary: &CiStatusSummary,
    existing_tasks: &[Task],
    pr_url: &str,
    fan_out_cap: u32,
) -> Result<MappingReport, EngineError> {
    let mut blocking: Vec<&CiCheck> = summary
        .checks
        .iter()
        .filter(|c| c.state.is_blocking())
        .collect();
    blocking.sort_by(|a, b| {
        (normalize_check_name(&a.name), a.state, &a.details_url).cmp(&(
            normalize_check_name(&b.name),
            b.state,
            &b.details_url,
        ))
    });

    let existing_ci_fix_titles: HashSet<&str> = existing_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::CiFix)
        .map(|t| t.title.as_str())
        .collect();

    let mut report = MappingReport::default();
    let mut seen_names: HashSet<String> = HashSet::new();

    for check in blocking {
        let normalized = normalize_check_name(&check.name);
        if !seen_names.insert(normalized.clone()) {
            continue;
        }
        let title = format!("{}{}", CI_FIX_TITLE_PREFIX, normalized);
        if existing_ci_fix_titles.contains(title.as_str()) {
            report.skipped_existing.push(title);
            continue;
        }
        report.created.push(CiFixTaskSpec {
            description: fix_task_description(pr_url, check, &normalized),
            title,
        });
    }

    if report.created.is_empty()
        && report.skipped_existing.is_empty()
        && summary.overall.is_terminal()
        && summary.overall != CheckState::Success
    {
        let title = format!("{}CI pipeline ({})", CI_FIX_TITLE_PREFIX, summary.overall);
        if existing_ci_fix_titles.contains(title.as_str()) {
            report.skipped_existing.push(title);
        } else {
            report.created.push(CiFixTaskSpec {
                description: format!(
                    "Remote CI for {} ended {} without reporting an individual \
                    blocking check.\n\nNext action: open the PR checks page and \
                    inspect the pipeline run directly.",
                    pr_url, summary.overall
                ),
                title,
            });
        }
    }

    if report.created.len() as u32 > fan_out_cap {
        return Err(EngineError::FanOutCapExceeded(fan_out_cap));
    }

    if !report.created.is_empty() {
        log_info!(
            "[ci-map] {} (titles: {})",
            report.context_line(),
            report
                .created
                .iter()
                .map(|t| t.title.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    Ok(report)
}

// --- Fix-task chain depth ---

/// A task that belongs to a fix cascade, whatever its current status.
pub fn is_fix_task(task: &Task) -> bool {
    task.title.starts_with(CI_FIX_TITLE_PREFIX) || task.title.starts_with(TESTER_FIX_TITLE_PREFIX)
}

fn chain_depth(tasks: &[Task], task_id: Uuid, visited: &mut HashSet<Uuid>) -> u32 {
    if !visited.insert(task_id) {
        return 0;
    }
    let Some(task) = tasks.iter().find(|t| t.id == task_id) else {
        return 0;
    };
    if !is_fix_task(task) {
        return 0;
    }
    let parent = task
        .dependencies
        .iter()
        .map(|dep| chain_depth(tasks, *dep, visited))
        .max()
        .unwrap_or(0);
    1 + parent
}

/// Depth a new fix task would have, given its dependencies.
pub fn proposed_fix_task_depth(tasks: &[Task], dependencies: &[Uuid]) -> u32 {
    let parent = dependencies
        .iter()
        .map(|dep| chain_depth(tasks, *dep, &mut HashSet::new()))
        .max()
        .unwrap_or(0);
    1 + parent
}

/// Enforce the cascade depth cap before creating a new fix task.
pub fn check_depth_cap(
    tasks: &[Task],
    dependencies: &[Uuid],
    max_depth: u32,
) -> Result<(), EngineError> {
    if proposed_fix_task_depth(tasks, dependencies) > max_depth {
        return Err(EngineError::DepthCapExceeded(max_depth));
    }
    Ok(())
}
