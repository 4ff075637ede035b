use std::path::Path;
use std::time::Duration;

use uuid::Uuid;

use crate::log_info;
use crate::process::{ProcessExecutionError, ProcessRequest, ProcessRunner};
use crate::types::Task;

/// Captured test output is truncated past this many characters.
pub const MAX_TEST_OUTPUT_CHARS: usize = 4000;

/// Everything the runner needs to create a targeted fix task. The caller
/// owns deduplication and the depth cap before actually creating it.
#[derive(Debug, Clone, PartialEq)]
pub struct FixTaskSpec {
    pub title: String,
    pub description: String,
    pub dependencies: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TesterOutcome {
    Passed { output: String },
    Skipped,
    Failed { fix_task: FixTaskSpec },
}

/// Resolve the test command: the configured one wins; otherwise probe the
/// working directory: `package.json` means `npm test`, `Makefile` means
/// `make test`; nothing recognizable means the tester is skipped.
pub fn detect_test_command(
    cwd: &Path,
    configured: Option<(&str, &[String])>,
) -> Option<(String, Vec<String>)> {
    if let Some((command, args)) = configured {
        return Some((command.to_string(), args.to_vec()));
    }
    if cwd.join("package.json").is_file() {
        return Some(("npm".to_string(), vec!["test".to_string()]));
    }
    if cwd.join("Makefile").is_file() {
        return Some(("make".to_string(), vec!["test".to_string()]));
    }
    None
}

/// Truncate output to the cap. Output at exactly the cap is left alone;
/// one character past it gets cut and marked.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let truncated: String = output.chars().take(max_chars).collect();
    format!("{}\n[truncated]", truncated)
}

/// Build the deterministic fix task for a test failure.
pub fn derive_fix_task(
    trigger: &Task,
    command_line: &str,
    error: &str,
    stdout: &str,
    stderr: &str,
) -> FixTaskSpec {
    let combined = format!("{}\n{}", stdout, stderr);
    let description = format!(
        "Tests failed after completing '{trigger}'.\n\n\
        Command: {command}\n\
        Error: {error}\n\n\
        Output:\n{output}\n\n\
        Fix the failing tests without weakening them, then commit.",
        trigger = trigger.title,
        command = command_line,
        error = error,
        output = truncate_output(combined.trim(), MAX_TEST_OUTPUT_CHARS),
    );

    FixTaskSpec {
        title: format!("Fix tests after {}", trigger.title),
        description,
        dependencies: vec![trigger.id],
    }
}

/// Run the configured (or detected) test command after a completed task.
pub async fn run_tester<R: ProcessRunner>(
    runner: &R,
    cwd: &Path,
    configured: Option<(&str, &[String])>,
    timeout: Duration,
    trigger: &Task,
) -> Result<TesterOutcome, String> {
    let Some((command, args)) = detect_test_command(cwd, configured) else {
        log_info!("[tester] No test command configured or detected, skipping");
        return Ok(TesterOutcome::Skipped);
    };

    let arg_refs: Vec<&str> = args.iter().map(|a| a.as_str()).collect();
    let mut request = ProcessRequest::new(&command, &arg_refs, cwd);
    request.timeout = Some(timeout);
    let command_line = request.command_line();

    log_info!("[tester] Running `{}`", command_line);

    match runner.run(request).await {
        Ok(output) => Ok(TesterOutcome::Passed {
            output: output.stdout,
        }),
        Err(ProcessExecutionError::NonZeroExit { output, .. }) => {
            let error = format!("exit code {}", output.exit_code);
            Ok(TesterOutcome::Failed {
                fix_task: derive_fix_task(
                    trigger,
                    &command_line,
                    &error,
                    &output.stdout,
                    &output.stderr,
                ),
            })
        }
        Err(ProcessExecutionError::Timeout {
            timeout, partial, ..
        }) => {
            let error = format!("timed out after {:?}", timeout);
            Ok(TesterOutcome::Failed {
                fix_task: derive_fix_task(
                    trigger,
                    &command_line,
                    &error,
                    &partial.stdout,
                    &partial.stderr,
                ),
            })
        }
        Err(e) => Err(format!("Tester failed to run `{}`: {}", command_line, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ScriptedProcessRunner, ScriptedResponse};
    use tempfile::TempDir;

    #[test]
    fn configured_command_wins_over_probes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let args = vec!["test".to_string(), "--workspace".to_string()];
        let detected = detect_test_command(dir.path(), Some(("cargo", &args))).unwrap();
        assert_eq!(detected.0, "cargo");
        assert_eq!(detected.1, args);
    }

    #[test]
    fn probes_package_json_then_makefile() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_test_command(dir.path(), None), None);

        std::fs::write(dir.path().join("Makefile"), "test:\n").unwrap();
        assert_eq!(
            detect_test_command(dir.path(), None),
            Some(("make".to_string(), vec!["test".to_string()]))
        );

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(
            detect_test_command(dir.path(), None),
            Some(("npm".to_string(), vec!["test".to_string()]))
        );
    }

    #[test]
    fn truncation_boundary_is_exact() {
        let at_cap = "x".repeat(MAX_TEST_OUTPUT_CHARS);
        assert_eq!(truncate_output(&at_cap, MAX_TEST_OUTPUT_CHARS), at_cap);
        assert!(!truncate_output(&at_cap, MAX_TEST_OUTPUT_CHARS).contains("[truncated]"));

        let past_cap = "x".repeat(MAX_TEST_OUTPUT_CHARS + 1);
        let truncated = truncate_output(&past_cap, MAX_TEST_OUTPUT_CHARS);
        assert!(truncated.ends_with("[truncated]"));
    }

    #[test]
    fn fix_task_shape_is_deterministic() {
        let trigger = Task::new("add login form", "");
        let spec = derive_fix_task(&trigger, "npm test", "exit code 1", "1 failing", "");
        assert_eq!(spec.title, "Fix tests after add login form");
        assert!(spec.description.contains("npm test"));
        assert!(spec.description.contains("exit code 1"));
        assert!(spec.description.contains("1 failing"));
        assert_eq!(spec.dependencies, vec![trigger.id]);
    }

    #[tokio::test]
    async fn failing_run_produces_fix_task() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedProcessRunner::new();
        runner.script(
            "npm",
            &["test"],
            vec![ScriptedResponse::fail(1, "assertion failed")],
        );
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let trigger = Task::new("wire up api", "");
        let outcome = run_tester(
            &runner,
            dir.path(),
            None,
            Duration::from_secs(30),
            &trigger,
        )
        .await
        .unwrap();

        match outcome {
            TesterOutcome::Failed { fix_task } => {
                assert_eq!(fix_task.title, "Fix tests after wire up api");
                assert!(fix_task.description.contains("assertion failed"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn passing_run_reports_output() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedProcessRunner::new();
        runner.script("make", &["test"], vec![ScriptedResponse::ok("ok: 12 tests")]);
        std::fs::write(dir.path().join("Makefile"), "test:\n").unwrap();

        let trigger = Task::new("t", "");
        let outcome = run_tester(
            &runner,
            dir.path(),
            None,
            Duration::from_secs(30),
            &trigger,
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            TesterOutcome::Passed {
                output: "ok: 12 tests".to_string()
            }
        );
    }
}
