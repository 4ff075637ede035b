use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::process::{ProcessExecutionError, ProcessOutput, ProcessRequest, ProcessRunner};
use crate::types::AdapterId;

/// Static description of one external CLI: how to reach it and which flags
/// keep it non-interactive.
#[derive(Debug, Clone)]
pub struct AdapterDefinition {
    pub default_command: &'static str,
    pub display_name: &'static str,
    pub required_base_args: &'static [&'static str],
    pub forbidden_args: &'static [&'static str],
    pub bypass_flag: Option<&'static str>,
    pub install_hint: &'static str,
}

/// The per-adapter contract matrix. Required args are the non-interactive
/// batch flags; forbidden args would drop the CLI into an interactive
/// session; the bypass flag skips the CLI's own approval prompts and is
/// only added on explicit opt-in.
pub fn definition(id: AdapterId) -> AdapterDefinition {
    match id {
        AdapterId::Claude => AdapterDefinition {
            default_command: "claude",
            display_name: "Claude CLI",
            required_base_args: &["--print"],
            forbidden_args: &["--ide", "--resume-interactive"],
            bypass_flag: Some("--dangerously-skip-permissions"),
            install_hint: "Install: https://docs.anthropic.com/en/docs/claude-code",
        },
        AdapterId::Codex => AdapterDefinition {
            default_command: "codex",
            display_name: "Codex CLI",
            required_base_args: &["exec"],
            forbidden_args: &["--interactive"],
            bypass_flag: Some("--dangerously-bypass-approvals-and-sandbox"),
            install_hint: "Install: https://github.com/openai/codex",
        },
        AdapterId::Gemini => AdapterDefinition {
            default_command: "gemini",
            display_name: "Gemini CLI",
            required_base_args: &["--batch"],
            forbidden_args: &["--prompt-interactive"],
            bypass_flag: Some("--yolo"),
            install_hint: "Install: https://github.com/google-gemini/gemini-cli",
        },
        AdapterId::MockCli => AdapterDefinition {
            default_command: "mock-cli",
            display_name: "Mock CLI",
            required_base_args: &["--non-interactive"],
            forbidden_args: &["--interactive"],
            bypass_flag: None,
            install_hint: "mock-cli is a test-only adapter",
        },
    }
}

/// Violation of the non-interactive argument policy.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InteractiveModeError {
    #[error("{adapter}: required non-interactive arg '{arg}' is missing")]
    MissingRequiredArg { adapter: AdapterId, arg: String },

    #[error("{adapter}: forbidden interactive arg '{arg}' is present")]
    ForbiddenArgPresent { adapter: AdapterId, arg: String },

    #[error("{adapter}: bypass flag '{flag}' present without explicit opt-in")]
    BypassNotOptedIn { adapter: AdapterId, flag: String },

    #[error("{adapter}: bypass flag '{flag}' must appear exactly once, found {count}")]
    BypassFlagCount {
        adapter: AdapterId,
        flag: String,
        count: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Interactive(#[from] InteractiveModeError),

    #[error(transparent)]
    Process(#[from] ProcessExecutionError),
}

/// The concrete argv/stdin shape for one adapter invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// Build the argv/stdin plan for an adapter invocation. Pure.
///
/// Conventions per adapter:
/// - Codex reads the prompt from stdin via a literal `"-"` positional and
///   resumes with an `exec resume --last` subcommand spliced before the
///   remaining args.
/// - Claude takes the prompt as a positional after `--print` and resumes
///   with `--continue`.
/// - Gemini takes an empty `--prompt` flag with the real prompt on stdin
///   and resumes with `--resume`.
/// - The mock adapter takes the prompt on stdin with no extra args.
pub fn build_execution_plan(
    id: AdapterId,
    base_args: &[String],
    prompt: &str,
    resume: bool,
) -> ExecutionPlan {
    match id {
        AdapterId::Codex => {
            let mut args: Vec<String> = if resume {
                let after_exec: Vec<String> = base_args
                    .iter()
                    .skip_while(|a| a.as_str() == "exec")
                    .cloned()
                    .collect();
                let mut v = vec![
                    "exec".to_string(),
                    "resume".to_string(),
                    "--last".to_string(),
                ];
                v.extend(after_exec);
                v
            } else {
                base_args.to_vec()
            };
            args.push("-".to_string());
            ExecutionPlan {
                args,
                stdin: Some(prompt.to_string()),
            }
        }
        AdapterId::Claude => {
            let mut args = base_args.to_vec();
            if resume {
                args.push("--continue".to_string());
            }
            args.push(prompt.to_string());
            ExecutionPlan { args, stdin: None }
        }
        AdapterId::Gemini => {
            let mut args = base_args.to_vec();
            if resume {
                args.push("--resume".to_string());
            }
            args.push("--prompt".to_string());
            args.push(String::new());
            ExecutionPlan {
                args,
                stdin: Some(prompt.to_string()),
            }
        }
        AdapterId::MockCli => {
            let mut args = base_args.to_vec();
            if resume {
                args.push("--resume".to_string());
            }
            ExecutionPlan {
                args,
                stdin: Some(prompt.to_string()),
            }
        }
    }
}

/// A constructed adapter: command plus the base args every invocation
/// carries. `base_args` is deliberately public; the policy is re-validated
/// before every run, not only at construction.
#[derive(Debug, Clone)]
pub struct WorkerAdapter {
    pub id: AdapterId,
    pub command: String,
    pub base_args: Vec<String>,
    bypass_enabled: bool,
}

impl WorkerAdapter {
    /// Construct an adapter with its required non-interactive base args.
    pub fn new(id: AdapterId) -> Result<Self, InteractiveModeError> {
        Self::with_options(id, false, &[])
    }

    /// Construct with optional bypass opt-in and extra args (e.g. a model
    /// selection flag).
    pub fn with_options(
        id: AdapterId,
        bypass: bool,
        extra_args: &[String],
    ) -> Result<Self, InteractiveModeError> {
        let def = definition(id);
        let mut base_args: Vec<String> =
            def.required_base_args.iter().map(|a| a.to_string()).collect();
        if bypass {
            if let Some(flag) = def.bypass_flag {
                base_args.push(flag.to_string());
            }
        }
        base_args.extend(extra_args.iter().cloned());

        let adapter = Self {
            id,
            command: def.default_command.to_string(),
            base_args,
            bypass_enabled: bypass,
        };
        adapter.validate()?;
        Ok(adapter)
    }

    /// Re-check the non-interactive invariants against the current args.
    ///
    /// Runs at construction and again before every `run()`, so args mutated
    /// in between still fail before any subprocess is spawned.
    pub fn validate(&self) -> Result<(), InteractiveModeError> {
        let def = definition(self.id);

        for required in def.required_base_args {
            if !self.base_args.iter().any(|a| a == required) {
                return Err(InteractiveModeError::MissingRequiredArg {
                    adapter: self.id,
                    arg: required.to_string(),
                });
            }
        }

        for forbidden in def.forbidden_args {
            if self.base_args.iter().any(|a| a == forbidden) {
                return Err(InteractiveModeError::ForbiddenArgPresent {
                    adapter: self.id,
                    arg: forbidden.to_string(),
                });
            }
        }

        if let Some(flag) = def.bypass_flag {
            let count = self.base_args.iter().filter(|a| a.as_str() == flag).count();
            if self.bypass_enabled {
                if count != 1 {
                    return Err(InteractiveModeError::BypassFlagCount {
                        adapter: self.id,
                        flag: flag.to_string(),
                        count,
                    });
                }
            } else if count > 0 {
                return Err(InteractiveModeError::BypassNotOptedIn {
                    adapter: self.id,
                    flag: flag.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Build the invocation plan for a prompt. Validates first.
    pub fn plan(&self, prompt: &str, resume: bool) -> Result<ExecutionPlan, InteractiveModeError> {
        self.validate()?;
        Ok(build_execution_plan(self.id, &self.base_args, prompt, resume))
    }

    /// Run the adapter once, non-interactively.
    pub async fn run(
        &self,
        runner: &impl ProcessRunner,
        cwd: &Path,
        prompt: &str,
        resume: bool,
        timeout: Duration,
    ) -> Result<ProcessOutput, AdapterError> {
        let plan = self.plan(prompt, resume)?;
        let request = ProcessRequest {
            command: self.command.clone(),
            args: plan.args,
            cwd: cwd.to_path_buf(),
            timeout: Some(timeout),
            stdin: plan.stdin,
        };
        Ok(runner.run(request).await?)
    }

    /// Verify the CLI binary responds to `--version`.
    pub async fn verify_available(
        &self,
        runner: &impl ProcessRunner,
        cwd: &Path,
    ) -> Result<(), String> {
        let def = definition(self.id);
        let request = ProcessRequest::new(&self.command, &["--version"], cwd);
        runner.run(request).await.map_err(|e| {
            format!(
                "{} not found or not working. {} ({})",
                def.display_name, def.install_hint, e
            )
        })?;
        Ok(())
    }
}

/// Typed constructors for every supported external CLI.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<AdapterId, WorkerAdapter>,
}

impl AdapterRegistry {
    /// Build a registry for all known adapters. `bypass_optins` lists the
    /// adapters whose approval-bypass flag the operator explicitly enabled.
    pub fn with_defaults(bypass_optins: &[AdapterId]) -> Result<Self, InteractiveModeError> {
        let mut adapters = HashMap::new();
        for id in [
            AdapterId::Claude,
            AdapterId::Codex,
            AdapterId::Gemini,
            AdapterId::MockCli,
        ] {
            let bypass = bypass_optins.contains(&id);
            adapters.insert(id, WorkerAdapter::with_options(id, bypass, &[])?);
        }
        Ok(Self { adapters })
    }

    pub fn get(&self, id: AdapterId) -> Result<&WorkerAdapter, String> {
        self.adapters
            .get(&id)
            .ok_or_else(|| format!("Adapter '{}' is not registered", id))
    }

    pub fn get_mut(&mut self, id: AdapterId) -> Option<&mut WorkerAdapter> {
        self.adapters.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_plan_reads_prompt_from_stdin() {
        let base = vec!["exec".to_string()];
        let plan = build_execution_plan(AdapterId::Codex, &base, "do the thing", false);
        assert_eq!(plan.args, vec!["exec", "-"]);
        assert_eq!(plan.stdin.as_deref(), Some("do the thing"));
    }

    #[test]
    fn codex_resume_plan_splices_resume_subcommand() {
        let base = vec!["exec".to_string(), "--sandbox".to_string()];
        let plan = build_execution_plan(AdapterId::Codex, &base, "continue", true);
        assert_eq!(plan.args, vec!["exec", "resume", "--last", "--sandbox", "-"]);
        assert_eq!(plan.stdin.as_deref(), Some("continue"));
    }

    #[test]
    fn claude_plan_appends_continue_flag_on_resume() {
        let base = vec!["--print".to_string()];
        let plan = build_execution_plan(AdapterId::Claude, &base, "hi", true);
        assert_eq!(plan.args, vec!["--print", "--continue", "hi"]);
        assert!(plan.stdin.is_none());
    }

    #[test]
    fn gemini_plan_passes_empty_prompt_flag_and_stdin() {
        let base = vec!["--batch".to_string()];
        let plan = build_execution_plan(AdapterId::Gemini, &base, "review this", false);
        assert_eq!(plan.args, vec!["--batch", "--prompt", ""]);
        assert_eq!(plan.stdin.as_deref(), Some("review this"));
    }

    #[test]
    fn tampered_base_args_fail_validation_before_spawn() {
        let mut adapter = WorkerAdapter::new(AdapterId::MockCli).unwrap();
        adapter.base_args.push("--interactive".to_string());
        let err = adapter.plan("x", false).unwrap_err();
        assert!(matches!(
            err,
            InteractiveModeError::ForbiddenArgPresent { .. }
        ));

        let mut adapter = WorkerAdapter::new(AdapterId::MockCli).unwrap();
        adapter.base_args.clear();
        let err = adapter.plan("x", false).unwrap_err();
        assert!(matches!(err, InteractiveModeError::MissingRequiredArg { .. }));
    }

    #[test]
    fn bypass_flag_requires_opt_in_and_appears_once() {
        // Present without opt-in
        let mut adapter = WorkerAdapter::new(AdapterId::Claude).unwrap();
        adapter
            .base_args
            .push("--dangerously-skip-permissions".to_string());
        assert!(matches!(
            adapter.validate().unwrap_err(),
            InteractiveModeError::BypassNotOptedIn { .. }
        ));

        // Opted in: exactly once even with extra args
        let adapter =
            WorkerAdapter::with_options(AdapterId::Claude, true, &["--model".to_string()]).unwrap();
        let count = adapter
            .base_args
            .iter()
            .filter(|a| a.as_str() == "--dangerously-skip-permissions")
            .count();
        assert_eq!(count, 1);

        // Duplicated after opt-in
        let mut adapter = WorkerAdapter::with_options(AdapterId::Claude, true, &[]).unwrap();
        adapter
            .base_args
            .push("--dangerously-skip-permissions".to_string());
        assert!(matches!(
            adapter.validate().unwrap_err(),
            InteractiveModeError::BypassFlagCount { count: 2, .. }
        ));
    }
}
