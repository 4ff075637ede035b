use std::path::Path;

use serde::Deserialize;

use crate::ci::TemplateMapping;
use crate::types::{AdapterId, Role};

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IxadoConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub tester: TesterConfig,
    pub ci: CiConfig,
    pub adapter: AdapterConfig,
    pub authorization: AuthorizationConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "project".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_recovery_attempts: u32,
    pub task_timeout_minutes: u32,
    /// Seconds to count down between tasks in auto mode. Zero advances
    /// immediately.
    pub auto_advance_seconds: u32,
    /// Wait for an explicit advance signal between tasks instead of the
    /// countdown.
    pub manual_advance: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 2,
            task_timeout_minutes: 30,
            auto_advance_seconds: 0,
            manual_advance: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TesterConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_minutes: u32,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_minutes: 15,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CiConfig {
    pub enabled: bool,
    pub base_branch: String,
    pub poll_interval_ms: u64,
    pub poll_timeout_minutes: u32,
    pub terminal_confirmations: u32,
    pub fix_task_fan_out_cap: u32,
    pub ci_fix_max_depth: u32,
    pub draft: bool,
    pub mark_ready_on_approval: bool,
    pub max_review_retries: u32,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub template_mappings: Vec<TemplateMapping>,
    pub default_template: Option<String>,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_branch: "main".to_string(),
            poll_interval_ms: 30_000,
            poll_timeout_minutes: 45,
            terminal_confirmations: 2,
            fix_task_fan_out_cap: 5,
            ci_fix_max_depth: 3,
            draft: false,
            mark_ready_on_approval: true,
            max_review_retries: 2,
            labels: Vec::new(),
            assignees: Vec::new(),
            template_mappings: Vec::new(),
            default_template: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    pub default: AdapterId,
    pub model: Option<String>,
    /// Adapters whose approval-bypass flag the operator explicitly enables.
    pub bypass_permissions: Vec<AdapterId>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            default: AdapterId::Claude,
            model: None,
            bypass_permissions: Vec::new(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub role: Option<Role>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            role: Some(Role::Owner),
        }
    }
}

/// Trim a configured model string; an empty value means "no override".
pub fn normalize_adapter_config(config: &mut IxadoConfig) {
    if let Some(ref model) = config.adapter.model {
        let trimmed = model.trim();
        if trimmed.is_empty() {
            config.adapter.model = None;
        } else {
            config.adapter.model = Some(trimmed.to_string());
        }
    }
}

pub fn validate(config: &IxadoConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.project.name.trim().is_empty() {
        errors.push("project.name must not be empty".to_string());
    }

    if config.execution.max_recovery_attempts < 1 {
        errors.push("execution.max_recovery_attempts must be >= 1".to_string());
    }

    if config.execution.task_timeout_minutes < 1 {
        errors.push("execution.task_timeout_minutes must be >= 1".to_string());
    }

    if config.ci.enabled {
        if config.ci.base_branch.trim().is_empty() {
            errors.push("ci.base_branch must not be empty when ci is enabled".to_string());
        }
        if config.ci.poll_interval_ms < 1 {
            errors.push("ci.poll_interval_ms must be >= 1".to_string());
        }
        if config.ci.terminal_confirmations < 1 {
            errors.push("ci.terminal_confirmations must be >= 1".to_string());
        }
        if config.ci.fix_task_fan_out_cap < 1 {
            errors.push("ci.fix_task_fan_out_cap must be >= 1".to_string());
        }
        if config.ci.ci_fix_max_depth < 1 {
            errors.push("ci.ci_fix_max_depth must be >= 1".to_string());
        }
    }

    if let Some(ref model) = config.adapter.model {
        let is_valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
        if !is_valid {
            errors.push(
                "adapter.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                    .to_string(),
            );
        } else if model.starts_with('-') {
            errors.push(
                "adapter.model must not start with '-' (flag-like values are rejected)".to_string(),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/ixado.toml`.
///
/// An explicit path MUST exist; the fallback returns defaults when the file
/// is missing.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<IxadoConfig, String> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            load_config_at(path)
        }
        None => load_config(project_root),
    }
}

pub fn load_config(project_root: &Path) -> Result<IxadoConfig, String> {
    let config_path = project_root.join("ixado.toml");
    if !config_path.exists() {
        return Ok(IxadoConfig::default());
    }
    load_config_at(&config_path)
}

fn load_config_at(path: &Path) -> Result<IxadoConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: IxadoConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    normalize_adapter_config(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(validate(&IxadoConfig::default()).is_ok());
    }

    #[test]
    fn parses_full_config() {
        let toml = r###"
            [project]
            name = "widgets"

            [execution]
            max_recovery_attempts = 3
            task_timeout_minutes = 20

            [tester]
            command = "cargo"
            args = ["test", "--workspace"]

            [ci]
            enabled = true
            base_branch = "develop"
            fix_task_fan_out_cap = 4
            ci_fix_max_depth = 2

            [[ci.template_mappings]]
            branch_prefix = "feature/"
            template = "## Feature"

            [adapter]
            default = "codex"
            model = "gpt-5.2-codex"
            bypass_permissions = ["codex"]

            [authorization]
            role = "operator"
        "###;
        let config: IxadoConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.project.name, "widgets");
        assert_eq!(config.adapter.default, AdapterId::Codex);
        assert_eq!(config.adapter.bypass_permissions, vec![AdapterId::Codex]);
        assert_eq!(config.authorization.role, Some(Role::Operator));
        assert_eq!(config.ci.base_branch, "develop");
        assert_eq!(config.ci.template_mappings.len(), 1);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn flag_like_model_is_rejected() {
        let mut config = IxadoConfig::default();
        config.adapter.model = Some("--dangerous".to_string());
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("adapter.model")));
    }

    #[test]
    fn blank_model_normalizes_to_none() {
        let mut config = IxadoConfig::default();
        config.adapter.model = Some("   ".to_string());
        normalize_adapter_config(&mut config);
        assert_eq!(config.adapter.model, None);
    }

    #[test]
    fn zero_caps_fail_validation_when_ci_enabled() {
        let mut config = IxadoConfig::default();
        config.ci.fix_task_fan_out_cap = 0;
        config.ci.terminal_confirmations = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
