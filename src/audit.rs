use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::AuthDecision;
use crate::types::Role;

/// One append-only audit entry. One JSON object per line.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub action: String,
    pub target: String,
    pub decision: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_hash: Option<String>,
}

/// Short hex digest of a command line for audit correlation.
pub fn command_digest(command_line: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    command_line.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Append-only audit log under the project runtime directory.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// `runtime_dir` is the `.ixado/` directory; the log lives at
    /// `audit.log` inside it.
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            path: runtime_dir.join("audit.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Creates the file and parent directory if missing.
    pub fn record(&self, entry: &AuditEntry) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| format!("Failed to serialize audit entry: {}", e))?;

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| format!("Failed to open audit log {}: {}", self.path.display(), e))?;

        writeln!(file, "{}", line)
            .map_err(|e| format!("Failed to write audit log {}: {}", self.path.display(), e))?;

        Ok(())
    }

    /// Record an authorization decision for a (possibly privileged) action.
    pub fn record_decision(
        &self,
        actor: &str,
        role: Option<Role>,
        action: &str,
        target: &str,
        decision: &AuthDecision,
        command_line: Option<&str>,
    ) -> Result<(), String> {
        self.record(&AuditEntry {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            role,
            action: action.to_string(),
            target: target.to_string(),
            decision: decision.label().to_string(),
            reason: decision.reason_string(),
            command_hash: command_line.map(command_digest),
        })
    }

    /// Record a non-authorization checkpoint (e.g. recovery progress).
    pub fn record_event(&self, actor: &str, action: &str, target: &str) -> Result<(), String> {
        self.record(&AuditEntry {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            role: None,
            action: action.to_string(),
            target: target.to_string(),
            decision: "event".to_string(),
            reason: String::new(),
            command_hash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn digest_is_stable_and_short() {
        let a = command_digest("git push --set-upstream origin main");
        let b = command_digest("git push --set-upstream origin main");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, command_digest("git push origin other"));
    }

    #[test]
    fn entries_append_one_json_line_each() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.record_event("runner", "recovery:detected", "phase-1")
            .unwrap();
        log.record_event("runner", "recovery:adapter-invoked", "phase-1")
            .unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, "recovery:detected");
        assert_eq!(first.decision, "event");
    }
}
