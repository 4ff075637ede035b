use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process::{ProcessExecutionError, ProcessRequest, ProcessRunner};

/// A single entry from `git status --porcelain` output.
///
/// Porcelain v1 uses ASCII for the two-character status code and the space
/// separator, so byte-offset slicing at 0..2 and 3.. is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character status code (e.g., "M ", "??", "A ")
    pub status_code: String,
    /// The file path
    pub path: String,
}

/// Git operations the engine needs, expressed over the process-runner
/// boundary so tests can script them.
#[derive(Debug, Clone)]
pub struct GitClient<R: ProcessRunner> {
    runner: Arc<R>,
    cwd: PathBuf,
}

impl<R: ProcessRunner> GitClient<R> {
    pub fn new(runner: Arc<R>, cwd: &Path) -> Self {
        Self {
            runner,
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, String> {
        let request = ProcessRequest::new("git", args, &self.cwd);
        let output = self.runner.run(request).await.map_err(|e| {
            format!("git {} failed: {}", args.first().unwrap_or(&""), e)
        })?;
        Ok(output.stdout)
    }

    /// Run git where a non-zero exit is a negative answer, not an error.
    async fn run_git_check(&self, args: &[&str]) -> Result<bool, String> {
        let request = ProcessRequest::new("git", args, &self.cwd);
        match self.runner.run(request).await {
            Ok(_) => Ok(true),
            Err(ProcessExecutionError::NonZeroExit { .. }) => Ok(false),
            Err(e) => Err(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                e
            )),
        }
    }

    /// Parse `git status --porcelain` output into structured entries.
    pub async fn status(&self) -> Result<Vec<StatusEntry>, String> {
        let output = self.run_git(&["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&output))
    }

    /// Working tree has no modified, staged, or untracked entries.
    pub async fn is_clean(&self) -> Result<bool, String> {
        Ok(self.status().await?.is_empty())
    }

    pub async fn current_branch(&self) -> Result<String, String> {
        let output = self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(output.trim().to_string())
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool, String> {
        self.run_git_check(&[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/heads/{}", name),
        ])
        .await
    }

    pub async fn checkout(&self, name: &str) -> Result<(), String> {
        self.run_git(&["checkout", name]).await?;
        Ok(())
    }

    pub async fn create_branch(&self, name: &str) -> Result<(), String> {
        self.run_git(&["checkout", "-b", name]).await?;
        Ok(())
    }

    /// Stage everything, including untracked files.
    pub async fn stage_all(&self) -> Result<(), String> {
        self.run_git(&["add", "-A"]).await?;
        Ok(())
    }

    /// Whether anything is staged for commit.
    pub async fn has_staged_changes(&self) -> Result<bool, String> {
        // diff --cached --quiet exits 1 when staged changes exist
        Ok(!self.run_git_check(&["diff", "--cached", "--quiet"]).await?)
    }

    /// Commit staged changes; returns the new HEAD SHA.
    pub async fn commit(&self, message: &str) -> Result<String, String> {
        self.run_git(&["commit", "-m", message]).await?;
        self.head_sha().await
    }

    pub async fn head_sha(&self) -> Result<String, String> {
        let output = self.run_git(&["rev-parse", "HEAD"]).await?;
        Ok(output.trim().to_string())
    }

    /// Push the branch, setting its upstream.
    pub async fn push_set_upstream(&self, branch: &str) -> Result<(), String> {
        self.run_git(&["push", "--set-upstream", "origin", branch])
            .await?;
        Ok(())
    }

    /// Diff of the working branch against a base ref.
    pub async fn diff_against(&self, base: &str) -> Result<String, String> {
        self.run_git(&["diff", &format!("{}...HEAD", base)]).await
    }
}

fn parse_porcelain(output: &str) -> Vec<StatusEntry> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.len() < 3 {
                // Malformed porcelain line -- skip
                None
            } else {
                Some(StatusEntry {
                    status_code: line[..2].to_string(),
                    path: line[3..].to_string(),
                })
            }
        })
        .collect()
}
