use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::log_warn;

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

// --- Shutdown flag & child registry ---

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// insert/remove/iterate with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// SIGTERM a process group, poll for exit up to the grace period, then SIGKILL.
///
/// Blocking; callers on the async runtime wrap this in `spawn_blocking`.
fn terminate_group_blocking(pgid: Pid) {
    use nix::sys::signal::{killpg, Signal};

    if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
        return; // already gone
    }

    let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while Instant::now() < deadline {
        // Signal 0 probes group existence without delivering anything
        match killpg(pgid, None) {
            Err(nix::errno::Errno::ESRCH) => return,
            _ => std::thread::sleep(poll_interval),
        }
    }

    let _ = killpg(pgid, Signal::SIGKILL);
}

/// Kill all registered child process groups. Used on shutdown.
pub fn kill_all_children() {
    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    for pgid in pgids {
        terminate_group_blocking(pgid);
        unregister_child(pgid);
    }
}

async fn terminate_group(pgid: Pid) {
    tokio::task::spawn_blocking(move || terminate_group_blocking(pgid))
        .await
        .unwrap_or_else(|e| log_warn!("terminate_group task panicked: {}", e));
}

// --- Contract types ---

/// A subprocess invocation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl ProcessRequest {
    pub fn new(command: &str, args: &[&str], cwd: &std::path::Path) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            timeout: None,
            stdin: None,
        }
    }

    /// Full command line, for logging and audit digests.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub signal: Option<i32>,
}

/// Structured subprocess failure. Carries the partial output captured up to
/// the failure point.
#[derive(Debug, thiserror::Error)]
pub enum ProcessExecutionError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {code}: {stderr}", code = .output.exit_code, stderr = .output.stderr.trim())]
    NonZeroExit { command: String, output: ProcessOutput },

    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: Duration,
        partial: ProcessOutput,
    },

    #[error("Shutdown requested while running {command}")]
    ShutdownRequested { command: String, partial: ProcessOutput },

    #[error("I/O error running {command}: {message}")]
    Io { command: String, message: String },
}

impl ProcessExecutionError {
    /// Output captured before the failure, when any exists.
    pub fn partial_output(&self) -> Option<&ProcessOutput> {
        match self {
            ProcessExecutionError::NonZeroExit { output, .. } => Some(output),
            ProcessExecutionError::Timeout { partial, .. } => Some(partial),
            ProcessExecutionError::ShutdownRequested { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Sole boundary to the OS. Every other component consumes subprocesses
/// through this contract.
pub trait ProcessRunner: Send + Sync {
    fn run(
        &self,
        request: ProcessRequest,
    ) -> impl std::future::Future<Output = Result<ProcessOutput, ProcessExecutionError>> + Send;
}

// --- OS implementation ---

/// Real implementation spawning subprocesses in their own process group.
#[derive(Debug, Default, Clone)]
pub struct OsProcessRunner;

impl OsProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for OsProcessRunner {
    async fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, ProcessExecutionError> {
        let started = Instant::now();
        let mut cmd = tokio::process::Command::new(&request.command);
        cmd.args(&request.args);
        cmd.current_dir(&request.cwd);

        // stdin is piped only when input is provided. Null otherwise: the
        // child runs in a background process group and a terminal read
        // would stop it with SIGTTIN.
        if request.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs between fork() and exec() where only
        // async-signal-safe functions are permitted. setpgid qualifies.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| ProcessExecutionError::Spawn {
            command: request.command.clone(),
            source: e,
        })?;

        let child_pid = child.id().map(|p| p as i32).unwrap_or(0);
        let pgid = Pid::from_raw(child_pid);
        register_child(pgid);

        if let Some(input) = &request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = input.clone().into_bytes();
                // Ignore EPIPE: the child may exit without reading its input
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            }
        }

        // Readers run as tasks so partial output survives a timeout kill:
        // once the group dies the pipes close and the readers complete.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        // A day is effectively "no timeout" for any orchestrated subprocess
        let timeout = request.timeout.unwrap_or(Duration::from_secs(24 * 60 * 60));
        let wait_result = tokio::time::timeout(timeout, child.wait()).await;

        let collect = |stdout: Vec<u8>, stderr: Vec<u8>| {
            (
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            )
        };

        match wait_result {
            Err(_) => {
                terminate_group(pgid).await;
                let _ = child.wait().await;
                unregister_child(pgid);
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let (stdout, stderr) = collect(stdout, stderr);
                Err(ProcessExecutionError::Timeout {
                    command: request.command.clone(),
                    timeout,
                    partial: ProcessOutput {
                        exit_code: -1,
                        stdout,
                        stderr,
                        duration: started.elapsed(),
                        signal: None,
                    },
                })
            }
            Ok(wait_result) => {
                unregister_child(pgid);
                let status = wait_result.map_err(|e| ProcessExecutionError::Io {
                    command: request.command.clone(),
                    message: e.to_string(),
                })?;

                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let (stdout, stderr) = collect(stdout, stderr);

                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                let output = ProcessOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    duration: started.elapsed(),
                    signal,
                };

                if is_shutdown_requested() {
                    return Err(ProcessExecutionError::ShutdownRequested {
                        command: request.command.clone(),
                        partial: output,
                    });
                }

                if output.exit_code == 0 {
                    Ok(output)
                } else {
                    Err(ProcessExecutionError::NonZeroExit {
                        command: request.command.clone(),
                        output,
                    })
                }
            }
        }
    }
}

// --- Scripted implementation for tests ---

/// A canned subprocess response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

struct ScriptRule {
    command: String,
    args_prefix: Vec<String>,
    responses: std::collections::VecDeque<ScriptedResponse>,
}

/// Scripted process runner for tests.
///
/// Rules match on command name plus a leading-args prefix; the first
/// matching rule (registration order) supplies the next queued response.
/// A rule's final response repeats. Unmatched requests succeed with empty
/// output so incidental git calls in integration tests do not fail.
#[derive(Default)]
pub struct ScriptedProcessRunner {
    rules: std::sync::Mutex<Vec<ScriptRule>>,
    calls: std::sync::Mutex<Vec<ProcessRequest>>,
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a response sequence for `command` invocations whose args
    /// start with `args_prefix`.
    pub fn script(&self, command: &str, args_prefix: &[&str], responses: Vec<ScriptedResponse>) {
        let mut rules = self.rules.lock().expect("script rules poisoned");
        rules.push(ScriptRule {
            command: command.to_string(),
            args_prefix: args_prefix.iter().map(|a| a.to_string()).collect(),
            responses: responses.into(),
        });
    }

    /// All requests observed so far, in order.
    pub fn calls(&self) -> Vec<ProcessRequest> {
        self.calls.lock().expect("script calls poisoned").clone()
    }

    /// Requests for a given command name.
    pub fn calls_for(&self, command: &str) -> Vec<ProcessRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.command == command)
            .collect()
    }

    fn next_response(&self, request: &ProcessRequest) -> ScriptedResponse {
        let mut rules = self.rules.lock().expect("script rules poisoned");
        for rule in rules.iter_mut() {
            let prefix_len = rule.args_prefix.len();
            let matches = rule.command == request.command
                && request.args.len() >= prefix_len
                && request.args[..prefix_len] == rule.args_prefix[..];
            if matches {
                if rule.responses.len() > 1 {
                    return rule.responses.pop_front().expect("non-empty responses");
                }
                if let Some(last) = rule.responses.front() {
                    return last.clone();
                }
            }
        }
        ScriptedResponse::ok("")
    }
}

impl ProcessRunner for ScriptedProcessRunner {
    async fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, ProcessExecutionError> {
        let response = self.next_response(&request);
        self.calls
            .lock()
            .expect("script calls poisoned")
            .push(request.clone());

        let output = ProcessOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            duration: Duration::ZERO,
            signal: None,
        };
        if output.exit_code == 0 {
            Ok(output)
        } else {
            Err(ProcessExecutionError::NonZeroExit {
                command: request.command,
                output,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn os_runner_captures_stdout_and_exit_code() {
        let runner = OsProcessRunner::new();
        let request = ProcessRequest::new("echo", &["hello"], Path::new("."));
        let output = runner.run(request).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn os_runner_reports_non_zero_exit_with_output() {
        let runner = OsProcessRunner::new();
        let request = ProcessRequest::new("sh", &["-c", "echo partial; exit 3"], Path::new("."));
        let err = runner.run(request).await.unwrap_err();
        match err {
            ProcessExecutionError::NonZeroExit { output, .. } => {
                assert_eq!(output.exit_code, 3);
                assert_eq!(output.stdout.trim(), "partial");
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn os_runner_passes_stdin() {
        let runner = OsProcessRunner::new();
        let mut request = ProcessRequest::new("cat", &[], Path::new("."));
        request.stdin = Some("piped input".to_string());
        let output = runner.run(request).await.unwrap();
        assert_eq!(output.stdout, "piped input");
    }

    #[tokio::test]
    async fn os_runner_times_out_and_kills_the_group() {
        let runner = OsProcessRunner::new();
        let mut request = ProcessRequest::new("sleep", &["30"], Path::new("."));
        request.timeout = Some(Duration::from_millis(100));
        let err = runner.run(request).await.unwrap_err();
        assert!(matches!(err, ProcessExecutionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn scripted_runner_matches_rules_in_order() {
        let runner = ScriptedProcessRunner::new();
        runner.script(
            "git",
            &["status"],
            vec![ScriptedResponse::ok(" M file.rs"), ScriptedResponse::ok("")],
        );

        let req = ProcessRequest::new("git", &["status", "--porcelain"], Path::new("."));
        let first = runner.run(req.clone()).await.unwrap();
        assert_eq!(first.stdout, " M file.rs");
        let second = runner.run(req.clone()).await.unwrap();
        assert_eq!(second.stdout, "");
        // Last response repeats
        let third = runner.run(req).await.unwrap();
        assert_eq!(third.stdout, "");
        assert_eq!(runner.calls_for("git").len(), 3);
    }
}
