use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::adapter::{AdapterError, AdapterRegistry};
use crate::exception;
use crate::process::ProcessRunner;
use crate::prompt;
use crate::types::{
    AdapterId, PhaseFailureKind, PhaseStatus, ProjectState, RecoveryAttemptRecord, Task,
    TaskStatus,
};
use crate::{log_debug, log_info};

/// How much adapter stdout is kept as a task's result context.
const RESULT_CONTEXT_MAX_CHARS: usize = 2000;

pub const STATE_FILE_NAME: &str = "state.json";
pub const STATE_SCHEMA_VERSION: u32 = 1;

// --- Contract types ---

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseStatusUpdate {
    pub phase_id: Uuid,
    pub status: PhaseStatus,
    pub failure_kind: Option<PhaseFailureKind>,
    pub ci_status_context: Option<String>,
}

impl PhaseStatusUpdate {
    pub fn new(phase_id: Uuid, status: PhaseStatus) -> Self {
        Self {
            phase_id,
            status,
            failure_kind: None,
            ci_status_context: None,
        }
    }

    pub fn with_failure_kind(mut self, kind: PhaseFailureKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }

    pub fn with_ci_context(mut self, context: &str) -> Self {
        self.ci_status_context = Some(context.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub phase_id: Uuid,
    pub title: String,
    pub description: String,
    pub assignee: Option<AdapterId>,
    pub dependencies: Vec<Uuid>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunRequest {
    pub phase_id: Uuid,
    pub task_id: Uuid,
    pub assignee: AdapterId,
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalWorkRequest {
    pub assignee: AdapterId,
    pub prompt: String,
    pub phase_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Transactional state access plus the internal work channel.
///
/// The engine depends only on this contract; persistence and adapter
/// plumbing live behind it.
pub trait StateStore: Send + Sync {
    fn get_state(&self)
        -> impl std::future::Future<Output = Result<ProjectState, String>> + Send;

    fn set_phase_status(
        &self,
        update: PhaseStatusUpdate,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn set_phase_pr_url(
        &self,
        phase_id: Uuid,
        pr_url: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Mark the task in progress, drive its assignee to completion, record
    /// the outcome, and return the updated state.
    fn start_active_task_and_wait(
        &self,
        request: TaskRunRequest,
    ) -> impl std::future::Future<Output = Result<ProjectState, String>> + Send;

    fn create_task(
        &self,
        new_task: NewTask,
    ) -> impl std::future::Future<Output = Result<Uuid, String>> + Send;

    /// Move orphaned `InProgress` tasks back to `Todo`; returns how many.
    fn reconcile_in_progress_tasks(
        &self,
    ) -> impl std::future::Future<Output = Result<usize, String>> + Send;

    fn record_recovery_attempt(
        &self,
        record: RecoveryAttemptRecord,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    /// Run an adapter non-interactively with an ad-hoc prompt (recovery,
    /// review, fixes) and return its captured output.
    fn run_internal_work(
        &self,
        request: InternalWorkRequest,
    ) -> impl std::future::Future<Output = Result<WorkOutput, String>> + Send;
}

// --- JSON file implementation ---

/// File-backed state store at `.ixado/state.json`.
///
/// All mutations go through a read-modify-write closure holding the store
/// mutex; adapter work runs outside the lock.
pub struct JsonStateStore<R: ProcessRunner> {
    path: PathBuf,
    project_root: PathBuf,
    state: Mutex<ProjectState>,
    registry: AdapterRegistry,
    runner: Arc<R>,
    work_timeout: Duration,
}

impl<R: ProcessRunner> JsonStateStore<R> {
    /// Open an existing state file under `<project_root>/.ixado/`.
    pub fn open(
        project_root: &Path,
        registry: AdapterRegistry,
        runner: Arc<R>,
        work_timeout: Duration,
    ) -> Result<Self, String> {
        let path = project_root.join(".ixado").join(STATE_FILE_NAME);
        let state = load_state(&path)?;
        Ok(Self {
            path,
            project_root: project_root.to_path_buf(),
            state: Mutex::new(state),
            registry,
            runner,
            work_timeout,
        })
    }

    /// Create a fresh state file. Fails if one already exists.
    pub fn init(project_root: &Path, project_name: &str) -> Result<(), String> {
        let dir = project_root.join(".ixado");
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        let path = dir.join(STATE_FILE_NAME);
        if path.exists() {
            return Err(format!("State file already exists: {}", path.display()));
        }
        let state = ProjectState {
            schema_version: STATE_SCHEMA_VERSION,
            project_name: project_name.to_string(),
            ..Default::default()
        };
        save_state(&path, &state)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Apply a mutation under the store mutex and persist the result.
    async fn update<T>(
        &self,
        mutate: impl FnOnce(&mut ProjectState) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut state = self.state.lock().await;
        let value = mutate(&mut state)?;
        save_state(&self.path, &state)?;
        Ok(value)
    }
}

fn load_state(path: &Path) -> Result<ProjectState, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let state: ProjectState = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
    if state.schema_version != STATE_SCHEMA_VERSION {
        return Err(format!(
            "Unsupported state schema version {} in {} (expected {})",
            state.schema_version,
            path.display(),
            STATE_SCHEMA_VERSION
        ));
    }
    Ok(state)
}

fn save_state(path: &Path, state: &ProjectState) -> Result<(), String> {
    let contents = serde_json::to_string_pretty(state)
        .map_err(|e| format!("Failed to serialize state: {}", e))?;
    std::fs::write(path, contents)
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

fn truncate_context(output: &str) -> String {
    if output.len() <= RESULT_CONTEXT_MAX_CHARS {
        return output.to_string();
    }
    let start = output.len() - RESULT_CONTEXT_MAX_CHARS;
    // Keep the tail; the end of a transcript carries the conclusion
    let mut start = start;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}

impl<R: ProcessRunner> StateStore for JsonStateStore<R> {
    async fn get_state(&self) -> Result<ProjectState, String> {
        Ok(self.state.lock().await.clone())
    }

    async fn set_phase_status(&self, update: PhaseStatusUpdate) -> Result<(), String> {
        self.update(|state| {
            let phase = state
                .phase_mut(update.phase_id)
                .ok_or_else(|| format!("Phase {} not found", update.phase_id))?;
            phase.status = update.status;
            if update.failure_kind.is_some() {
                phase.failure_kind = update.failure_kind;
            }
            if let Some(context) = update.ci_status_context {
                phase.ci_status_context = Some(context);
            }
            Ok(())
        })
        .await
    }

    async fn set_phase_pr_url(&self, phase_id: Uuid, pr_url: &str) -> Result<(), String> {
        self.update(|state| {
            let phase = state
                .phase_mut(phase_id)
                .ok_or_else(|| format!("Phase {} not found", phase_id))?;
            phase.pr_url = Some(pr_url.to_string());
            Ok(())
        })
        .await
    }

    async fn start_active_task_and_wait(
        &self,
        request: TaskRunRequest,
    ) -> Result<ProjectState, String> {
        // Mark in progress and capture what we need for the run
        let (prompt_text, phase_name) = self
            .update(|state| {
                let phase = state
                    .phase_mut(request.phase_id)
                    .ok_or_else(|| format!("Phase {} not found", request.phase_id))?;
                let phase_name = phase.name.clone();
                let task = phase
                    .task_mut(request.task_id)
                    .ok_or_else(|| format!("Task {} not found", request.task_id))?;
                task.status = TaskStatus::InProgress;
                task.assignee = Some(request.assignee);
                let text = prompt::build_task_prompt(task, &phase_name, None);
                Ok((text, phase_name))
            })
            .await?;

        log_info!(
            "[{}] Running task via {} adapter",
            phase_name,
            request.assignee
        );

        let adapter = self.registry.get(request.assignee)?;
        let outcome = adapter
            .run(
                self.runner.as_ref(),
                &self.project_root,
                &prompt_text,
                request.resume,
                self.work_timeout,
            )
            .await;

        // Record the outcome
        self.update(|state| {
            let phase = state
                .phase_mut(request.phase_id)
                .ok_or_else(|| format!("Phase {} not found", request.phase_id))?;
            let task = phase
                .task_mut(request.task_id)
                .ok_or_else(|| format!("Task {} not found", request.task_id))?;
            match &outcome {
                Ok(output) => {
                    task.status = TaskStatus::Done;
                    task.result_context = Some(truncate_context(&output.stdout));
                    task.error_logs = None;
                }
                Err(AdapterError::Process(err)) => {
                    let meta = exception::from_process_error(err);
                    task.status = TaskStatus::Failed;
                    task.error_logs = Some(err.to_string());
                    task.error_category = Some(meta.category);
                    task.adapter_failure_kind = meta.adapter_failure_kind;
                }
                Err(err) => {
                    task.status = TaskStatus::Failed;
                    task.error_logs = Some(err.to_string());
                    task.error_category =
                        Some(crate::types::ExceptionCategory::AgentFailure);
                }
            }
            Ok(())
        })
        .await?;

        self.get_state().await
    }

    async fn create_task(&self, new_task: NewTask) -> Result<Uuid, String> {
        self.update(|state| {
            let phase = state
                .phase_mut(new_task.phase_id)
                .ok_or_else(|| format!("Phase {} not found", new_task.phase_id))?;
            let mut task = Task::new(&new_task.title, &new_task.description);
            task.assignee = new_task.assignee;
            task.dependencies = new_task.dependencies.clone();
            task.status = new_task.status;
            let id = task.id;
            phase.tasks.push(task);
            Ok(id)
        })
        .await
    }

    async fn reconcile_in_progress_tasks(&self) -> Result<usize, String> {
        self.update(|state| {
            let mut count = 0;
            for phase in &mut state.phases {
                for task in &mut phase.tasks {
                    if task.status == TaskStatus::InProgress {
                        task.status = TaskStatus::Todo;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                log_debug!("[startup] Reconciled {} orphaned in-progress task(s)", count);
            }
            Ok(count)
        })
        .await
    }

    async fn record_recovery_attempt(
        &self,
        record: RecoveryAttemptRecord,
    ) -> Result<(), String> {
        self.update(|state| {
            state.recovery_attempts.push(record);
            Ok(())
        })
        .await
    }

    async fn run_internal_work(&self, request: InternalWorkRequest) -> Result<WorkOutput, String> {
        let adapter = self.registry.get(request.assignee)?;
        let output = adapter
            .run(
                self.runner.as_ref(),
                &self.project_root,
                &request.prompt,
                request.resume,
                self.work_timeout,
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(WorkOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ScriptedProcessRunner, ScriptedResponse};
    use crate::types::Phase;
    use tempfile::TempDir;

    async fn store_with_phase(
        dir: &TempDir,
        runner: ScriptedProcessRunner,
    ) -> (JsonStateStore<ScriptedProcessRunner>, Uuid, Uuid) {
        JsonStateStore::<ScriptedProcessRunner>::init(dir.path(), "demo").unwrap();
        let registry = AdapterRegistry::with_defaults(&[]).unwrap();
        let store = JsonStateStore::open(
            dir.path(),
            registry,
            Arc::new(runner),
            Duration::from_secs(5),
        )
        .unwrap();

        let mut phase = Phase::new("alpha", "feature/alpha");
        let task = Task::new("implement widget", "make it spin");
        let (phase_id, task_id) = (phase.id, task.id);
        phase.tasks.push(task);

        store
            .update(|state| {
                state.phases.push(phase);
                Ok(())
            })
            .await
            .unwrap();
        (store, phase_id, task_id)
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        JsonStateStore::<ScriptedProcessRunner>::init(dir.path(), "demo").unwrap();
        assert!(JsonStateStore::<ScriptedProcessRunner>::init(dir.path(), "demo").is_err());
    }

    #[tokio::test]
    async fn task_run_marks_done_on_adapter_success() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedProcessRunner::new();
        runner.script("mock-cli", &[], vec![ScriptedResponse::ok("all done")]);
        let (store, phase_id, task_id) = store_with_phase(&dir, runner).await;

        let state = store
            .start_active_task_and_wait(TaskRunRequest {
                phase_id,
                task_id,
                assignee: AdapterId::MockCli,
                resume: false,
            })
            .await
            .unwrap();

        let task = state.phase(phase_id).unwrap().task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result_context.as_deref(), Some("all done"));
    }

    #[tokio::test]
    async fn task_run_marks_failed_with_classification() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedProcessRunner::new();
        runner.script(
            "mock-cli",
            &[],
            vec![ScriptedResponse::fail(1, "401 Unauthorized")],
        );
        let (store, phase_id, task_id) = store_with_phase(&dir, runner).await;

        let state = store
            .start_active_task_and_wait(TaskRunRequest {
                phase_id,
                task_id,
                assignee: AdapterId::MockCli,
                resume: false,
            })
            .await
            .unwrap();

        let task = state.phase(phase_id).unwrap().task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.adapter_failure_kind,
            Some(crate::types::AdapterFailureKind::Auth)
        );
    }

    #[tokio::test]
    async fn reconcile_returns_count_and_resets_status() {
        let dir = TempDir::new().unwrap();
        let (store, phase_id, task_id) = store_with_phase(&dir, ScriptedProcessRunner::new()).await;
        store
            .update(|state| {
                state
                    .phase_mut(phase_id)
                    .unwrap()
                    .task_mut(task_id)
                    .unwrap()
                    .status = TaskStatus::InProgress;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(store.reconcile_in_progress_tasks().await.unwrap(), 1);
        assert_eq!(store.reconcile_in_progress_tasks().await.unwrap(), 0);
        let state = store.get_state().await.unwrap();
        assert_eq!(
            state.phase(phase_id).unwrap().task(task_id).unwrap().status,
            TaskStatus::Todo
        );
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let (_store, phase_id, _task_id) =
            store_with_phase(&dir, ScriptedProcessRunner::new()).await;

        let reloaded =
            load_state(&dir.path().join(".ixado").join(STATE_FILE_NAME)).unwrap();
        assert_eq!(reloaded.project_name, "demo");
        assert!(reloaded.phase(phase_id).is_some());
    }
}
