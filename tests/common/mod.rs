#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use ixado::adapter::AdapterRegistry;
use ixado::audit::AuditLog;
use ixado::authz;
use ixado::ci_poll::PollConfig;
use ixado::events::RuntimeEventBus;
use ixado::git::GitClient;
use ixado::hooks::LifecycleHookRegistry;
use ixado::process::{ScriptedProcessRunner, ScriptedResponse};
use ixado::runner::{AdvanceMode, CiSettings, PhaseRunner, RunnerSettings};
use ixado::state::JsonStateStore;
use ixado::types::{AdapterId, Phase, ProjectState, Role, Task, TaskStatus};

pub const BRANCH: &str = "feature/alpha";

/// A fully wired project on disk: scripted processes, JSON state store,
/// one phase. Tests drive the runner against it.
pub struct TestProject {
    pub dir: TempDir,
    pub runner: Arc<ScriptedProcessRunner>,
    pub store: Arc<JsonStateStore<ScriptedProcessRunner>>,
    pub phase_id: Uuid,
}

impl TestProject {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> GitClient<ScriptedProcessRunner> {
        GitClient::new(Arc::clone(&self.runner), self.root())
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::new(&self.root().join(".ixado"))
    }

    pub fn phase_runner(
        &self,
        settings: RunnerSettings,
    ) -> PhaseRunner<JsonStateStore<ScriptedProcessRunner>, ScriptedProcessRunner> {
        PhaseRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.runner),
            self.git(),
            self.audit(),
            LifecycleHookRegistry::new(),
            Arc::new(RuntimeEventBus::new()),
            settings,
        )
    }
}

/// Build a project whose single phase carries the given tasks.
///
/// The state file is written before the store opens it, so the store's
/// in-memory copy and the disk agree from the start.
pub fn project_with_tasks(tasks: Vec<Task>) -> TestProject {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedProcessRunner::new());

    let mut phase = Phase::new("alpha", BRANCH);
    phase.tasks = tasks;
    let phase_id = phase.id;

    let state = ProjectState {
        schema_version: 1,
        project_name: "demo".to_string(),
        active_phase_id: Some(phase_id),
        phases: vec![phase],
        ..Default::default()
    };

    let runtime_dir = dir.path().join(".ixado");
    std::fs::create_dir_all(&runtime_dir).unwrap();
    std::fs::write(
        runtime_dir.join("state.json"),
        serde_json::to_string_pretty(&state).unwrap(),
    )
    .unwrap();

    let registry = AdapterRegistry::with_defaults(&[]).unwrap();
    let store = Arc::new(
        JsonStateStore::open(
            dir.path(),
            registry,
            Arc::clone(&runner),
            Duration::from_secs(10),
        )
        .unwrap(),
    );

    TestProject {
        dir,
        runner,
        store,
        phase_id,
    }
}

pub fn todo_task(title: &str) -> Task {
    Task::new(title, "do the work")
}

#[allow(dead_code)]
pub fn task_with_status(title: &str, status: TaskStatus) -> Task {
    let mut task = Task::new(title, "");
    task.status = status;
    task
}

/// Runner settings with fast timings and CI toggled per test.
pub fn settings(ci_enabled: bool) -> RunnerSettings {
    RunnerSettings {
        default_assignee: AdapterId::MockCli,
        max_recovery_attempts: 2,
        role: Some(Role::Owner),
        policy: authz::default_policy(),
        advance: AdvanceMode::Auto {
            countdown_seconds: 0,
        },
        tester_command: None,
        tester_timeout: Duration::from_secs(5),
        ci: CiSettings {
            enabled: ci_enabled,
            base_branch: "main".to_string(),
            poll: PollConfig {
                interval: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
                terminal_confirmations: 2,
            },
            fan_out_cap: 5,
            max_fix_depth: 3,
            pr: ixado::ci::PrOptions::default(),
            mark_ready_on_approval: true,
            max_review_retries: 2,
        },
    }
}

/// Script the git calls a clean run makes: clean tree, on the base branch,
/// phase branch absent (created fresh).
pub fn script_clean_git(runner: &ScriptedProcessRunner) {
    runner.script(
        "git",
        &["status", "--porcelain"],
        vec![ScriptedResponse::ok("")],
    );
    runner.script(
        "git",
        &["rev-parse", "--abbrev-ref", "HEAD"],
        vec![ScriptedResponse::ok("main\n")],
    );
    runner.script(
        "git",
        &["rev-parse", "--verify"],
        vec![ScriptedResponse::fail(1, "")],
    );
}
