use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::ci::{self, PrOptions};
use crate::ci_poll::{self, PollConfig};
use crate::config::IxadoConfig;
use crate::events::{EventFamily, EventLevel, RuntimeEvent, RuntimeEventBus};
use crate::exception::EngineError;
use crate::git::GitClient;
use crate::hooks::{HookName, HookPayload, LifecycleHookRegistry};
use crate::preflight;
use crate::process::ProcessRunner;
use crate::recovery;
use crate::review::{self, ValidationStatus};
use crate::scheduler;
use crate::state::{NewTask, PhaseStatusUpdate, StateStore, TaskRunRequest};
use crate::tester::{self, TesterOutcome};
use crate::types::{
    AdapterId, AuthPolicy, ExceptionCategory, ExceptionMetadata, Phase, PhaseFailureKind,
    PhaseStatus, Role, Task, TaskStatus,
};
use crate::{log_info, log_warn};

// --- Advance gate ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceSignal {
    Next,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceMode {
    /// Count down between tasks; zero advances immediately.
    Auto { countdown_seconds: u32 },
    /// Wait for an explicit `request_next` between tasks.
    Manual,
}

/// Control half of the phase loop: other components (CLI input, signal
/// plumbing, remote commands) use this to advance or stop the runner.
#[derive(Clone)]
pub struct PhaseLoopControl {
    next_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

impl PhaseLoopControl {
    pub fn request_next(&self) {
        let _ = self.next_tx.send(());
    }

    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Waiting half of the phase loop. Stop short-circuits any pending wait.
pub struct AdvanceGate {
    next_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
}

pub fn phase_loop_control() -> (PhaseLoopControl, AdvanceGate) {
    let (next_tx, next_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    (
        PhaseLoopControl {
            next_tx,
            cancel: cancel.clone(),
        },
        AdvanceGate { next_rx, cancel },
    )
}

impl AdvanceGate {
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for an explicit advance signal.
    pub async fn wait_manual(&mut self) -> AdvanceSignal {
        tokio::select! {
            _ = self.cancel.cancelled() => AdvanceSignal::Stop,
            next = self.next_rx.recv() => match next {
                Some(()) => AdvanceSignal::Next,
                None => AdvanceSignal::Stop,
            },
        }
    }

    /// Auto-advance after a countdown of one-second ticks, checking the
    /// stop flag between ticks. Zero seconds advances immediately without
    /// sleeping. A queued `request_next` skips the rest of the countdown.
    pub async fn wait_auto(&mut self, countdown_seconds: u32) -> AdvanceSignal {
        if self.cancel.is_cancelled() {
            return AdvanceSignal::Stop;
        }
        for _ in 0..countdown_seconds {
            tokio::select! {
                _ = self.cancel.cancelled() => return AdvanceSignal::Stop,
                next = self.next_rx.recv() => match next {
                    Some(()) => return AdvanceSignal::Next,
                    None => return AdvanceSignal::Stop,
                },
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        AdvanceSignal::Next
    }

    pub async fn wait(&mut self, mode: AdvanceMode) -> AdvanceSignal {
        match mode {
            AdvanceMode::Auto { countdown_seconds } => self.wait_auto(countdown_seconds).await,
            AdvanceMode::Manual => self.wait_manual().await,
        }
    }
}

// --- Settings ---

#[derive(Debug, Clone)]
pub struct CiSettings {
    pub enabled: bool,
    pub base_branch: String,
    pub poll: PollConfig,
    pub fan_out_cap: u32,
    pub max_fix_depth: u32,
    pub pr: PrOptions,
    pub mark_ready_on_approval: bool,
    pub max_review_retries: u32,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub default_assignee: AdapterId,
    pub max_recovery_attempts: u32,
    pub role: Option<Role>,
    pub policy: AuthPolicy,
    pub advance: AdvanceMode,
    pub tester_command: Option<(String, Vec<String>)>,
    pub tester_timeout: Duration,
    pub ci: CiSettings,
}

impl RunnerSettings {
    pub fn from_config(config: &IxadoConfig, policy: AuthPolicy) -> Self {
        let advance = if config.execution.manual_advance {
            AdvanceMode::Manual
        } else {
            AdvanceMode::Auto {
                countdown_seconds: config.execution.auto_advance_seconds,
            }
        };

        Self {
            default_assignee: config.adapter.default,
            max_recovery_attempts: config.execution.max_recovery_attempts,
            role: config.authorization.role,
            policy,
            advance,
            tester_command: config
                .tester
                .command
                .as_ref()
                .map(|c| (c.clone(), config.tester.args.clone())),
            tester_timeout: Duration::from_secs(config.tester.timeout_minutes as u64 * 60),
            ci: CiSettings {
                enabled: config.ci.enabled,
                base_branch: config.ci.base_branch.clone(),
                poll: PollConfig {
                    interval: Duration::from_millis(config.ci.poll_interval_ms),
                    timeout: Duration::from_secs(config.ci.poll_timeout_minutes as u64 * 60),
                    terminal_confirmations: config.ci.terminal_confirmations,
                },
                fan_out_cap: config.ci.fix_task_fan_out_cap,
                max_fix_depth: config.ci.ci_fix_max_depth,
                pr: PrOptions {
                    draft: config.ci.draft,
                    labels: config.ci.labels.clone(),
                    assignees: config.ci.assignees.clone(),
                    template_mappings: config.ci.template_mappings.clone(),
                    default_template: config.ci.default_template.clone(),
                },
                mark_ready_on_approval: config.ci.mark_ready_on_approval,
                max_review_retries: config.ci.max_review_retries,
            },
        }
    }
}

// --- Runner ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(PhaseStatus),
    Stopped,
}

struct RunContext {
    phase_id: Option<Uuid>,
    stage: PhaseFailureKind,
}

/// The composition root: preflight, the phase state machine, and the
/// task/tester/CI pipeline, one phase per invocation.
pub struct PhaseRunner<S: StateStore, R: ProcessRunner> {
    store: Arc<S>,
    process: Arc<R>,
    git: GitClient<R>,
    audit: AuditLog,
    hooks: LifecycleHookRegistry,
    events: Arc<RuntimeEventBus>,
    settings: RunnerSettings,
}

impl<S: StateStore, R: ProcessRunner> PhaseRunner<S, R> {
    pub fn new(
        store: Arc<S>,
        process: Arc<R>,
        git: GitClient<R>,
        audit: AuditLog,
        hooks: LifecycleHookRegistry,
        events: Arc<RuntimeEventBus>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            process,
            git,
            audit,
            hooks,
            events,
            settings,
        }
    }

    pub fn events(&self) -> &RuntimeEventBus {
        &self.events
    }

    fn publish(&self, family: EventFamily, name: &str, level: EventLevel, message: &str) {
        self.events
            .publish(RuntimeEvent::new(family, name, level, message));
    }

    /// Run the active phase to its terminal status.
    ///
    /// Failures outside preflight and authorization drive the phase to
    /// `CiFailed` before propagating; the terminal outcome event fires on
    /// every path.
    pub async fn run(
        &self,
        gate: &mut AdvanceGate,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let mut ctx = RunContext {
            phase_id: None,
            stage: PhaseFailureKind::Branching,
        };

        match self.execute(&mut ctx, gate, cancel).await {
            Ok(outcome) => {
                let summary = match outcome {
                    RunOutcome::Completed(status) => format!("phase ended {}", status),
                    RunOutcome::Stopped => "stopped on request".to_string(),
                };
                let success = !matches!(outcome, RunOutcome::Completed(PhaseStatus::CiFailed));
                self.publish(
                    EventFamily::TerminalOutcome,
                    "terminal.outcome",
                    EventLevel::Critical,
                    &format!(
                        "{{outcome: {}, summary: {}}}",
                        if success { "success" } else { "failure" },
                        summary
                    ),
                );
                Ok(outcome)
            }
            Err(e) => {
                let fatal_without_state = matches!(
                    e,
                    EngineError::AuthorizationDenied(_) | EngineError::Preflight(_)
                );
                if !fatal_without_state {
                    if let Some(phase_id) = ctx.phase_id {
                        let update = PhaseStatusUpdate::new(phase_id, PhaseStatus::CiFailed)
                            .with_failure_kind(ctx.stage)
                            .with_ci_context(&e.to_string());
                        if let Err(store_err) = self.store.set_phase_status(update).await {
                            log_warn!("Failed to record phase failure: {}", store_err);
                        }
                        let payload = HookPayload::OnCiFailed {
                            phase_id,
                            failure_kind: ctx.stage,
                            context: e.to_string(),
                        };
                        if let Err(hook_err) =
                            self.hooks.dispatch(HookName::OnCiFailed, &payload).await
                        {
                            log_warn!("on_ci_failed hook failed: {}", hook_err);
                        }
                    }
                }
                self.publish(
                    EventFamily::TerminalOutcome,
                    "terminal.outcome",
                    EventLevel::Critical,
                    &format!("{{outcome: failure, summary: {}}}", e),
                );
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        gate: &mut AdvanceGate,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        // Startup reconciliation before anything else touches state
        let reconciled = self
            .store
            .reconcile_in_progress_tasks()
            .await
            .map_err(EngineError::State)?;
        if reconciled > 0 {
            log_info!(
                "[startup] Moved {} orphaned in-progress task(s) back to todo",
                reconciled
            );
        }

        let state = self.store.get_state().await.map_err(EngineError::State)?;
        let phase = preflight::run_preflight(&state)?.clone();
        ctx.phase_id = Some(phase.id);

        // Base-branch precondition: a not-yet-created phase branch must be
        // cut from the configured base
        let branch_exists = self
            .git
            .branch_exists(&phase.branch_name)
            .await
            .map_err(EngineError::State)?;
        if !branch_exists {
            let head = self
                .git
                .current_branch()
                .await
                .map_err(EngineError::State)?;
            if head != self.settings.ci.base_branch {
                return Err(EngineError::Preflight(crate::preflight::PreflightError {
                    condition: format!(
                        "Phase branch '{}' does not exist and HEAD is '{}', not the base branch '{}'",
                        phase.branch_name, head, self.settings.ci.base_branch
                    ),
                    context: format!("phase {} → branch_name", phase.id),
                    suggested_fix: format!(
                        "Check out '{}' before running, or create the phase branch manually",
                        self.settings.ci.base_branch
                    ),
                }));
            }
        }

        // BRANCHING
        ctx.stage = PhaseFailureKind::Branching;
        self.set_status(phase.id, PhaseStatus::Branching).await?;
        self.ensure_branch(ctx, &phase).await?;

        // CODING
        ctx.stage = PhaseFailureKind::TaskExecution;
        self.set_status(phase.id, PhaseStatus::Coding).await?;

        let mut iterations = 0u32;
        loop {
            if cancel.is_cancelled() || gate.is_stopped() {
                log_info!("[runner] Stop requested, leaving the task loop");
                return Ok(RunOutcome::Stopped);
            }

            let state = self.store.get_state().await.map_err(EngineError::State)?;
            let current = state
                .phase(phase.id)
                .ok_or_else(|| EngineError::State(format!("Phase {} vanished", phase.id)))?;

            let Some(index) = scheduler::pick_next_task(&current.tasks) else {
                break;
            };

            if iterations > 0 {
                match gate.wait(self.settings.advance).await {
                    AdvanceSignal::Next => {}
                    AdvanceSignal::Stop => return Ok(RunOutcome::Stopped),
                }
            }

            let task = current.tasks[index].clone();
            ctx.stage = PhaseFailureKind::TaskExecution;
            self.run_task_step(ctx, phase.id, &task).await?;

            ctx.stage = PhaseFailureKind::Tester;
            if let Some(outcome) = self.run_tester_step(phase.id, &task).await? {
                // Tester failure: the phase parks as CI_FAILED with the fix
                // task scheduled for the resumed run
                return Ok(outcome);
            }

            iterations += 1;
        }

        if !self.settings.ci.enabled {
            self.set_status(phase.id, PhaseStatus::Done).await?;
            return Ok(RunOutcome::Completed(PhaseStatus::Done));
        }

        self.ci_path(ctx, &phase, cancel).await
    }

    async fn set_status(&self, phase_id: Uuid, status: PhaseStatus) -> Result<(), EngineError> {
        log_info!("[runner] Phase -> {}", status);
        self.store
            .set_phase_status(PhaseStatusUpdate::new(phase_id, status))
            .await
            .map_err(EngineError::State)
    }

    /// Clean-tree check plus branch checkout/creation, with dirty-tree
    /// failures routed through recovery.
    async fn ensure_branch(&self, ctx: &mut RunContext, phase: &Phase) -> Result<(), EngineError> {
        if !self.git.is_clean().await.map_err(EngineError::State)? {
            let exception = ExceptionMetadata::dirty_worktree(
                "Working tree is not clean before branching",
            )
            .with_phase(phase.id);
            self.recover(ctx, phase.id, exception, None).await?;
        }

        let current = self
            .git
            .current_branch()
            .await
            .map_err(EngineError::State)?;
        if current == phase.branch_name {
            return Ok(());
        }

        if self
            .git
            .branch_exists(&phase.branch_name)
            .await
            .map_err(EngineError::State)?
        {
            self.git
                .checkout(&phase.branch_name)
                .await
                .map_err(EngineError::State)?;
        } else {
            self.git
                .create_branch(&phase.branch_name)
                .await
                .map_err(EngineError::State)?;
        }
        Ok(())
    }

    /// Dispatch the on-recovery hook and drive the recovery loop for one
    /// exception.
    ///
    /// A failed or exhausted recovery moves the failure stage to
    /// `Recovery` before propagating, so the phase records why it really
    /// parked rather than the stage that tripped the exception.
    async fn recover(
        &self,
        ctx: &mut RunContext,
        phase_id: Uuid,
        exception: ExceptionMetadata,
        assignee: Option<AdapterId>,
    ) -> Result<(), EngineError> {
        let payload = HookPayload::OnRecovery {
            phase_id,
            category: exception.category,
            attempt_number: 1,
        };
        self.hooks.dispatch(HookName::OnRecovery, &payload).await?;

        self.publish(
            EventFamily::TesterRecovery,
            "recovery.started",
            EventLevel::Important,
            &format!("Recovering from {}", exception),
        );

        if let Err(e) = recovery::attempt_exception_recovery(
            self.store.as_ref(),
            &self.git,
            &self.audit,
            assignee.unwrap_or(self.settings.default_assignee),
            exception,
            self.settings.role,
            &self.settings.policy,
            self.settings.max_recovery_attempts,
        )
        .await
        {
            ctx.stage = PhaseFailureKind::Recovery;
            return Err(e);
        }

        self.publish(
            EventFamily::TesterRecovery,
            "recovery.succeeded",
            EventLevel::Important,
            "Recovery verified",
        );
        Ok(())
    }

    /// Run one task to completion, retrying through recovery within the
    /// per-task budget of `max_recovery_attempts + 1` total runs.
    async fn run_task_step(
        &self,
        ctx: &mut RunContext,
        phase_id: Uuid,
        task: &Task,
    ) -> Result<(), EngineError> {
        let assignee = task.assignee.unwrap_or(self.settings.default_assignee);
        let max_runs = self.settings.max_recovery_attempts + 1;
        let mut runs = 0u32;

        loop {
            runs += 1;

            let payload = HookPayload::BeforeTaskStart {
                phase_id,
                task_id: task.id,
                title: task.title.clone(),
            };
            self.hooks
                .dispatch(HookName::BeforeTaskStart, &payload)
                .await?;

            self.publish(
                EventFamily::TaskLifecycle,
                "task.started",
                EventLevel::Info,
                &format!("{} (run {}/{})", task.title, runs, max_runs),
            );

            let state = self
                .store
                .start_active_task_and_wait(TaskRunRequest {
                    phase_id,
                    task_id: task.id,
                    assignee,
                    resume: runs > 1,
                })
                .await
                .map_err(EngineError::State)?;

            let updated = state
                .phase(phase_id)
                .and_then(|p| p.task(task.id))
                .ok_or_else(|| {
                    EngineError::State(format!("Task {} vanished during execution", task.id))
                })?;

            match updated.status {
                TaskStatus::Done => {
                    self.publish(
                        EventFamily::TaskLifecycle,
                        "task.done",
                        EventLevel::Info,
                        &task.title,
                    );
                    let payload = HookPayload::AfterTaskDone {
                        phase_id,
                        task_id: task.id,
                        title: task.title.clone(),
                    };
                    self.hooks
                        .dispatch(HookName::AfterTaskDone, &payload)
                        .await?;
                    return Ok(());
                }
                TaskStatus::Failed => {
                    self.publish(
                        EventFamily::TaskLifecycle,
                        "task.failed",
                        EventLevel::Important,
                        &format!(
                            "{}: {}",
                            task.title,
                            updated.error_logs.as_deref().unwrap_or("unknown error")
                        ),
                    );

                    let exception = ExceptionMetadata {
                        category: updated
                            .error_category
                            .unwrap_or(ExceptionCategory::AgentFailure),
                        message: updated
                            .error_logs
                            .clone()
                            .unwrap_or_else(|| "Task failed without error logs".to_string()),
                        phase_id: Some(phase_id),
                        task_id: Some(task.id),
                        adapter_failure_kind: updated.adapter_failure_kind,
                    };

                    if runs >= max_runs {
                        let mut exhausted = exception;
                        exhausted.message = format!(
                            "Task '{}' failed after {} run(s): {}",
                            task.title, runs, exhausted.message
                        );
                        return Err(EngineError::Exception(exhausted));
                    }

                    self.recover(ctx, phase_id, exception, Some(assignee)).await?;
                }
                other => {
                    return Err(EngineError::Contract(format!(
                        "Task '{}' ended in unexpected status {:?}",
                        task.title, other
                    )));
                }
            }
        }
    }

    /// Run the tester after a completed task. Returns `Some(outcome)` when
    /// the phase must stop (tests failed and a fix task was parked).
    async fn run_tester_step(
        &self,
        phase_id: Uuid,
        trigger: &Task,
    ) -> Result<Option<RunOutcome>, EngineError> {
        let configured = self
            .settings
            .tester_command
            .as_ref()
            .map(|(c, a)| (c.as_str(), a.as_slice()));

        let outcome = tester::run_tester(
            self.process.as_ref(),
            self.git.cwd(),
            configured,
            self.settings.tester_timeout,
            trigger,
        )
        .await
        .map_err(EngineError::State)?;

        let fix_task = match outcome {
            TesterOutcome::Passed { .. } => {
                self.publish(
                    EventFamily::TesterRecovery,
                    "tester.passed",
                    EventLevel::Info,
                    &trigger.title,
                );
                return Ok(None);
            }
            TesterOutcome::Skipped => return Ok(None),
            TesterOutcome::Failed { fix_task } => fix_task,
        };

        self.publish(
            EventFamily::TesterRecovery,
            "tester.failed",
            EventLevel::Important,
            &fix_task.title,
        );

        let state = self.store.get_state().await.map_err(EngineError::State)?;
        let tasks = &state
            .phase(phase_id)
            .ok_or_else(|| EngineError::State(format!("Phase {} vanished", phase_id)))?
            .tasks;

        // Dedup: same title, same trigger dependency, or any shared
        // dependency means the failure is already tracked
        let duplicate = tasks.iter().any(|t| {
            t.title == fix_task.title
                || t.dependencies.contains(&trigger.id)
                || t.dependencies
                    .iter()
                    .any(|d| fix_task.dependencies.contains(d))
        });

        if duplicate {
            log_info!(
                "[tester] Fix task '{}' already tracked, skipping creation",
                fix_task.title
            );
        } else {
            ci_poll::check_depth_cap(
                tasks,
                &fix_task.dependencies,
                self.settings.ci.max_fix_depth,
            )?;
            self.store
                .create_task(NewTask {
                    phase_id,
                    title: fix_task.title.clone(),
                    description: fix_task.description.clone(),
                    assignee: None,
                    dependencies: fix_task.dependencies.clone(),
                    status: TaskStatus::CiFix,
                })
                .await
                .map_err(EngineError::State)?;
        }

        let update = PhaseStatusUpdate::new(phase_id, PhaseStatus::CiFailed)
            .with_failure_kind(PhaseFailureKind::Tester)
            .with_ci_context(&format!("Tester failure after '{}'", trigger.title));
        self.store
            .set_phase_status(update)
            .await
            .map_err(EngineError::State)?;

        let payload = HookPayload::OnCiFailed {
            phase_id,
            failure_kind: PhaseFailureKind::Tester,
            context: fix_task.title.clone(),
        };
        self.hooks.dispatch(HookName::OnCiFailed, &payload).await?;

        Ok(Some(RunOutcome::Completed(PhaseStatus::CiFailed)))
    }

    /// The CI tail of the phase: PR creation, remote polling, check
    /// mapping, and the review-validation loop.
    async fn ci_path(
        &self,
        ctx: &mut RunContext,
        phase: &Phase,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        ctx.stage = PhaseFailureKind::RemoteCi;
        self.set_status(phase.id, PhaseStatus::CreatingPr).await?;

        // Fresh snapshot so the PR body sees the completed tasks
        let state = self.store.get_state().await.map_err(EngineError::State)?;
        let current = state
            .phase(phase.id)
            .ok_or_else(|| EngineError::State(format!("Phase {} vanished", phase.id)))?;

        let integration = match ci::run_ci_integration(
            self.process.as_ref(),
            &self.git,
            &self.audit,
            self.settings.role,
            &self.settings.policy,
            current,
            &self.settings.ci.pr,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(EngineError::Exception(meta)) if meta.is_recoverable() => {
                self.recover(ctx, phase.id, meta, None).await?;
                ci::run_ci_integration(
                    self.process.as_ref(),
                    &self.git,
                    &self.audit,
                    self.settings.role,
                    &self.settings.policy,
                    current,
                    &self.settings.ci.pr,
                )
                .await?
            }
            Err(e) => return Err(e),
        };

        self.store
            .set_phase_pr_url(phase.id, &integration.pr_url)
            .await
            .map_err(EngineError::State)?;

        self.publish(
            EventFamily::CiPrLifecycle,
            "pr.created",
            EventLevel::Important,
            &integration.pr_url,
        );

        self.set_status(phase.id, PhaseStatus::AwaitingCi).await?;

        let summary = ci_poll::poll_until_terminal(
            self.process.as_ref(),
            self.git.cwd(),
            &integration.pr_url,
            &self.settings.ci.poll,
            &self.events,
            cancel,
        )
        .await?;

        if summary.overall != crate::types::CheckState::Success {
            let state = self.store.get_state().await.map_err(EngineError::State)?;
            let tasks = &state
                .phase(phase.id)
                .ok_or_else(|| EngineError::State(format!("Phase {} vanished", phase.id)))?
                .tasks;

            let report = ci_poll::map_checks_to_fix_tasks(
                &summary,
                tasks,
                &integration.pr_url,
                self.settings.ci.fan_out_cap,
            )?;

            for spec in &report.created {
                self.store
                    .create_task(NewTask {
                        phase_id: phase.id,
                        title: spec.title.clone(),
                        description: spec.description.clone(),
                        assignee: None,
                        dependencies: Vec::new(),
                        status: TaskStatus::CiFix,
                    })
                    .await
                    .map_err(EngineError::State)?;
            }

            let update = PhaseStatusUpdate::new(phase.id, PhaseStatus::CiFailed)
                .with_failure_kind(PhaseFailureKind::RemoteCi)
                .with_ci_context(&report.context_line());
            self.store
                .set_phase_status(update)
                .await
                .map_err(EngineError::State)?;

            let payload = HookPayload::OnCiFailed {
                phase_id: phase.id,
                failure_kind: PhaseFailureKind::RemoteCi,
                context: report.context_line(),
            };
            self.hooks.dispatch(HookName::OnCiFailed, &payload).await?;

            return Ok(RunOutcome::Completed(PhaseStatus::CiFailed));
        }

        // Remote CI green: validation loop
        ctx.stage = PhaseFailureKind::Validation;
        let report = review::run_validation_loop(
            self.store.as_ref(),
            &self.git,
            &self.audit,
            self.settings.role,
            &self.settings.policy,
            self.settings.default_assignee,
            self.settings.default_assignee,
            &self.settings.ci.base_branch,
            self.settings.ci.max_review_retries,
            phase.id,
        )
        .await?;

        match report.status {
            ValidationStatus::Approved => {
                if self.settings.ci.mark_ready_on_approval && self.settings.ci.pr.draft {
                    ci::mark_pr_ready(
                        self.process.as_ref(),
                        &self.git,
                        &self.audit,
                        self.settings.role,
                        &self.settings.policy,
                        &integration.pr_url,
                    )
                    .await?;
                }
                self.set_status(phase.id, PhaseStatus::ReadyForReview)
                    .await?;
                Ok(RunOutcome::Completed(PhaseStatus::ReadyForReview))
            }
            ValidationStatus::MaxRetriesExceeded { pending_comments } => {
                let context = format!(
                    "Review validation exhausted retries with {} pending comment(s): {}",
                    pending_comments.len(),
                    pending_comments.join(" | ")
                );
                let update = PhaseStatusUpdate::new(phase.id, PhaseStatus::CiFailed)
                    .with_failure_kind(PhaseFailureKind::Validation)
                    .with_ci_context(&context);
                self.store
                    .set_phase_status(update)
                    .await
                    .map_err(EngineError::State)?;

                let payload = HookPayload::OnCiFailed {
                    phase_id: phase.id,
                    failure_kind: PhaseFailureKind::Validation,
                    context,
                };
                self.hooks.dispatch(HookName::OnCiFailed, &payload).await?;

                Ok(RunOutcome::Completed(PhaseStatus::CiFailed))
            }
        }
    }
}
