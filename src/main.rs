use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use ixado::adapter::AdapterRegistry;
use ixado::audit::AuditLog;
use ixado::authz;
use ixado::config::{self, IxadoConfig};
use ixado::events::{RuntimeEventBus, SubscriptionLevel};
use ixado::exception::EngineError;
use ixado::git::GitClient;
use ixado::hooks::LifecycleHookRegistry;
use ixado::lock;
use ixado::log::parse_log_level;
use ixado::process::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, OsProcessRunner,
    ProcessRequest, ProcessRunner,
};
use ixado::runner::{phase_loop_control, AdvanceMode, PhaseRunner, RunOutcome, RunnerSettings};
use ixado::state::{JsonStateStore, StateStore};
use ixado::types::{LockOwner, PhaseStatus};
use ixado::{log_error, log_info};

const EXIT_CI_FAILED: i32 = 2;
const EXIT_AUTH_DENIED: i32 = 3;

#[derive(Parser)]
#[command(name = "ixado", about = "Autonomous development-phase orchestrator")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/ixado.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the .ixado directory and default config
    Init {
        /// Project name recorded in the state file
        #[arg(long, default_value = "project")]
        name: String,
    },
    /// Run the active phase to a terminal status
    Run {
        /// Wait for an explicit advance between tasks instead of the
        /// configured auto countdown
        #[arg(long)]
        manual: bool,
        /// Override the auto-advance countdown in seconds
        #[arg(long)]
        auto_seconds: Option<u32>,
    },
    /// Show phase and task status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => ixado::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = cli.root.clone();

    let exit_code = match cli.command {
        Commands::Init { name } => match handle_init(&root, &name).await {
            Ok(()) => 0,
            Err(e) => {
                log_error!("Error: {}", e);
                1
            }
        },
        Commands::Run {
            manual,
            auto_seconds,
        } => handle_run(&root, cli.config.as_deref(), manual, auto_seconds).await,
        Commands::Status => match handle_status(&root, cli.config.as_deref()).await {
            Ok(()) => 0,
            Err(e) => {
                log_error!("Error: {}", e);
                1
            }
        },
    };

    std::process::exit(exit_code);
}

async fn handle_init(root: &Path, name: &str) -> Result<(), String> {
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "Project name must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        );
    }

    // Init requires a git repo but not a clean tree
    let runner = OsProcessRunner::new();
    runner
        .run(ProcessRequest::new(
            "git",
            &["rev-parse", "--git-dir"],
            root,
        ))
        .await
        .map_err(|_| "Not a git repository. Run `git init` first.".to_string())?;

    JsonStateStore::<OsProcessRunner>::init(root, name)?;

    let config_path = root.join("ixado.toml");
    if !config_path.exists() {
        let contents = format!(
            r#"[project]
name = "{name}"

[execution]
max_recovery_attempts = 2
task_timeout_minutes = 30
auto_advance_seconds = 0
# manual_advance = true

[tester]
# command = "cargo"
# args = ["test"]

[ci]
enabled = true
base_branch = "main"
poll_interval_ms = 30000
poll_timeout_minutes = 45
terminal_confirmations = 2
fix_task_fan_out_cap = 5
ci_fix_max_depth = 3
draft = false
mark_ready_on_approval = true

[adapter]
default = "claude"          # AI CLI tool: "claude", "codex", "gemini"
# model = ""                # Model override
# bypass_permissions = []   # Adapters allowed to skip their own approvals

[authorization]
role = "owner"
"#,
            name = name
        );
        fs::write(&config_path, contents)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
    }

    // Keep runtime artifacts out of version control
    let gitignore_path = root.join(".gitignore");
    let entry = ".ixado/";
    let existing = fs::read_to_string(&gitignore_path).unwrap_or_default();
    if !existing.lines().any(|line| line.trim() == entry) {
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(entry);
        contents.push('\n');
        fs::write(&gitignore_path, contents)
            .map_err(|e| format!("Failed to update {}: {}", gitignore_path.display(), e))?;
    }

    log_info!("Initialized ixado in {}", root.display());
    Ok(())
}

fn build_store(
    root: &Path,
    config: &IxadoConfig,
    runner: Arc<OsProcessRunner>,
) -> Result<JsonStateStore<OsProcessRunner>, String> {
    let registry = AdapterRegistry::with_defaults(&config.adapter.bypass_permissions)
        .map_err(|e| e.to_string())?;
    JsonStateStore::open(
        root,
        registry,
        runner,
        Duration::from_secs(config.execution.task_timeout_minutes as u64 * 60),
    )
}

async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    manual: bool,
    auto_seconds: Option<u32>,
) -> i32 {
    match run_phase(root, config_path, manual, auto_seconds).await {
        Ok(RunOutcome::Completed(PhaseStatus::CiFailed)) => {
            log_error!("Phase ended in ci_failed; see the phase context for next steps");
            EXIT_CI_FAILED
        }
        Ok(RunOutcome::Completed(status)) => {
            log_info!("Phase ended {}", status);
            0
        }
        Ok(RunOutcome::Stopped) => {
            log_info!("Stopped on request");
            0
        }
        Err(RunFailure::AuthorizationDenied(message)) => {
            log_error!("Error: {}", message);
            EXIT_AUTH_DENIED
        }
        Err(RunFailure::Fatal(message)) => {
            log_error!("Error: {}", message);
            1
        }
    }
}

enum RunFailure {
    AuthorizationDenied(String),
    Fatal(String),
}

impl From<String> for RunFailure {
    fn from(message: String) -> Self {
        RunFailure::Fatal(message)
    }
}

async fn run_phase(
    root: &Path,
    config_path: Option<&Path>,
    manual: bool,
    auto_seconds: Option<u32>,
) -> Result<RunOutcome, RunFailure> {
    let mut config = config::load_config_from(config_path, root)?;
    if manual {
        config.execution.manual_advance = true;
    }
    if let Some(seconds) = auto_seconds {
        config.execution.auto_advance_seconds = seconds;
    }

    install_signal_handlers()?;

    let runtime_dir = root.join(".ixado");
    let _lock = lock::try_acquire(&runtime_dir, LockOwner::CliPhaseRun, &config.project.name)?;

    let process = Arc::new(OsProcessRunner::new());
    let store = Arc::new(build_store(root, &config, Arc::clone(&process))?);
    let git = GitClient::new(Arc::clone(&process), root);
    let audit = AuditLog::new(&runtime_dir);
    let events = Arc::new(RuntimeEventBus::new());

    // Mirror runtime events onto the log
    let mut event_rx = events.subscribe(SubscriptionLevel::Important);
    let event_printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_info!("[{}] {}: {}", event.family, event.name, event.message);
        }
    });

    let settings = RunnerSettings::from_config(&config, authz::default_policy());
    let advance = settings.advance;
    let runner = PhaseRunner::new(
        store,
        process,
        git,
        audit,
        LifecycleHookRegistry::new(),
        Arc::clone(&events),
        settings,
    );

    let (control, mut gate) = phase_loop_control();
    let cancel = control.cancellation_token();

    // Bridge OS signals into the phase loop control
    let signal_control = control.clone();
    let signal_watcher = tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                signal_control.request_stop();
                kill_all_children();
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });

    // Auto mode advances through the countdown on its own; a manual gate
    // waits for stdin-driven advance signals
    if advance == AdvanceMode::Manual {
        let manual_control = control.clone();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        manual_control.request_stop();
                        break;
                    }
                    Ok(_) => {
                        if line.trim() == "stop" {
                            manual_control.request_stop();
                            break;
                        }
                        manual_control.request_next();
                    }
                }
            }
        });
        log_info!("Manual mode: press Enter to advance, type 'stop' to halt");
    }

    let result = runner.run(&mut gate, &cancel).await;

    signal_watcher.abort();
    event_printer.abort();

    match result {
        Ok(outcome) => Ok(outcome),
        Err(EngineError::AuthorizationDenied(denied)) => {
            Err(RunFailure::AuthorizationDenied(denied.to_string()))
        }
        Err(e) => Err(RunFailure::Fatal(e.to_string())),
    }
}

async fn handle_status(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;
    let process = Arc::new(OsProcessRunner::new());
    let store = build_store(root, &config, process)?;
    let state = store.get_state().await?;

    println!("Project: {}", state.project_name);
    for phase in &state.phases {
        let active = state.active_phase_id == Some(phase.id);
        println!(
            "{}{} [{}] branch={}{}",
            if active { "* " } else { "  " },
            phase.name,
            phase.status,
            phase.branch_name,
            phase
                .pr_url
                .as_deref()
                .map(|u| format!(" pr={}", u))
                .unwrap_or_default()
        );
        for task in &phase.tasks {
            println!(
                "    - {} [{:?}]{}",
                task.title,
                task.status,
                task.assignee
                    .map(|a| format!(" ({})", a))
                    .unwrap_or_default()
            );
        }
        if let Some(context) = &phase.ci_status_context {
            println!("    context: {}", context);
        }
    }
    Ok(())
}
