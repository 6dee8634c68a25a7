//! `autopilot` CLI: drive a coding agent across sessions until its task list
//! passes, or inspect the sandbox policy and progress of a project.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use autopilot::cancel::{CancelToken, install_interrupt_handler};
use autopilot::core::command_policy::{default_allowed_commands, validate};
use autopilot::core::progress::ProgressSnapshot;
use autopilot::core::types::StopReason;
use autopilot::dispatch::ToolDispatcher;
use autopilot::exit_codes;
use autopilot::io::browser::launcher_from_settings;
use autopilot::io::config::{
    AgentConfig, ConfigError, DEFAULT_CONFIG_FILE, EnvSettings, Overrides, load_config,
    load_supervisor_config, resolve_project_dir,
};
use autopilot::io::engine::OpenRouterEngine;
use autopilot::io::init::{InitOptions, ProjectPaths, init_project};
use autopilot::io::lock::{self, LockError};
use autopilot::io::progress_store::ProgressStore;
use autopilot::io::prompt::PromptEngine;
use autopilot::logging;
use autopilot::orchestrator::{self, RunOptions, RunOutcome};
use clap::{Args, Parser, Subcommand};

const DEFAULT_PROJECT_DIR: &str = "autonomous_demo_project";

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Supervised multi-session coding agent with a command sandbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct ProjectArg {
    /// Project directory. Relative paths are placed under `generations/`.
    #[arg(long, default_value = DEFAULT_PROJECT_DIR)]
    project_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct ConfigArg {
    /// Supervisor config file. Must live outside the project directory.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run sessions until every task in feature_list.json passes.
    Run {
        #[command(flatten)]
        project: ProjectArg,
        #[command(flatten)]
        config: ConfigArg,
        /// Model identifier (overrides OPENROUTER_MODEL).
        #[arg(long)]
        model: Option<String>,
        /// Stop after this many sessions.
        #[arg(long)]
        max_sessions: Option<u32>,
        /// Tool-call budget per session.
        #[arg(long)]
        max_tool_calls: Option<u32>,
        /// Application spec to copy into the project as app_spec.txt.
        #[arg(long)]
        spec: Option<PathBuf>,
    },
    /// Print whether the sandbox would allow a command line.
    CheckCommand {
        /// Use the allowlist from this config file instead of the default.
        #[arg(long)]
        config: Option<PathBuf>,
        /// The full command line, quoted.
        command: String,
    },
    /// Print the task-list progress of a project.
    Progress {
        #[command(flatten)]
        project: ProjectArg,
    },
    /// Write the default config file and create the project's state directory.
    Init {
        #[command(flatten)]
        project: ProjectArg,
        #[command(flatten)]
        config: ConfigArg,
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Remove a project's lock file left behind by a run that did not exit cleanly.
    Unlock {
        #[command(flatten)]
        project: ProjectArg,
        /// Remove the lock even if its holder still appears to be running.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            error_exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            project,
            config,
            model,
            max_sessions,
            max_tool_calls,
            spec,
        } => cmd_run(
            &project.project_dir,
            &config.config,
            Overrides {
                model,
                max_tool_calls,
            },
            RunOptions {
                max_sessions,
                spec,
                echo: true,
            },
        ),
        Command::CheckCommand { config, command } => {
            cmd_check_command(config.as_deref(), &command)
        }
        Command::Progress { project } => cmd_progress(&project.project_dir),
        Command::Init {
            project,
            config,
            force,
        } => cmd_init(&project.project_dir, &config.config, force),
        Command::Unlock { project, force } => cmd_unlock(&project.project_dir, force),
    }
}

/// Configuration and lock problems are operator errors; everything else is fatal.
fn error_exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() || err.downcast_ref::<LockError>().is_some() {
        exit_codes::INVALID
    } else {
        exit_codes::FATAL
    }
}

fn cmd_run(
    requested: &Path,
    config_path: &Path,
    overrides: Overrides,
    options: RunOptions,
) -> Result<i32> {
    let env = EnvSettings::from_env();
    if env.api_key.is_none() {
        return Err(ConfigError::MissingApiKey.into());
    }
    if let Some(spec) = &options.spec
        && !spec.is_file()
    {
        return Err(ConfigError::Invalid(format!("spec file not found: {}", spec.display())).into());
    }
    let project_dir = resolve_project_dir(requested);
    fs::create_dir_all(&project_dir)
        .with_context(|| format!("create project directory {}", project_dir.display()))?;

    let settings = load_supervisor_config(config_path, &project_dir)?;
    let system_prompt = PromptEngine::new()?.render_base(&settings.allowed_commands)?;
    let config = AgentConfig::build(&project_dir, settings, env, &overrides, system_prompt)?;
    let engine = OpenRouterEngine::from_config(&config)?;
    let launcher = launcher_from_settings(&config.settings.browser)?;
    let mut dispatcher = ToolDispatcher::new(&config.working_directory, launcher);

    print_banner(&config, &options);
    let cancel = CancelToken::new();
    let lock_path = ProjectPaths::new(&config.working_directory).lock_path;
    install_interrupt_handler(cancel.clone(), move || lock::release_if_owned(&lock_path))?;

    let outcome = orchestrator::run(&config, &engine, &mut dispatcher, &options, &cancel)?;
    print_summary(&config, &outcome);
    Ok(outcome.stop.exit_code())
}

fn print_banner(config: &AgentConfig, options: &RunOptions) {
    println!("{}", "=".repeat(70));
    println!("  AUTOPILOT");
    println!("{}", "=".repeat(70));
    println!("Project directory: {}", config.working_directory.display());
    println!("Model: {}", config.model_identifier);
    match options.max_sessions {
        Some(max) => println!("Max sessions: {max}"),
        None => println!("Max sessions: unlimited (runs until the task list passes)"),
    }
    println!("Tool calls per session: {}", config.max_tool_calls);
    if !config.sandbox_enabled {
        println!("WARNING: command sandbox disabled");
    }
    println!();
}

fn print_summary(config: &AgentConfig, outcome: &RunOutcome) {
    println!();
    println!("{}", "=".repeat(70));
    println!("  RUN {}", outcome.stop.as_str().to_uppercase());
    println!("{}", "=".repeat(70));
    println!("Sessions this run: {}", outcome.sessions_run);
    println!("Elapsed: {:.1}s", outcome.elapsed.as_secs_f64());
    println!("Progress: {}", outcome.progress.summary_line());
    if let Some(error) = &outcome.error {
        println!("Error: {error}");
    }
    match outcome.stop {
        StopReason::Cancelled => {
            println!("\nPaused. To resume, run the same command again.");
        }
        _ => {
            println!("\nTo run the generated application:");
            println!("  cd {}", config.working_directory.display());
            println!("  ./init.sh           # or: npm install && npm run dev");
        }
    }
}

fn cmd_check_command(config_path: Option<&Path>, command: &str) -> Result<i32> {
    let allowed = match config_path {
        Some(path) => {
            load_config(path)
                .map_err(|err| ConfigError::Invalid(format!("{err:#}")))?
                .allowed_commands
        }
        None => default_allowed_commands(),
    };
    let verdict = validate(command, &allowed);
    if verdict.allowed {
        println!("allowed: {}", verdict.reason);
        Ok(exit_codes::OK)
    } else {
        println!("denied: {}", verdict.reason);
        Ok(exit_codes::INVALID)
    }
}

fn cmd_progress(requested: &Path) -> Result<i32> {
    let project_dir = resolve_project_dir(requested);
    let store = ProgressStore::new(&project_dir);
    let tasks = store
        .load_tasks()?
        .with_context(|| format!("no feature_list.json in {}", project_dir.display()))?;
    let snapshot = ProgressSnapshot::from_tasks(&tasks);
    println!("{}", snapshot.summary_line());
    for summary in &snapshot.remaining_task_summaries {
        println!("  - {summary}");
    }
    Ok(exit_codes::OK)
}

fn cmd_init(requested: &Path, config_path: &Path, force: bool) -> Result<i32> {
    let project_dir = resolve_project_dir(requested);
    let paths = init_project(&project_dir, config_path, &InitOptions { force })?;
    println!("wrote {}", config_path.display());
    println!("created {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_unlock(requested: &Path, force: bool) -> Result<i32> {
    let paths = ProjectPaths::new(resolve_project_dir(requested));
    let existed = paths.lock_path.exists();
    match lock::clear(&paths.lock_path, force)? {
        Some(holder) => println!(
            "removed {} (held by {})",
            paths.lock_path.display(),
            holder.describe()
        ),
        None if existed => println!("removed {}", paths.lock_path.display()),
        None => println!("no lock at {}", paths.lock_path.display()),
    }
    Ok(exit_codes::OK)
}
