//! Halyard CLI entrypoint.
//!
//! This is the main entrypoint for the halyard command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use halyard::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use halyard::config::{ConfigParser, ConfigValidator, StackSpec, find_config_file};
use halyard::engine::{Engine, Goal, create_store};
use halyard::error::Result;
use halyard::executor::CancelHandle;
use halyard::model::GraphBuilder;
use halyard::planner::Plan;
use halyard::state::generate_holder_id;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr so stdout stays parseable.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point. Returns whether the command fully succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { all } => cmd_plan(config, all, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config, yes, Goal::Converge, &formatter).await,
        Commands::Destroy { yes } => cmd_apply(config, yes, Goal::Destroy, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate the stack document and its graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (stack, _) = load_stack(config_path)?;
    let result = ConfigValidator::new().validate(&stack)?;
    let graph = GraphBuilder::new().build_stack(&stack)?;
    debug!("Graph has {} node(s)", graph.len());

    emit(&formatter.format_validation(&stack, &result, show_warnings))?;
    Ok(true)
}

/// Show the plan without taking the lock.
async fn cmd_plan(config_path: Option<&Path>, show_all: bool, formatter: &OutputFormatter) -> Result<bool> {
    let engine = open_engine(config_path).await?;
    let plan = engine.plan(Goal::Converge).await?;
    emit(&formatter.format_plan(&plan, show_all))?;
    Ok(true)
}

/// Apply or destroy.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    goal: Goal,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let cancel = CancelHandle::new();
    let engine = open_engine(config_path).await?.with_cancel_handle(cancel.clone());

    let pending = engine.prepare(&generate_holder_id(), goal).await?;
    let approved = match review_plan(&pending.plan, goal, auto_approve, formatter) {
        Ok(approved) => approved,
        Err(e) => {
            if let Err(release) = engine.abandon(pending).await {
                warn!("Failed to release state lock: {release}");
            }
            return Err(e);
        }
    };
    if !approved {
        engine.abandon(pending).await?;
        return Ok(true);
    }

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received: waiting for in-flight calls, no new resources will start");
            cancel.cancel();
        }
    });

    let result = engine.execute(pending).await;
    watcher.abort();

    emit(&formatter.format_apply(&result))?;
    Ok(result.succeeded())
}

/// Shows the plan and asks for approval. Returns false if nothing should run.
fn review_plan(plan: &Plan, goal: Goal, auto_approve: bool, formatter: &OutputFormatter) -> Result<bool> {
    emit(&formatter.format_plan(plan, false))?;

    if plan.is_empty() {
        return Ok(false);
    }
    if auto_approve {
        return Ok(true);
    }

    let approved = match goal {
        Goal::Converge => confirm("Do you want to apply this plan? [y/N]: ", |s| s.eq_ignore_ascii_case("y"))?,
        Goal::Destroy => confirm("This action is IRREVERSIBLE. Type 'destroy' to confirm: ", |s| {
            s == "destroy"
        })?,
    };
    if !approved {
        eprintln!("Apply cancelled.");
    }
    Ok(approved)
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<bool> {
    let (stack, base_dir) = load_stack(config_path)?;
    let store = create_store(&stack.state, &base_dir).await?;

    match command {
        StateCommands::Show => {
            let snapshot = store.load().await?;
            let lock = store.get_lock_info().await?;
            emit(&formatter.format_state(&snapshot, lock.as_ref()))?;
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    store.release_lock(&lock.lock_id).await?;
                    emit(&formatter.format_message(true, "State forcefully unlocked"))?;
                } else {
                    emit(&formatter.format_message(true, "State is not locked"))?;
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.format_message(true, "State unlocked"))?;
            } else {
                emit(&formatter.format_message(false, "Provide --lock-id or use --force"))?;
                return Ok(false);
            }
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads and env-overrides the stack. Also returns the directory it lives in.
fn load_stack(config_path: Option<&Path>) -> Result<(StackSpec, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;
    let stack = parser.load_with_env(&config_file)?;
    Ok((stack, base_dir))
}

/// Loads, validates and opens the stack.
async fn open_engine(config_path: Option<&Path>) -> Result<Engine> {
    let (stack, base_dir) = load_stack(config_path)?;
    let validation = ConfigValidator::new().validate(&stack)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    info!(
        "Opening {} ({} resources)",
        stack.qualified_name(),
        stack.resources.len()
    );
    Engine::open(stack, &base_dir).await
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(accept(input.trim()))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}
