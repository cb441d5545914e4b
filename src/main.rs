//! Cirrus CLI entrypoint.
//!
//! This is the main entrypoint for the cirrus command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cirrus::cli::{Cli, Commands, OutputFormatter, StateCommands};
use cirrus::config::{
    ConfigParser, ConfigValidator, ResourceId, StackConfig, StateBackend, find_config_file,
};
use cirrus::engine::Engine;
use cirrus::error::{CirrusError, ConfigError, Result};
use cirrus::graph::ResourceGraph;
use cirrus::planner::{ApplyReport, ChangeAction, Plan};
use cirrus::provider::ProviderRegistry;
use cirrus::state::{
    LocalStateStorage, S3StateStorage, STATE_DIR, StateStorage, StateStore, generate_holder_id,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the `--verbose` default.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => {
            cmd_validate(config, warnings, &formatter).map(|()| ExitCode::SUCCESS)
        }
        Commands::Graph => cmd_graph(config, &formatter).map(|()| ExitCode::SUCCESS),
        Commands::Plan { out, refresh, detailed } => {
            cmd_plan(config, out.as_deref(), refresh, detailed, &formatter)
                .await
                .map(|()| ExitCode::SUCCESS)
        }
        Commands::Apply { plan, yes, refresh } => {
            cmd_apply(config, plan.as_deref(), yes, refresh, cancel, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, yes, cancel, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter)
            .await
            .map(|()| ExitCode::SUCCESS),
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Cirrus stack in: {}", path.display());

    let config_path = path.join("cirrus.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/cirrus.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Cirrus")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your secrets");
    eprintln!("  2. Edit cirrus.yaml to declare your resources");
    eprintln!("  3. Run 'cirrus validate' to check the stack");
    eprintln!("  4. Run 'cirrus plan' to see what will change");
    eprintln!("  5. Run 'cirrus apply' to provision");

    Ok(())
}

/// Validate configuration and the resource graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (base_dir, config) = load_config(config_path)?;
    let registry = sandbox_registry(&config, &base_dir);

    let result = ConfigValidator::with_registry(&registry).validate(&config)?;
    let graph = ResourceGraph::build(&config.resources)?;
    debug!("Graph has {} resources", graph.len());

    println!("{}", formatter.format_validation(&config, &result, show_warnings));
    Ok(())
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (_, config) = load_config(config_path)?;
    let graph = ResourceGraph::build(&config.resources)?;

    print!("{}", formatter.format_graph(&graph));
    Ok(())
}

/// Show the plan, optionally saving it.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    out: Option<&Path>,
    refresh: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let engine = open_engine(config_path, CancellationToken::new()).await?;
    let plan = engine.plan(refresh).await?;

    println!("{}", formatter.format_plan(&plan, detailed));

    if let Some(out) = out {
        std::fs::write(out, plan.to_json()?)?;
        eprintln!(
            "Plan saved to {}. Apply it with 'cirrus apply --plan {}'.",
            out.display(),
            out.display()
        );
    }

    Ok(())
}

/// Apply a fresh or saved plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    plan_path: Option<&Path>,
    auto_approve: bool,
    refresh: bool,
    cancel: CancellationToken,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = open_engine(config_path, cancel.clone()).await?;

    let plan = match plan_path {
        Some(path) => {
            info!("Loading plan from {}", path.display());
            Plan::from_json(&std::fs::read_to_string(path)?)?
        }
        None => engine.plan(refresh).await?,
    };

    if !plan.has_changes() {
        eprintln!("No changes to apply.");
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(&plan, false));
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = apply_locked(&engine, &plan, &cancel).await?;

    println!("{}", formatter.format_report(&report));
    Ok(exit_code(report.is_success()))
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    cancel: CancellationToken,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = open_engine(config_path, cancel.clone()).await?;
    let plan = engine.plan_destroy().await?;

    if !plan.has_changes() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for change in plan.changes.iter().filter(|c| c.action == ChangeAction::Delete) {
        let provider_id = change.prior_provider_id.as_deref().unwrap_or("unknown");
        eprintln!("  - {} ({provider_id})", change.id);
    }

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = apply_locked(&engine, &plan, &cancel).await?;

    println!("{}", formatter.format_report(&report));
    Ok(exit_code(report.is_success()))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let engine = open_engine(config_path, CancellationToken::new()).await?;
    let report = engine.check_drift().await?;

    println!("{}", formatter.format_drift(&report));

    Ok(ExitCode::from(report.exit_status()))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    match command {
        StateCommands::Show => {
            let (base_dir, config) = load_config(config_path)?;
            let store = open_store(&config, &base_dir).await?;
            println!("{}", formatter.format_state(&store.snapshot().await));
        }
        StateCommands::List => {
            let (base_dir, config) = load_config(config_path)?;
            let store = open_store(&config, &base_dir).await?;
            print!("{}", formatter.format_records(&store.records().await));
        }
        StateCommands::Rm { id } => {
            let id = ResourceId::parse(&id)
                .map_err(|e| CirrusError::Config(ConfigError::validation_general(e)))?;
            let engine = open_engine(config_path, CancellationToken::new()).await?;
            let removed = engine.remove_record_locked(&id).await?;
            eprintln!(
                "Removed {} ({}) from state. The resource itself still exists.",
                removed.id, removed.provider_id
            );
        }
        StateCommands::Lock { holder } => {
            let storage = open_storage(config_path).await?;
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = storage.acquire_lock(&holder).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            let storage = open_storage(config_path).await?;
            if force {
                storage.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                storage.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the stack file with `.env`, overrides and secrets applied.
///
/// Returns the directory relative paths in the stack resolve against.
fn load_config(config_path: Option<&PathBuf>) -> Result<(PathBuf, StackConfig)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    Ok((base_dir, config))
}

/// Builds the sandbox provider registry for a stack.
fn sandbox_registry(config: &StackConfig, base_dir: &Path) -> ProviderRegistry {
    let root = config.sandbox.path.as_ref().map_or_else(
        || base_dir.join(STATE_DIR).join("sandbox"),
        |path| base_dir.join(path),
    );
    debug!("Sandbox resources live under {}", root.display());
    ProviderRegistry::sandbox(root)
}

/// Creates the state storage backend named in the stack file.
async fn create_storage(config: &StackConfig, base_dir: &Path) -> Result<Arc<dyn StateStorage>> {
    let storage: Arc<dyn StateStorage> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |path| base_dir.join(path));
            Arc::new(LocalStateStorage::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                CirrusError::Config(ConfigError::validation(
                    "S3 bucket not configured",
                    "state.bucket",
                ))
            })?;
            let storage = S3StateStorage::new(
                bucket,
                config.state.prefix.as_deref(),
                config.state.region.as_deref(),
            )
            .await?;
            Arc::new(storage)
        }
    };

    debug!("Using {} state backend", storage.backend_type());
    Ok(storage)
}

/// Opens just the storage backend, for lock management.
async fn open_storage(config_path: Option<&PathBuf>) -> Result<Arc<dyn StateStorage>> {
    let (base_dir, config) = load_config(config_path)?;
    create_storage(&config, &base_dir).await
}

/// Opens the state store for a stack.
async fn open_store(config: &StackConfig, base_dir: &Path) -> Result<Arc<StateStore>> {
    let storage = create_storage(config, base_dir).await?;
    let store = StateStore::open(storage, &config.project.name, &config.project.environment).await?;
    Ok(Arc::new(store))
}

/// Loads the stack and opens an engine over its providers and state.
async fn open_engine(config_path: Option<&PathBuf>, cancel: CancellationToken) -> Result<Engine> {
    let (base_dir, config) = load_config(config_path)?;
    let registry = Arc::new(sandbox_registry(&config, &base_dir));
    let store = open_store(&config, &base_dir).await?;

    Ok(Engine::new(config, registry, store)?.with_cancellation(cancel))
}

/// Applies a plan under the state lock. Ctrl-C cancels `cancel` from here on.
async fn apply_locked(
    engine: &Engine,
    plan: &Plan,
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight changes to finish");
            token.cancel();
        }
    });

    engine.apply_locked(plan).await
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

const fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
