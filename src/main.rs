/// Version injected at compile time via GRAPHRECON_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("GRAPHRECON_VERSION") {
    Some(v) => v,
    None => "dev",
};

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use graphrecon::config::Config;
use graphrecon::graph::{describe_error, GraphClient, GraphHttpClient};
use graphrecon::resource::registry::{init_registry, Registry};
use graphrecon::engine::collect_listing;
use graphrecon::{Diagnostics, Engine, Filter, OperationContext};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Declarative reconciliation for OData-flavored REST APIs
#[derive(Parser, Debug)]
#[command(name = "graphrecon", version = VERSION, about, long_about = None)]
struct Args {
    /// API root URL
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "GRAPHRECON_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Directory with resource declarations (repeatable)
    #[arg(long = "spec-dir")]
    spec_dirs: Vec<PathBuf>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an entity from a desired value
    Create(WriteArgs),
    /// Read an entity identified by a state value
    Read(StateArgs),
    /// Update an entity from desired and prior values
    Update(WriteArgs),
    /// Delete an entity identified by a state value
    Delete(StateArgs),
    /// List a collection
    List(ListArgs),
    /// Show registered resource types
    Resources,
    /// Persist settings to the config file
    Config(ConfigArgs),
}

#[derive(ClapArgs, Debug)]
struct WriteArgs {
    resource: String,
    /// JSON file with the desired value
    #[arg(long)]
    desired: PathBuf,
    /// JSON file with the prior state (update)
    #[arg(long)]
    prior: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct StateArgs {
    resource: String,
    /// JSON file with the prior state
    #[arg(long)]
    prior: Option<PathBuf>,
    /// Entity id
    #[arg(long)]
    id: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct ListArgs {
    resource: String,
    /// Equality condition `field=value` (repeatable)
    #[arg(long = "filter")]
    filters: Vec<String>,
    /// JSON file with parent values for nested collections
    #[arg(long)]
    parent: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct ConfigArgs {
    /// Per-call timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// User agent
    #[arg(long)]
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("graphrecon {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("graphrecon").join("graphrecon.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".graphrecon").join("graphrecon.log");
    }
    PathBuf::from("graphrecon.log")
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn load_registry(dirs: &[PathBuf]) -> Result<Registry> {
    let mut builder = Registry::builder();
    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!("Skipping missing spec dir {}", dir.display());
            continue;
        }
        builder = builder.load_dir(dir)?;
    }
    Ok(builder.build()?)
}

fn print_result(value: &Value, diagnostics: &Diagnostics) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    for diagnostic in diagnostics.iter() {
        eprintln!("{}", diagnostic);
    }
    Ok(())
}

/// Run an engine call, printing diagnostics even when it fails
fn finish<T>(result: graphrecon::Result<T>, diagnostics: &Diagnostics) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            for diagnostic in diagnostics.iter() {
                eprintln!("{}", diagnostic);
            }
            tracing::error!("{}", e);
            bail!(describe_error(&e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let mut config = Config::load();

    if let Command::Config(settings) = &args.command {
        if let Some(url) = &args.base_url {
            config.base_url = Some(url.clone());
        }
        if let Some(secs) = settings.timeout_secs {
            config.timeout_secs = Some(secs);
        }
        if let Some(agent) = &settings.user_agent {
            config.user_agent = Some(agent.clone());
        }
        for dir in &args.spec_dirs {
            if !config.spec_dirs.contains(dir) {
                config.spec_dirs.push(dir.clone());
            }
        }
        config.save()?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let registry = init_registry(load_registry(&config.effective_spec_dirs(&args.spec_dirs))?)?;

    if let Command::Resources = &args.command {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let Some(token) = args.token.as_deref() else {
        bail!("No token. Pass --token or set GRAPHRECON_TOKEN.");
    };
    let http = GraphHttpClient::new(config.effective_timeout(), &config.effective_user_agent())?;
    let client = GraphClient::new(&config.effective_base_url(args.base_url.as_deref()), token, http)?;
    let engine = Engine::new(client, registry);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match args.command {
        Command::Create(write) => {
            let mut ctx = OperationContext::create(&write.resource, read_json(&write.desired)?)
                .with_cancellation(cancel);
            let result = engine.create(&mut ctx).await;
            let value = finish(result, &ctx.diagnostics)?;
            print_result(&value, &ctx.diagnostics)?;
        }
        Command::Update(write) => {
            let Some(prior) = &write.prior else {
                bail!("update requires --prior");
            };
            let mut ctx = OperationContext::update(&write.resource, read_json(&write.desired)?, read_json(prior)?)
                .with_cancellation(cancel);
            let result = engine.update(&mut ctx).await;
            let value = finish(result, &ctx.diagnostics)?;
            print_result(&value, &ctx.diagnostics)?;
        }
        Command::Read(state) => {
            let prior = match &state.prior {
                Some(path) => read_json(path)?,
                None => json!({}),
            };
            let mut ctx = OperationContext::read(&state.resource, prior).with_cancellation(cancel);
            if let Some(id) = &state.id {
                ctx = ctx.with_id(id);
            }
            let result = engine.read(&mut ctx).await;
            let value = finish(result, &ctx.diagnostics)?.unwrap_or(Value::Null);
            print_result(&value, &ctx.diagnostics)?;
        }
        Command::Delete(state) => {
            let prior = match &state.prior {
                Some(path) => read_json(path)?,
                None => json!({}),
            };
            let mut ctx = OperationContext::delete(&state.resource, prior).with_cancellation(cancel);
            if let Some(id) = &state.id {
                ctx = ctx.with_id(id);
            }
            let result = engine.delete(&mut ctx).await;
            finish(result, &ctx.diagnostics)?;
            print_result(&json!({"deleted": true}), &ctx.diagnostics)?;
        }
        Command::List(list) => {
            let mut filter = Filter::default();
            for raw in &list.filters {
                filter.conditions.push(Filter::parse_condition(raw)?);
            }
            let parent = list.parent.as_deref().map(read_json).transpose()?;
            let listing = engine.list(&list.resource, parent.as_ref(), Some(filter))?;
            let (items, diagnostics) = collect_listing(listing).await?;
            print_result(&Value::Array(items), &diagnostics)?;
        }
        Command::Resources | Command::Config(_) => {}
    }

    Ok(())
}
