//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use toolpipe_core::{
    AuditSink, Coordinator, FactoryContext, MemorySink, PipelineFactory, PipelineObserver,
    RegistryResolver,
};
use toolpipe_shared::{
    AppConfig, TaskId, ToolpipeError, expand_home, init_config, load_config, load_config_from,
};
use toolpipe_storage::Storage;

use crate::tools;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// toolpipe — route requests through sequential tool pipelines.
#[derive(Parser)]
#[command(
    name = "toolpipe",
    version,
    about = "Route requests through sequential tool pipelines and chain them.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.toolpipe/toolpipe.toml).
    #[arg(long, env = "TOOLPIPE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Route a request to one pipeline and run it.
    Run {
        /// Request text; used as both the initial content and the user context.
        request: String,

        /// Task id (defaults to a fresh UUID).
        #[arg(long)]
        task_id: Option<String>,

        /// Preferred pipeline; falls back to keyword routing if not registered.
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Keep tool results in memory instead of the audit database.
        #[arg(long)]
        no_store: bool,
    },

    /// Run several pipelines in order, feeding each one's output to the next.
    Chain {
        /// Request text passed to the first pipeline.
        request: String,

        /// Pipelines to run, comma-separated.
        #[arg(long, value_delimiter = ',', required = true)]
        pipelines: Vec<String>,

        /// Task id (defaults to a fresh UUID).
        #[arg(long)]
        task_id: Option<String>,

        /// Keep tool results in memory instead of the audit database.
        #[arg(long)]
        no_store: bool,
    },

    /// List registered pipelines and their stages.
    Capabilities,

    /// Show recorded tool results for a task.
    Audit {
        /// Task id to look up.
        #[arg(long)]
        task_id: String,

        /// Include chain hops (`<task_id>_<pipeline>`).
        #[arg(long)]
        hops: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "toolpipe=info",
        1 => "toolpipe=debug",
        _ => "toolpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so stdout stays a clean JSON report.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            request,
            task_id,
            pipeline,
            no_store,
        } => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_run(&config, &request, task_id, pipeline.as_deref(), no_store).await
        }
        Command::Chain {
            request,
            pipelines,
            task_id,
            no_store,
        } => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_chain(&config, &request, &pipelines, task_id, no_store).await
        }
        Command::Capabilities => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_capabilities(&config).await
        }
        Command::Audit { task_id, hops } => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_audit(&config, &task_id, hops).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_ref()).await,
        },
    }
}

fn resolve_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Build the coordinator for `config` with the built-in tools.
async fn build_coordinator(
    config: &AppConfig,
    no_store: bool,
    observer: Arc<dyn PipelineObserver>,
) -> Result<Arc<Coordinator>> {
    let sink: Arc<dyn AuditSink> = if no_store || !config.audit.enabled {
        debug!("audit results kept in memory");
        Arc::new(MemorySink::new())
    } else {
        let path = expand_home(&config.audit.db_path)?;
        debug!(path = %path.display(), "opening audit database");
        Arc::new(Storage::open(&path).await?)
    };

    let tools = tools::builtin_registry();
    let resolver = Arc::new(RegistryResolver::new(
        tools.clone(),
        config.conversion.converters.clone(),
    ));
    let ctx = FactoryContext::new(tools, resolver, sink).configured(config);
    let coordinator = Arc::new(
        PipelineFactory::new(ctx)
            .coordinator(config)?
            .with_observer(observer),
    );

    let on_interrupt = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight stages");
            on_interrupt.cancel_all();
        }
    });

    Ok(coordinator)
}

fn task_id_or_new(task_id: Option<String>) -> TaskId {
    task_id.map(TaskId::new).unwrap_or_else(TaskId::generate)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_run(
    config: &AppConfig,
    request: &str,
    task_id: Option<String>,
    pipeline: Option<&str>,
    no_store: bool,
) -> Result<()> {
    let progress = Arc::new(CliProgress::new());
    let coordinator = build_coordinator(config, no_store, progress.clone()).await?;
    let task_id = task_id_or_new(task_id);

    info!(task_id = %task_id, preferred = pipeline, "running request");
    let outcome = coordinator
        .route_and_execute(request, &task_id, pipeline)
        .await;
    progress.finish();

    match outcome {
        Ok(run) => print_json(&run.to_report()),
        Err(failure) => {
            print_json(&failure.to_report())?;
            Err(failure.into())
        }
    }
}

async fn cmd_chain(
    config: &AppConfig,
    request: &str,
    pipelines: &[String],
    task_id: Option<String>,
    no_store: bool,
) -> Result<()> {
    let progress = Arc::new(CliProgress::new());
    let coordinator = build_coordinator(config, no_store, progress.clone()).await?;
    let task_id = task_id_or_new(task_id);

    info!(task_id = %task_id, ?pipelines, "running chain");
    let outcome = coordinator
        .execute_sequential(request, &task_id, pipelines)
        .await;
    progress.finish();

    match outcome {
        Ok(chain) => print_json(&chain.to_report()),
        Err(failure) => {
            print_json(&failure.to_report())?;
            Err(failure.into())
        }
    }
}

async fn cmd_capabilities(config: &AppConfig) -> Result<()> {
    // Listing never runs a tool, so nothing needs persisting.
    let observer = Arc::new(toolpipe_core::SilentObserver);
    let coordinator = build_coordinator(config, true, observer).await?;
    let capabilities = coordinator.list_capabilities();
    print_json(&serde_json::to_value(&capabilities)?)
}

async fn cmd_audit(config: &AppConfig, task_id: &str, hops: bool) -> Result<()> {
    let path = expand_home(&config.audit.db_path)?;
    let storage = Storage::open_readonly(&path).await?;

    let records = if hops {
        storage.stage_results_with_prefix(task_id).await?
    } else {
        storage.stage_results(task_id).await?
    };

    info!(task_id, count = records.len(), "loaded audit records");
    print_json(&serde_json::to_value(&records)?)
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Stage progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl PipelineObserver for CliProgress {
    fn stage_started(&self, pipeline: &str, stage: &str, _task_id: &TaskId) {
        self.spinner.set_message(format!("{pipeline}: {stage}"));
    }

    fn stage_skipped(&self, pipeline: &str, stage: &str, _task_id: &TaskId) {
        self.spinner
            .set_message(format!("{pipeline}: {stage} (skipped)"));
    }

    fn stage_completed(&self, pipeline: &str, stage: &str, _task_id: &TaskId, elapsed: Duration) {
        self.spinner.set_message(format!(
            "{pipeline}: {stage} done in {}ms",
            elapsed.as_millis()
        ));
    }

    fn stage_failed(&self, pipeline: &str, stage: &str, _task_id: &TaskId, error: &ToolpipeError) {
        self.spinner
            .set_message(format!("{pipeline}: {stage} failed ({})", error.kind()));
    }
}
