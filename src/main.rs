use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod anchor;
use anchor::{AnchorNotifier, HttpAnchorNotifier, NoOpAnchorNotifier};

mod chart_store;
use chart_store::SqliteChartStore;

mod config;
use config::{AppConfig, CliConfig, FileConfig};

mod identity;
use identity::IdentityResolver;

mod ingest;
use ingest::{IngestOptions, ReportIngestor};

mod ranking;
use ranking::{AggregateOptions, RankingAggregator};

mod registry_store;
use registry_store::SqliteRegistryStore;

mod sync;
use sync::StoreSynchronizer;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[clap(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
struct CliArgs {
    /// Directory holding the registry and chart databases.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory holding the vendor report archive.
    #[clap(long, value_parser = parse_path)]
    pub archive_dir: Option<PathBuf>,

    /// Optional TOML config file; its values override the CLI.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// URL of the anchoring/notification service.
    #[clap(long)]
    pub anchor_url: Option<String>,

    /// Timeout in seconds for anchoring calls.
    #[clap(long, default_value_t = 10)]
    pub anchor_timeout_sec: u64,

    #[clap(subcommand)]
    pub command: Command,
}

/// Flags every stage accepts. Stages without window/file iteration accept
/// and ignore the bounding flags so invocations stay uniform across a
/// scheduler.
#[derive(Args, Debug, Default)]
struct StageArgs {
    /// Recompute data that already exists.
    #[clap(long)]
    pub force: bool,

    /// Reload prior-rank state and continue from the latest existing window.
    #[clap(long)]
    pub resume: bool,

    /// Process at most N files/windows.
    #[clap(long)]
    pub limit: Option<usize>,

    /// Skip the first N files/windows.
    #[clap(long, default_value_t = 0)]
    pub offset: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse vendor report files into staging rows.
    Ingest(StageArgs),
    /// Resolve staged rows to canonical identities and run maintenance.
    Resolve(StageArgs),
    /// Aggregate resolved rows into weekly ranking windows.
    Aggregate(StageArgs),
    /// Refresh the chart store's identity mirror.
    Sync(StageArgs),
    /// Run ingest, resolve, sync and aggregate in order.
    Run(StageArgs),
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let config = AppConfig::resolve(
        &CliConfig {
            db_dir: cli_args.db_dir.clone(),
            archive_dir: cli_args.archive_dir.clone(),
            anchor_url: cli_args.anchor_url.clone(),
            anchor_timeout_sec: cli_args.anchor_timeout_sec,
        },
        file_config,
    )?;

    info!("Opening registry database at {:?}...", config.registry_db_path());
    let registry = SqliteRegistryStore::open(&config.registry_db_path())?;
    info!("Opening chart database at {:?}...", config.charts_db_path());
    let charts = SqliteChartStore::open(&config.charts_db_path())?;

    let anchor: Box<dyn AnchorNotifier> = match &config.anchor_url {
        Some(url) => {
            info!("Anchoring service configured at {}", url);
            Box::new(HttpAnchorNotifier::new(
                url.clone(),
                config.anchor_timeout_sec,
            )?)
        }
        None => Box::new(NoOpAnchorNotifier),
    };

    match &cli_args.command {
        Command::Ingest(args) => {
            run_ingest(&config, &registry, anchor.as_ref(), args)?;
        }
        Command::Resolve(_) => {
            IdentityResolver::new(&registry, &charts).run()?;
        }
        Command::Aggregate(args) => {
            RankingAggregator::new(&registry, &charts).run(&aggregate_options(args))?;
        }
        Command::Sync(_) => {
            StoreSynchronizer::new(&registry, &charts).run()?;
        }
        Command::Run(args) => {
            run_ingest(&config, &registry, anchor.as_ref(), args)?;
            IdentityResolver::new(&registry, &charts).run()?;
            // The mirror must hold any freshly created ghosts before their
            // rankings become visible.
            StoreSynchronizer::new(&registry, &charts).run()?;
            RankingAggregator::new(&registry, &charts).run(&aggregate_options(args))?;
        }
    }

    Ok(())
}

fn run_ingest(
    config: &AppConfig,
    registry: &SqliteRegistryStore,
    anchor: &dyn AnchorNotifier,
    args: &StageArgs,
) -> Result<()> {
    let archive_dir = config
        .archive_dir
        .as_deref()
        .context("--archive-dir (or archive_dir in the config file) is required for ingestion")?;
    ReportIngestor::new(registry, anchor).run(
        archive_dir,
        &IngestOptions {
            force: args.force,
            offset: args.offset,
            limit: args.limit,
        },
    )?;
    Ok(())
}

fn aggregate_options(args: &StageArgs) -> AggregateOptions {
    AggregateOptions {
        force: args.force,
        resume: args.resume,
        offset: args.offset,
        limit: args.limit,
    }
}
