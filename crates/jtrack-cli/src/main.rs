use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jtrack_reconcile::{
    write_reports, BackfillTimestamp, Category, CategoryRegistry, ConfigError, CounterpartRepair,
    PassResult, ReconcileConfig, ReconcileRequest, Reconciler, RepairPolicy, ScopeFilter,
};
use jtrack_storage::{PgGateway, StorageGateway};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const EXIT_STORAGE: i32 = 2;
const EXIT_CONFIG: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "jtrack")]
#[command(about = "Job tracker integrity reconciliation")]
struct Cli {
    /// Report findings without mutating anything.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Refuse to repair when a pass plans more than N mutations.
    #[arg(long, global = true, value_name = "N")]
    max: Option<usize>,
    #[arg(long, global = true, value_name = "now|null")]
    backfill_timestamp: Option<BackfillTimestamp>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    no_reports: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Remove redundant applications, keeping the earliest per job.
    Duplicates,
    /// Remove rows whose foreign key points at nothing.
    Orphans,
    /// Backfill (or purge) jobs that have no application.
    Missing {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_name = "backfill|purge")]
        repair: Option<CounterpartRepair>,
    },
    /// Remove jobs with a null or blank title.
    InvalidJobs,
    /// Remove every job from one source.
    PurgeSource {
        #[arg(long)]
        source: String,
    },
    /// Remove the newest N jobs.
    PurgeRecent {
        #[arg(long)]
        limit: usize,
    },
    ExpiredCache,
    UndatedApplications,
    TestData,
    /// Run a built-in category or an alias from the categories file.
    Run {
        name: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_name = "backfill|purge")]
        repair: Option<CounterpartRepair>,
    },
    /// Dry-run every category that needs no scope.
    Diagnose,
    /// List built-in categories and configured aliases.
    Categories,
}

impl Commands {
    /// Name plus the scope and repair flags given on the command line.
    fn target(&self) -> Option<(String, ScopeFilter, Option<CounterpartRepair>)> {
        let builtin = |category: Category| Some((category.name().to_string(), ScopeFilter::default(), None));
        match self {
            Commands::Duplicates => builtin(Category::Duplicates),
            Commands::Orphans => builtin(Category::Orphans),
            Commands::Missing { limit, repair } => Some((
                Category::Missing.name().to_string(),
                ScopeFilter {
                    source: None,
                    limit: *limit,
                },
                *repair,
            )),
            Commands::InvalidJobs => builtin(Category::InvalidJobs),
            Commands::PurgeSource { source } => Some((
                Category::PurgeSource.name().to_string(),
                ScopeFilter {
                    source: Some(source.clone()),
                    limit: None,
                },
                None,
            )),
            Commands::PurgeRecent { limit } => Some((
                Category::PurgeRecent.name().to_string(),
                ScopeFilter {
                    source: None,
                    limit: Some(*limit),
                },
                None,
            )),
            Commands::ExpiredCache => builtin(Category::ExpiredCache),
            Commands::UndatedApplications => builtin(Category::UndatedApplications),
            Commands::TestData => builtin(Category::TestData),
            Commands::Run {
                name,
                source,
                limit,
                repair,
            } => Some((
                name.clone(),
                ScopeFilter {
                    source: source.clone(),
                    limit: *limit,
                },
                *repair,
            )),
            Commands::Diagnose | Commands::Categories => None,
        }
    }
}

fn requested_policy(cli: &Cli, config: &ReconcileConfig) -> RepairPolicy {
    if cli.dry_run {
        RepairPolicy::DryRun
    } else if let Some(max) = cli.max {
        RepairPolicy::ConfirmAboveThreshold { max }
    } else {
        config.default_policy()
    }
}

fn build_requests(
    cli: &Cli,
    config: &ReconcileConfig,
    registry: &CategoryRegistry,
) -> Result<Vec<ReconcileRequest>, ConfigError> {
    if let Commands::Diagnose = cli.command {
        return Ok(Category::ALL
            .into_iter()
            .map(|category| ReconcileRequest::new(category, RepairPolicy::DryRun))
            .filter(|request| request.validate().is_ok())
            .collect());
    }
    match cli.command.target() {
        Some((name, scope, repair)) => registry
            .resolve(&name, &scope, requested_policy(cli, config), repair)
            .map(|request| vec![request]),
        None => Ok(Vec::new()),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(cli: Cli) -> Result<i32> {
    let mut config = match ReconcileConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return Ok(EXIT_CONFIG);
        }
    };
    if let Some(dir) = &cli.reports_dir {
        config.reports_dir = dir.clone();
    }
    if let Some(timestamp) = cli.backfill_timestamp {
        config.backfill_timestamp = timestamp;
    }

    let registry = match &config.categories_file {
        Some(path) => match CategoryRegistry::load(path) {
            Ok(registry) => registry,
            Err(err) => {
                eprintln!("invalid configuration: {err:#}");
                return Ok(EXIT_CONFIG);
            }
        },
        None => CategoryRegistry::default(),
    };

    if let Commands::Categories = cli.command {
        for name in registry.names() {
            match registry.aliases.get(&name) {
                Some(alias) => println!(
                    "{name} -> {}{}",
                    alias.category,
                    alias
                        .description
                        .as_deref()
                        .map(|d| format!("  ({d})"))
                        .unwrap_or_default()
                ),
                None => println!("{name}"),
            }
        }
        return Ok(0);
    }

    let requests = match build_requests(&cli, &config, &registry) {
        Ok(requests) => requests,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return Ok(EXIT_CONFIG);
        }
    };

    let Some(database_url) = config.database_url.clone() else {
        eprintln!("invalid configuration: DATABASE_URL is not set");
        return Ok(EXIT_CONFIG);
    };
    let gateway: Arc<dyn StorageGateway> = match PgGateway::connect(&database_url).await {
        Ok(gateway) => Arc::new(gateway),
        Err(err) => {
            eprintln!("storage unreachable: {err:#}");
            return Ok(EXIT_STORAGE);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing the current unit");
            on_signal.cancel();
        }
    });

    let reconciler = Reconciler::new(Arc::clone(&gateway), config.clone()).with_cancellation(cancel);
    let results = if let [request] = requests.as_slice() {
        vec![reconciler.run(request.clone()).await]
    } else {
        reconciler.run_many(requests).await
    };
    gateway.close().await;

    for result in &results {
        report(result, &config, cli.no_reports).await;
    }
    Ok(results
        .iter()
        .map(PassResult::exit_code)
        .find(|code| *code != 0)
        .unwrap_or(0))
}

async fn report(result: &PassResult, config: &ReconcileConfig, no_reports: bool) {
    for line in result.summary.console_lines() {
        println!("{line}");
    }
    if let Some(err) = &result.error {
        eprintln!("{}: {err}", result.summary.category);
    }
    if no_reports {
        return;
    }
    match write_reports(&config.reports_dir, &result.summary).await {
        Ok(dir) => println!("reports: {}", dir.display()),
        Err(err) => tracing::warn!(error = %format!("{err:#}"), "failed to write reports"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            EXIT_STORAGE
        }
    };
    std::process::exit(code);
}
