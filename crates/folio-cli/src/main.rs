mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use folio_common::{Error, MigrationId};
use folio_config::{AppConfig, ConfigLoader, LogConfig};
use folio_db::{Migrator, RollbackOptions, RollbackTarget, source};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "folio", version, about = "Schema migrations for the folio site database")]
struct Cli {
    /// Config file (yml, yaml or toml)
    #[arg(long, global = true, env = "FOLIO_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `folio_db=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply every pending migration as one batch
    Latest {
        #[arg(long)]
        json: bool,
    },
    /// Apply the next pending migration
    Up {
        #[arg(long)]
        json: bool,
    },
    /// Roll back the newest applied migration
    Down {
        #[arg(long)]
        allow_lossy: bool,
        #[arg(long)]
        json: bool,
    },
    /// Roll back the last batch, everything after a migration, or everything
    Rollback {
        /// Keep this migration and everything older applied
        #[arg(long, conflicts_with = "all")]
        to: Option<MigrationId>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        allow_lossy: bool,
        #[arg(long)]
        json: bool,
    },
    /// List pending or applied migrations
    List {
        #[arg(value_enum)]
        which: ListKind,
        #[arg(long)]
        json: bool,
    },
    /// Show every known migration and its state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Create an empty up/down pair in the migrations directory
    Make {
        /// snake_case name, e.g. add_habit_streaks
        name: String,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ListKind {
    Pending,
    Applied,
}

impl Command {
    fn rollback_target(to: Option<MigrationId>, all: bool) -> RollbackTarget {
        match (to, all) {
            (Some(id), _) => RollbackTarget::To(id),
            (None, true) => RollbackTarget::All,
            (None, false) => RollbackTarget::LastBatch,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(id) = err.downcast_ref::<Error>().and_then(Error::identifier) {
                eprintln!("migration: {id}");
            }
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let (mut config, source) = loader.load().context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.log_json {
        config.log.json = true;
    }
    init_tracing(&config.log)?;

    match &source {
        Some(path) => debug!("configuration from {}", path.display()),
        None => debug!("no configuration file, using defaults"),
    }

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Make { name } => make(&config, &name),
        Command::Latest { json } => {
            with_migrator(&config, move |m| output::migration_report(&m.migrate_latest()?, json))
                .await
        }
        Command::Up { json } => {
            with_migrator(&config, move |m| output::migration_report(&m.migrate_up()?, json)).await
        }
        Command::Down { allow_lossy, json } => {
            with_migrator(&config, move |m| {
                let report = m.rollback(&RollbackTarget::Last, RollbackOptions { allow_lossy })?;
                output::rollback_report(&report, json)
            })
            .await
        }
        Command::Rollback {
            to,
            all,
            allow_lossy,
            json,
        } => {
            let target = Command::rollback_target(to, all);
            with_migrator(&config, move |m| {
                let report = m.rollback(&target, RollbackOptions { allow_lossy })?;
                output::rollback_report(&report, json)
            })
            .await
        }
        Command::List { which, json } => {
            with_migrator(&config, move |m| match which {
                ListKind::Pending => output::pending(&m.pending()?, json),
                ListKind::Applied => output::applied(&m.applied()?, json),
            })
            .await
        }
        Command::Status { json } => {
            with_migrator(&config, move |m| output::status(&m.status()?, json)).await
        }
    }
}

fn init_tracing(log: &LogConfig) -> Result<()> {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .with_context(|| format!("invalid log level {:?}", log.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

/// Run `work` on a blocking thread. Ctrl-C interrupts the running statement
/// and stops the migrator before its next step.
async fn with_migrator<F>(config: &AppConfig, work: F) -> Result<()>
where
    F: FnOnce(&Migrator) -> Result<()> + Send + 'static,
{
    let migrator = Arc::new(Migrator::from_config(config)?);

    let watcher = Arc::clone(&migrator);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current statement");
            watcher.interrupt();
        }
    });

    let worker = Arc::clone(&migrator);
    let outcome = tokio::task::spawn_blocking(move || work(&worker)).await;
    ctrl_c.abort();
    outcome.context("migration task failed")?
}

fn make(config: &AppConfig, name: &str) -> Result<()> {
    let dir = config.migrations.directory.as_deref().context(
        "migrations.directory is not configured; set it in the config file or FOLIO_MIGRATIONS_DIR",
    )?;
    let known = source::load_configured(&config.migrations)?;
    let (id, up, down) = source::create_migration(dir, name, &known, Utc::now())?;
    info!(identifier = %id, "created migration");
    println!("{}", up.display());
    println!("{}", down.display());
    Ok(())
}

/// Process exit status for a failed run, one per error class.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::OrderingConflict { .. }) => 2,
        Some(Error::ApplyFailure { .. }) => 3,
        Some(Error::RollbackFailure { .. }) => 4,
        Some(Error::LedgerDivergence { .. } | Error::ChecksumMismatch { .. }) => 5,
        Some(Error::LossyRollback { .. }) => 6,
        Some(Error::Cancelled { .. }) => 130,
        _ => 1,
    }
}
