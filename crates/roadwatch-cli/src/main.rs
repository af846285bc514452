use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roadwatch_events::{EventStore, FsEventStore};
use roadwatch_reconcile::config::clamp_limit;
use roadwatch_reconcile::{
    LiveWatcher, ReconcileConfig, Reconciler, RunOptions, RunSummary, StartupToggles,
    WatcherOptions,
};
use roadwatch_storage::AggregateStore;
use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_DB_PATH: &str = "roadwatch.db";
const DEFAULT_EVENTS_DIR: &str = "events";
const LOG_FILE_NAME: &str = "roadwatch.log";

#[derive(Parser, Debug)]
#[command(name = "roadwatch")]
#[command(about = "Reconcile road sensor readings into grid aggregates", long_about = None)]
struct Cli {
    /// SQLite file holding the aggregated locations
    #[arg(long, global = true, default_value = "")]
    db: String,
    /// Directory backing the event store
    #[arg(long, global = true, default_value = "")]
    events_dir: String,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass and print its summary
    Sync {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        reprocess: bool,
        #[arg(long)]
        root: Option<String>,
    },
    /// Run the start-up sync, then watch for new readings until interrupted
    Serve {
        #[arg(long)]
        root: Option<String>,
    },
    /// Print aggregated locations, worst first
    Locations {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

struct MultiWriter {
    file: Option<Arc<Mutex<File>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&resolve_log_dir(&cli.log_dir), cli.debug);

    let db_path = resolve_path(&cli.db, "ROADWATCH_DB_PATH", DEFAULT_DB_PATH);
    let events_dir = resolve_path(&cli.events_dir, "ROADWATCH_EVENTS_DIR", DEFAULT_EVENTS_DIR);
    let mut config = ReconcileConfig::from_env();

    match cli.command {
        Commands::Sync {
            limit,
            dry_run,
            reprocess,
            root,
        } => {
            if let Some(root) = root {
                config.root_path = root;
            }
            let options = RunOptions {
                limit: clamp_limit(limit.unwrap_or(config.limit)),
                dry_run: dry_run || config.dry_run,
                reprocess: reprocess || config.reprocess,
            };
            let (events, aggregates) = open_stores(&events_dir, &db_path)?;
            let reconciler = Reconciler::new(events, aggregates, &config);
            let summary = run_blocking(reconciler, options).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve { root } => {
            if let Some(root) = root {
                config.root_path = root;
            }
            let (events, aggregates) = open_stores(&events_dir, &db_path)?;
            serve(events, aggregates, config, StartupToggles::from_env()).await?;
        }
        Commands::Locations { limit } => {
            let aggregates = AggregateStore::open(&db_path)
                .with_context(|| format!("failed to open {}", db_path.display()))?;
            let locations = aggregates.ranked_locations(limit)?;
            println!("{}", serde_json::to_string_pretty(&locations)?);
        }
    }

    Ok(())
}

fn open_stores(
    events_dir: &Path,
    db_path: &Path,
) -> Result<(Arc<dyn EventStore>, Arc<AggregateStore>)> {
    let events: Arc<dyn EventStore> = Arc::new(
        FsEventStore::open(events_dir)
            .with_context(|| format!("failed to open event store at {}", events_dir.display()))?,
    );
    let aggregates = AggregateStore::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    Ok((events, Arc::new(aggregates)))
}

async fn run_blocking(reconciler: Reconciler, options: RunOptions) -> Result<RunSummary> {
    let summary = tokio::task::spawn_blocking(move || reconciler.run(options))
        .await
        .context("reconcile task failed")??;
    Ok(summary)
}

/// Process-start hook: optional sync pass, then the live watcher.
async fn serve(
    events: Arc<dyn EventStore>,
    aggregates: Arc<AggregateStore>,
    config: ReconcileConfig,
    toggles: StartupToggles,
) -> Result<()> {
    info!(
        event = "serve_start",
        root = %config.root_path,
        sync_on_start = toggles.sync_on_start,
        sync_reprocess = toggles.sync_reprocess,
        watcher_enabled = toggles.watcher_enabled
    );

    if toggles.sync_on_start {
        let reconciler = Reconciler::new(events.clone(), aggregates.clone(), &config);
        let options = RunOptions {
            reprocess: toggles.sync_reprocess,
            ..RunOptions::from(&config)
        };
        match run_blocking(reconciler, options).await {
            Ok(summary) => info!(
                event = "startup_sync_finished",
                migrated = summary.migrated,
                denied = summary.denied,
                errors = summary.errors
            ),
            Err(err) => error!(event = "startup_sync_failed", error = %err),
        }
    }

    if !toggles.watcher_enabled {
        info!(event = "watcher_disabled");
        return Ok(());
    }

    let watcher = LiveWatcher::start(events, aggregates, WatcherOptions::from(&config))
        .context("failed to start watcher")?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    watcher.shutdown();
    Ok(())
}

fn resolve_path(flag: &str, env_key: &str, default: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = env::var(env_key) {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(default)
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env::var("ROADWATCH_LOG_DIR").unwrap_or_default()
}

fn init_logging(log_dir: &str, debug: bool) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = env::var("ROADWATCH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>) -> Self {
        Self { file }
    }
}

// stdout carries command output, so logs go to stderr
impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}
