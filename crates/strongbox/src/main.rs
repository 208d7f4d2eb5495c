use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strongbox_engine::events::{HookChain, HookPriority};
use strongbox_engine::host::{CommandHost, DetachedHost, HostControl, HostGate};
use strongbox_engine::manager::{BackupRequest, OperationManager};
use strongbox_lib::config::{load_config, Config};
use strongbox_lib::paths;
use strongbox_lib::types::{OperationSnapshot, OperationState};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often progress is printed while waiting for an operation.
const PROGRESS_INTERVAL_MS: u64 = 500;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Show results in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a directory into the backup directory
    Backup {
        /// Name of the backup
        name: String,
        /// Directory to back up, relative to the base directory
        source: PathBuf,
        /// Additional directory to include (repeatable)
        #[arg(long = "also")]
        also: Vec<PathBuf>,
        /// Path to leave out, relative to the base directory (repeatable)
        #[arg(long)]
        ignore: Vec<PathBuf>,
        /// Leave out plain files directly under the source
        #[arg(long)]
        ignore_root_files: bool,
        /// Hold the managed service and copy in a separate process
        #[arg(long)]
        offline: bool,
        /// Destination directory. Defaults to <backup_dir>/<name>_<timestamp>
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Store the backup as a single zip archive
        #[arg(long)]
        zip: bool,
    },
    /// Restore a backup by uid
    Restore {
        /// Uid of the backup, as shown by `list`
        uid: String,
        /// Destination, relative to the base directory. Defaults to the base directory
        #[arg(long)]
        to: Option<PathBuf>,
        /// Delete files in the destination directories before copying
        #[arg(long)]
        clear: bool,
        /// Hold the managed service and copy in a separate process
        #[arg(long)]
        offline: bool,
    },
    /// List completed backups
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let json = cli.json;
    let quiet = cli.quiet;

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(quiet);

    match cli.command {
        Commands::Backup {
            name,
            source,
            also,
            ignore,
            ignore_root_files,
            offline,
            dest,
            zip,
        } => {
            let request = BackupRequest {
                name,
                destination: dest,
                ignore,
                ignore_root_files,
                offline,
                source,
                additional_sources: also,
                archive: zip,
            };
            handle_backup(&config, request, json, quiet).await?;
        }
        Commands::Restore {
            uid,
            to,
            clear,
            offline,
        } => {
            handle_restore(&config, uid, to, clear, offline, json, quiet).await?;
        }
        Commands::List => {
            handle_list(&config, json, quiet).await?;
        }
    }

    Ok(())
}

/// Logs to stderr and, when the data directory is writable, to the log file.
fn init_logging(quiet: bool) -> Option<WorkerGuard> {
    let default_level = if quiet { "error" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_path = paths::log_path();
    let file_writer = log_path.parent().and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let file_name = log_path.file_name()?;
        Some(tracing_appender::non_blocking(tracing_appender::rolling::never(
            dir, file_name,
        )))
    });
    let (file_layer, guard) = match file_writer {
        Some((writer, guard)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    guard
}

fn build_manager(config: &Config) -> OperationManager {
    let host: Arc<dyn HostControl> = if CommandHost::is_configured(&config.host) {
        Arc::new(CommandHost::new(&config.host))
    } else {
        Arc::new(DetachedHost)
    };
    let hooks = HookChain::new().with(
        HookPriority::System,
        Arc::new(HostGate::new(host, config.global.host_settle())),
    );
    OperationManager::new(config, hooks)
}

async fn handle_backup(
    config: &Config,
    request: BackupRequest,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let manager = build_manager(config);
    let name = request.name.clone();
    let uid = manager
        .submit_backup(request)
        .await
        .with_context(|| format!("Failed to start backup '{}'", name))?;
    info!("Backup '{}' submitted as {}", name, uid);
    if !json && !quiet {
        println!("Backup '{}' started with uid {}.", name, uid);
    }

    let snapshot = follow(&manager, &uid, json, quiet).await?;
    report(&snapshot, json, quiet)
}

async fn handle_restore(
    config: &Config,
    uid: String,
    to: Option<PathBuf>,
    clear: bool,
    offline: bool,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let manager = build_manager(config);
    if !manager
        .submit_restore(&uid, to.as_deref(), clear, offline)
        .await
    {
        eprintln!("Unknown backup '{}'", uid);
        std::process::exit(1);
    }
    if !json && !quiet {
        println!("Restore of {} started.", uid);
    }

    let snapshot = follow(&manager, &uid, json, quiet).await?;
    report(&snapshot, json, quiet)
}

/// Prints progress until the operation has completed.
async fn follow(
    manager: &OperationManager,
    uid: &str,
    json: bool,
    quiet: bool,
) -> anyhow::Result<OperationSnapshot> {
    let done = manager.wait_for(uid);
    tokio::pin!(done);
    let mut ticker = tokio::time::interval(Duration::from_millis(PROGRESS_INTERVAL_MS));
    let mut last_line = String::new();

    loop {
        tokio::select! {
            snapshot = &mut done => {
                return snapshot.ok_or_else(|| anyhow::anyhow!("Operation {} disappeared", uid));
            }
            _ = ticker.tick() => {
                if json || quiet {
                    continue;
                }
                let line = format!("[{:>6}%] {}", manager.progress(uid).await, manager.status(uid).await.unwrap_or_default());
                if line != last_line {
                    println!("{}", line);
                    last_line = line;
                }
            }
        }
    }
}

fn report(snapshot: &OperationSnapshot, json: bool, quiet: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    }
    match snapshot.state {
        OperationState::Done => {
            if !json && !quiet {
                let seconds = match (snapshot.start_time, snapshot.end_time) {
                    (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
                    _ => 0.0,
                };
                println!(
                    "Operation {} complete: {} copied to {} in {:.1}s",
                    snapshot.uid,
                    format_size(snapshot.data_copied),
                    snapshot.destination.display(),
                    seconds
                );
            }
            Ok(())
        }
        state => {
            eprintln!("Operation {} ended in {}: {}", snapshot.uid, state, snapshot.error);
            std::process::exit(1);
        }
    }
}

async fn handle_list(config: &Config, json: bool, quiet: bool) -> anyhow::Result<()> {
    let manager = OperationManager::new(config, HookChain::new());
    let entries = manager.list_catalog().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if !quiet {
        if entries.is_empty() {
            println!("No backups found.");
            return Ok(());
        }

        println!("{:<10} {:<20} {:<20} {:>10}  LOCATION", "UID", "NAME", "DATE", "SIZE");
        println!("{}", "-".repeat(80));
        for entry in &entries {
            println!(
                "{:<10} {:<20} {:<20} {:>10}  {}",
                entry.uid,
                entry.name,
                entry
                    .date
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S"),
                format_size(entry.size),
                entry.location.display()
            );
        }
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
