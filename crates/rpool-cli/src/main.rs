//! rpool: distribute files as chunks across multiple remotes.
//!
//! Exit codes: 0 on success, 1 on logical failure (failed upload, verify
//! or health findings, unrecoverable files).

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rpool_core::PoolConfig;
use rpool_engine::{PoolEngine, VerifyStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "rpool",
    version,
    about = "Distribute files as chunks across multiple remotes"
)]
struct Cli {
    /// Path to the pool configuration file (TOML or JSON)
    #[arg(
        long,
        short = 'c',
        env = "RPOOL_CONFIG",
        default_value = "~/.config/rpool/rpool.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RPOOL_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file into the pool
    Upload {
        local_path: PathBuf,
        /// Remote path (e.g. /backups/file.mkv, or a directory ending in /)
        remote_path: String,
    },
    /// Download a file from the pool
    Download {
        remote_path: String,
        local_path: PathBuf,
    },
    /// List files
    Ls {
        #[arg(default_value = "/")]
        remote_dir: String,
        #[arg(long, short = 'r')]
        recursive: bool,
    },
    /// Delete a file and all its chunks
    Delete { remote_path: String },
    /// Show remote usage and pool totals
    Status,
    /// Check that chunks exist (and sizes match without --quick)
    Verify {
        /// File to verify (all files if omitted)
        file_path: Option<String>,
        /// Existence probe only
        #[arg(long)]
        quick: bool,
    },
    /// Re-upload missing chunks from a local copy
    Repair {
        remote_path: String,
        local_source: PathBuf,
    },
    /// Find chunks no manifest references
    Orphans {
        /// Delete them after scanning
        #[arg(long)]
        delete: bool,
    },
    /// Move chunks from over- to under-utilized remotes
    Rebalance {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = 5.0)]
        target_variance: f64,
    },
    /// Show the balance analysis
    BalanceStatus,
    /// Check replica/parity health
    Health {
        /// File to check (all files if omitted)
        file_path: Option<String>,
    },
    /// Restore missing chunks from replicas or parity
    Rebuild { file_path: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log);

    match run(cli).await {
        Ok(ok) => {
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns Ok(false) for logical failures that should exit 1 without an
/// error trace.
async fn run(cli: Cli) -> Result<bool> {
    let config = PoolConfig::load(&expand_home(&cli.config))?;
    if config.remotes.is_empty() {
        anyhow::bail!(
            "no remotes configured in {} — add a `remotes` list",
            cli.config.display()
        );
    }
    let client = rpool_storage::build_client(&config)?;
    let engine = Arc::new(PoolEngine::new(config, client)?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, finishing in-flight operations...");
                cancel.cancel();
            }
        });
    }

    let ok = dispatch(cli.command, &engine, &cancel).await?;
    engine.shutdown().await;
    Ok(ok)
}

async fn dispatch(
    command: Command,
    engine: &Arc<PoolEngine>,
    cancel: &CancellationToken,
) -> Result<bool> {
    match command {
        Command::Upload {
            local_path,
            remote_path,
        } => {
            let spinner = spinner(format!("uploading {}", local_path.display()));
            let manifest = engine.upload(&local_path, &remote_path, cancel).await?;
            spinner.finish_and_clear();
            println!(
                "uploaded {} ({} bytes, {} chunks across {} remotes)",
                manifest.file_path,
                manifest.file_size,
                manifest.chunk_count,
                manifest.remotes().len()
            );
            Ok(true)
        }
        Command::Download {
            remote_path,
            local_path,
        } => {
            let spinner = spinner(format!("downloading {remote_path}"));
            let bytes = engine.download(&remote_path, &local_path, cancel).await?;
            spinner.finish_and_clear();
            println!("downloaded {} ({bytes} bytes)", local_path.display());
            Ok(true)
        }
        Command::Ls {
            remote_dir,
            recursive,
        } => {
            let files = engine.list(&remote_dir, recursive).await?;
            if files.is_empty() {
                println!("no files found");
                return Ok(true);
            }
            for file in files {
                println!(
                    "{:<48} {:>14} bytes  {:>4} chunks  remotes: {}",
                    file.path,
                    file.size,
                    file.chunk_count,
                    file.remotes.join(", ")
                );
            }
            Ok(true)
        }
        Command::Delete { remote_path } => {
            engine.delete(&remote_path).await?;
            println!("deleted {remote_path}");
            Ok(true)
        }
        Command::Status => {
            let report = engine.balancer().usage_report().await;
            for (name, status) in &report {
                println!(
                    "{:<16} used: {:>14}  free: {:>14}  total: {:>14}  {:>5.1}%{}",
                    name,
                    status.used,
                    status.free,
                    status.total,
                    status.utilization(),
                    if status.enabled { "" } else { "  (disabled)" }
                );
            }
            let stats = engine.stats().await?;
            println!(
                "\n{} files, {} chunks, {} bytes stored, pool {:.1}% full",
                stats.files, stats.chunks, stats.total_size, stats.utilization
            );
            Ok(true)
        }
        Command::Verify { file_path, quick } => {
            let results = match file_path {
                Some(path) => vec![engine.verifier().verify(&path, quick).await?],
                None => engine.verifier().verify_all(quick, cancel).await?,
            };
            let mut ok = true;
            for result in &results {
                match result.status {
                    VerifyStatus::Ok => {
                        println!("ok       {}", result.file_path);
                    }
                    VerifyStatus::MissingChunks => {
                        ok = false;
                        println!(
                            "MISSING  {} (chunks {:?})",
                            result.file_path, result.missing_chunks
                        );
                    }
                    VerifyStatus::Error => {
                        ok = false;
                        println!(
                            "ERROR    {} ({})",
                            result.file_path,
                            result.error.as_deref().unwrap_or("unknown")
                        );
                    }
                }
            }
            Ok(ok)
        }
        Command::Repair {
            remote_path,
            local_source,
        } => {
            let result = engine.verifier().repair(&remote_path, &local_source).await?;
            let ok = result.status == VerifyStatus::Ok;
            println!(
                "{}: {}/{} chunks verified",
                if ok { "repaired" } else { "REPAIR INCOMPLETE" },
                result.verified_chunks,
                result.total_chunks
            );
            Ok(ok)
        }
        Command::Orphans { delete } => {
            let orphans = engine.verifier().find_orphans().await?;
            if orphans.is_empty() {
                println!("no orphaned chunks");
                return Ok(true);
            }
            for orphan in &orphans {
                println!("{}:{} ({} bytes)", orphan.remote, orphan.path, orphan.size);
            }
            if delete {
                if !confirm(&format!("delete {} orphaned chunks?", orphans.len()))? {
                    println!("cancelled");
                    return Ok(true);
                }
                let deleted = engine.verifier().delete_orphans(&orphans).await;
                println!("deleted {deleted}/{} orphans", orphans.len());
            }
            Ok(true)
        }
        Command::Rebalance {
            dry_run,
            target_variance,
        } => {
            let outcome = engine
                .rebalancer()
                .rebalance(target_variance, dry_run, cancel)
                .await?;
            println!("rebalance: {}", outcome.status.as_str());
            for chunk_move in &outcome.moves {
                println!(
                    "  {} chunk {}: {} -> {} ({} bytes)",
                    chunk_move.file_path,
                    chunk_move.chunk_index,
                    chunk_move.source_remote,
                    chunk_move.target_remote,
                    chunk_move.size
                );
            }
            Ok(true)
        }
        Command::BalanceStatus => {
            let analysis = engine.rebalancer().analyze().await?;
            for (name, balance) in &analysis.remote_usage {
                println!(
                    "{:<16} {:>6.1}%  {:>5} chunks",
                    name, balance.utilization, balance.chunk_count
                );
            }
            println!(
                "\naverage {:.1}%, spread {:.1}% — {}",
                analysis.avg_utilization,
                analysis.variance,
                if analysis.is_balanced {
                    "balanced"
                } else {
                    "unbalanced"
                }
            );
            Ok(true)
        }
        Command::Health { file_path } => {
            let reports = match file_path {
                Some(path) => vec![engine.redundancy().check_health(&path).await?],
                None => engine.redundancy().check_health_all().await?,
            };
            let mut ok = true;
            for health in &reports {
                let label = if health.is_fully_healthy() {
                    "healthy"
                } else if health.is_recoverable {
                    "degraded"
                } else {
                    ok = false;
                    "UNRECOVERABLE"
                };
                println!(
                    "{:<14} {} ({}/{} chunks, {} degraded, {} missing, parity {}/{})",
                    label,
                    health.file_path,
                    health.healthy_chunks,
                    health.total_chunks,
                    health.degraded_chunks,
                    health.missing_chunks,
                    health.parity_healthy,
                    health.parity_total
                );
                for warning in &health.warnings {
                    println!("    {warning}");
                }
            }
            Ok(ok)
        }
        Command::Rebuild { file_path } => {
            let spinner = spinner(format!("rebuilding {file_path}"));
            let outcome = engine.redundancy().rebuild(&file_path, cancel).await?;
            spinner.finish_and_clear();
            println!(
                "{}: {} chunks restored, {} still missing",
                if outcome.ok() { "rebuilt" } else { "REBUILD FAILED" },
                outcome.restored_chunks,
                outcome.health.missing_chunks
            );
            Ok(outcome.ok())
        }
    }
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner().with_message(message);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt} (yes/no): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    info!("logging initialized");
}
