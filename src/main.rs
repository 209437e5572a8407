use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::*;
use resilient_store::storage::FailoverReport;
use resilient_store::{HealthStatus, StorageManager, StorageSettings, UploadOptions};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rstore")]
#[command(about = "Object storage with automatic backend failover")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML, YAML or JSON); RSTORE_* variables override it
    #[arg(short, long, global = true, env = "RSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, failing over between backends
    Upload {
        file: PathBuf,

        /// Write to this backend only
        #[arg(short, long)]
        backend: Option<String>,

        /// Key prefix (defaults to uploads.key_prefix)
        #[arg(short, long)]
        prefix: Option<String>,

        /// Exact object key
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Download an object from the first backend holding it
    Download {
        key: String,

        /// Destination path (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an object from every backend
    Delete { key: String },

    /// Check whether an object exists
    Exists { key: String },

    /// Run a health check on every backend
    Health,

    /// Show per-backend usage and operation metrics
    Stats,

    /// Show failover state for every backend
    Report,
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rstore.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let mut settings = StorageSettings::load(cli.config.as_deref())
        .context("failed to load storage settings")?;
    // One-shot commands have no use for the periodic health loop
    settings.health.enabled = false;

    let manager = StorageManager::new(settings)?;
    manager.initialize().await?;

    let result = run(&cli, &manager).await;
    manager.shutdown();
    result
}

/// `exists` reports a missing key through the exit status
async fn run(cli: &Cli, manager: &StorageManager) -> Result<ExitCode> {
    if let Commands::Exists { key } = &cli.command {
        return Ok(if exists(cli, manager, key).await? {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    command(cli, manager).await?;
    Ok(ExitCode::SUCCESS)
}

async fn exists(cli: &Cli, manager: &StorageManager, key: &str) -> Result<bool> {
    let exists = manager.exists(key).await?;
    if cli.json {
        print_json(&serde_json::json!({ "key": key, "exists": exists }))?;
    } else if exists {
        println!("{} {}", "present".green(), key);
    } else {
        println!("{} {}", "missing".red(), key);
    }
    Ok(exists)
}

async fn command(cli: &Cli, manager: &StorageManager) -> Result<()> {
    match &cli.command {
        Commands::Upload {
            file,
            backend,
            prefix,
            key,
        } => upload(cli, manager, file, backend.as_deref(), prefix.clone(), key.clone()).await,
        Commands::Download { key, output } => {
            download(cli, manager, key, output.as_deref()).await
        }
        Commands::Delete { key } => {
            let removed = manager.delete(key).await?;
            if cli.json {
                return print_json(&serde_json::json!({ "key": key, "removed": removed }));
            }
            if removed {
                println!("{} Deleted {}", "✓".green(), key);
            } else {
                println!("{} {} was not stored on any backend", "-".yellow(), key);
            }
            Ok(())
        }
        // Answered by `run` through the exit status
        Commands::Exists { .. } => Ok(()),
        Commands::Health => {
            let results = manager.perform_health_check().await?;
            if cli.json {
                return print_json(&results);
            }
            print_health(&results);
            Ok(())
        }
        Commands::Stats => {
            let stats = manager.get_all_stats().await?;
            if cli.json {
                return print_json(&stats);
            }
            for (name, entry) in &stats {
                println!("{} ({})", name.bold(), entry.kind);
                match (&entry.stats, &entry.error) {
                    (Some(stats), _) => {
                        println!("  objects:   {}", stats.total_files);
                        println!("  size:      {} bytes", stats.total_size_bytes);
                        if let Some(free) = stats.available_space_bytes {
                            println!("  available: {} bytes", free);
                        }
                    }
                    (None, Some(error)) => println!("  {}", error.red()),
                    (None, None) => {}
                }
                if let Some(metrics) = &entry.metrics {
                    println!(
                        "  ops: {} (errors {:.1}%), avg {}ms, p95 {}ms",
                        metrics.operations,
                        metrics.error_rate * 100.0,
                        metrics.avg_latency_ms,
                        metrics.p95_latency_ms
                    );
                }
            }
            Ok(())
        }
        Commands::Report => {
            let report = manager.get_failover_report()?;
            if cli.json {
                return print_json(&report);
            }
            print_report(&report);
            Ok(())
        }
    }
}

async fn upload(
    cli: &Cli,
    manager: &StorageManager,
    file: &Path,
    backend: Option<&str>,
    prefix: Option<String>,
    key: Option<String>,
) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());

    let mut options = UploadOptions::default();
    if let Some(prefix) = prefix {
        options = options.with_prefix(prefix);
    }
    if let Some(key) = key {
        options = options.with_key(key);
    }

    let data = Bytes::from(data);
    let (outcome, backend_used) = match backend {
        Some(name) => {
            let outcome = manager
                .upload_with_backend(name, data, &filename, &options)
                .await?;
            if !outcome.success {
                return Err(outcome.to_error().into());
            }
            (outcome, name.to_string())
        }
        None => {
            let upload = manager
                .upload_with_fallback(data, &filename, &options)
                .await?;
            (upload.outcome, upload.backend_used)
        }
    };

    if cli.json {
        return print_json(&outcome);
    }
    println!(
        "{} Uploaded {} bytes to {}",
        "✓".green(),
        outcome.size_bytes,
        backend_used.bold()
    );
    println!("  key: {}", outcome.key);
    println!("  url: {}", outcome.url);
    if let Some(cdn) = &outcome.cdn_url {
        println!("  cdn: {}", cdn);
    }
    Ok(())
}

async fn download(
    cli: &Cli,
    manager: &StorageManager,
    key: &str,
    output: Option<&Path>,
) -> Result<()> {
    let download = manager.download_with_fallback(key).await?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &download.object.bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => {
            if cli.json {
                bail!("--json needs --output for downloads");
            }
            use tokio::io::AsyncWriteExt;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&download.object.bytes).await?;
            stdout.flush().await?;
            return Ok(());
        }
    }

    if cli.json {
        return print_json(&serde_json::json!({
            "key": key,
            "backendUsed": download.backend_used,
            "sizeBytes": download.object.size_bytes,
            "contentType": download.object.content_type,
            "elapsedMs": download.elapsed.as_millis() as u64,
        }));
    }
    println!(
        "{} Downloaded {} ({} bytes) from {}",
        "✓".green(),
        key,
        download.object.size_bytes,
        download.backend_used.bold()
    );
    Ok(())
}

fn print_health(results: &BTreeMap<String, HealthStatus>) {
    for (name, status) in results {
        if status.healthy {
            println!(
                "{} {} ({}ms)",
                "✓".green(),
                name.bold(),
                status.latency_ms.unwrap_or(0)
            );
        } else {
            println!(
                "{} {}: {}",
                "✗".red(),
                name.bold(),
                status.error.as_deref().unwrap_or("unhealthy")
            );
        }
    }
}

fn print_report(report: &FailoverReport) {
    println!("primary:   {}", report.primary.bold());
    println!("fallbacks: {}", report.fallbacks.join(", "));
    println!();
    for backend in &report.backends {
        let state = if backend.available {
            "available".green()
        } else {
            "blacklisted".red()
        };
        println!("{} ({}) {}", backend.name.bold(), backend.kind, state);
        if backend.failure_count > 0 {
            println!("  failures: {}", backend.failure_count);
        }
        if let Some(ms) = backend.blacklist_remaining_ms {
            println!(
                "  retry in: {}",
                humantime::format_duration(std::time::Duration::from_millis(ms))
            );
        }
        if let Some(error) = &backend.last_error {
            println!("  last error: {}", error.dimmed());
        }
    }
}
