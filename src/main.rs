// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dlqueue::prelude::*;
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "dlqueue", version, about = "Resumable download queue with a persistent session list")]
struct Cli {
    /// JSON config file; missing keys fall back to defaults.
    #[arg(long, default_value = "dlqueue.json")]
    config: PathBuf,

    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Session database path.
    #[arg(long)]
    database: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a URL and wait for it to finish.
    Get {
        url: String,
        /// File name to save as; derived from the URL when omitted.
        #[arg(short, long)]
        output: Option<String>,
        /// Extra request header, `Name: value`. May be repeated.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// Show every stored session.
    List,
    /// Resume a paused or failed session and wait for it.
    Resume { id: u64 },
    /// Delete a session and its partial file.
    Delete { id: u64 },
}

enum CliEvent {
    Progress(u64, Option<u64>),
    Finished(u64, PathBuf),
    Failed(u64, String),
    Idle,
}

/// Forwards queue callbacks to the main task.
struct CliObserver {
    tx: mpsc::UnboundedSender<CliEvent>,
}

impl QueueObserver for CliObserver {
    fn on_combined_progress(&self, bytes_downloaded: u64, total_expected: Option<u64>) {
        let _ = self.tx.send(CliEvent::Progress(bytes_downloaded, total_expected));
    }

    fn on_download_finished(&self, download: &DownloadInfo, destination: &Path) {
        let _ = self
            .tx
            .send(CliEvent::Finished(download.session_id, destination.to_path_buf()));
    }

    fn on_download_failed(&self, session_id: u64, error: &TransferError) {
        let _ = self.tx.send(CliEvent::Failed(session_id, error.to_string()));
    }

    fn on_queue_empty_changed(&self, is_empty: bool) {
        if is_empty {
            let _ = self.tx.send(CliEvent::Idle);
        }
    }
}

fn setup_logger(level: LevelFilter) {
    let result = fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{:<5}] [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr())
        .apply();

    if let Err(e) = result {
        eprintln!("warning: failed to initialise logging: {}", e);
    }
}

fn load_config(cli: &Cli) -> Result<QueueConfig> {
    let mut config = QueueConfig::load(&cli.config)?;
    if let Some(dir) = &cli.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    Ok(config)
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("header `{}` is not `Name: value`", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Prints queue events until the queue drains or the user hits ctrl-c.
/// Returns the number of failed downloads.
async fn watch(queue: &QueueHandle, rx: &mut mpsc::UnboundedReceiver<CliEvent>) -> Result<usize> {
    let mut failures = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let report = queue.pause_all().await?;
                println!("\nPaused {} download(s); resume later with `dlqueue resume <id>`.", report.applied.len());
                return Ok(failures);
            }
            event = rx.recv() => match event {
                Some(CliEvent::Progress(done, Some(total))) if total > 0 => {
                    println!("{} / {} ({:.1}%)", format_bytes(done), format_bytes(total), done as f64 * 100.0 / total as f64);
                }
                Some(CliEvent::Progress(done, _)) => println!("{}", format_bytes(done)),
                Some(CliEvent::Finished(id, path)) => println!("Session {} saved to {}", id, path.display()),
                Some(CliEvent::Failed(id, reason)) => {
                    failures += 1;
                    println!("Session {} failed: {}", id, reason);
                }
                Some(CliEvent::Idle) | None => return Ok(failures),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logger(cli.log_level);
    let config = load_config(&cli)?;
    let manager = DownloadManager::open(config).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = Arc::new(CliObserver { tx });
    let _subscription = manager.queue().subscribe(&observer)?;

    let failures = match cli.command {
        Command::Get { url, output, headers } => {
            let mut request = RequestDescriptor::get(url);
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                request = request.with_header(name, value);
            }
            let enqueue = EnqueueRequest::new(request, output.unwrap_or_default(), "");
            let session_id = manager.queue().enqueue_request(enqueue).await?;
            println!("Started session {}.", session_id);
            watch(manager.queue(), &mut rx).await?
        }
        Command::Resume { id } => {
            manager.queue().resume_download(id).await?;
            if manager.queue().snapshot().await?.is_empty() {
                println!("Session {} has nothing left to download.", id);
                0
            } else {
                watch(manager.queue(), &mut rx).await?
            }
        }
        Command::List => {
            let records = manager.queue().list().await?;
            if records.is_empty() {
                println!("No sessions.");
            }
            for record in records {
                let size = record
                    .total_bytes_expected
                    .map(format_bytes)
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:>4}  {:<11}  {:>10} / {:<10}  {}  {}",
                    record.session_id,
                    record.status.as_str(),
                    format_bytes(record.bytes_downloaded),
                    size,
                    record.filename,
                    record.url()
                );
            }
            0
        }
        Command::Delete { id } => {
            manager.queue().delete_download(id).await?;
            println!("Deleted session {}.", id);
            0
        }
    };

    manager.shutdown().await?;
    if failures > 0 {
        bail!("{} download(s) failed", failures);
    }
    Ok(())
}
