// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use odm_engine::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Download a file with pause and resume support.
///
/// Ctrl-C pauses the download and keeps its checkpoint; running the same
/// command again resumes from there.
#[derive(Debug, Parser)]
#[command(name = "odm", version)]
struct Cli {
    /// URL to fetch.
    url: String,

    /// Directory the file is written to.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Name of the file inside `--dir`. Defaults to the last URL path segment.
    #[arg(short = 'o', long)]
    file_name: Option<String>,

    /// JSON file overriding engine defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "medium")]
    priority: Priority,
}

fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, resource) = path.split_once('/')?;
    let name = resource.rsplit('/').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if config.database_path.is_none() {
        config.database_path = Some(cli.dir.join(".odm-state.db"));
    }

    let file_name = match cli.file_name.or_else(|| file_name_from_url(&cli.url)) {
        Some(name) => name,
        None => bail!("cannot derive a file name from {}, pass --file-name", cli.url),
    };

    let dispatcher = CallbackDispatcher::new(SerialExecutor::spawn()?);
    let manager = Arc::new(DownloadManager::from_config(config, dispatcher).await?);
    let scheduler = manager.start();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let request = DownloadRequest::new(&cli.url, &cli.dir, &file_name)
        .priority(cli.priority)
        .listeners(Listeners::forward_to(events_tx));
    let id = manager.submit(request)?;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(%id, "interrupted, pausing");
                if let Err(err) = manager.pause(id) {
                    warn!(%id, error = %err, "could not pause");
                }
            }
            event = events.recv() => match event {
                Some(DownloadEvent::Progress(progress)) => match progress.total_bytes {
                    Some(total) if total > 0 => info!(
                        "{:>6.2}% ({} / {} bytes)",
                        progress.downloaded_bytes as f64 * 100.0 / total as f64,
                        progress.downloaded_bytes,
                        total
                    ),
                    _ => info!("{} bytes", progress.downloaded_bytes),
                },
                Some(DownloadEvent::Pause(_)) => break Ok(false),
                Some(DownloadEvent::Success(_)) => break Ok(true),
                Some(DownloadEvent::Error(error)) => {
                    break Err(anyhow::anyhow!("download failed ({:?}): {}", error.kind, error.detail))
                }
                None => bail!("engine stopped without a final event"),
            },
        }
    };

    manager.shutdown().await;
    scheduler.await?;

    match outcome? {
        true => info!(path = %cli.dir.join(&file_name).display(), "download complete"),
        false => info!("download paused, run the same command again to resume"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://host/files/a.zip?sig=1").as_deref(),
            Some("a.zip")
        );
        assert_eq!(file_name_from_url("https://host/"), None);
        assert_eq!(file_name_from_url("https://host"), None);
    }
}
