//! Darkroom upload client.
//!
//! Drives a persisted upload session against the ingestion gateway: files
//! passed on the command line are enqueued, the queue is persisted before
//! any network traffic, and a run that is interrupted (crash, Ctrl+C,
//! connectivity loss) resumes from the persisted queue on the next start.
//! Items are sent one at a time with byte-level progress; the gateway's
//! per-item results are reconciled back into the queue.

mod config;
mod item;
mod session;
mod transport;

use anyhow::{bail, Context, Result};
use config::UploaderConfig;
use item::ItemStatus;
use session::{restore_or_create, SessionManager};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transport::{ProgressFn, Transport, TransportError};

#[tokio::main]
async fn main() -> Result<()> {
    let config = UploaderConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    info!(
        endpoint = %config.endpoint,
        destination = %config.destination,
        "Starting Darkroom uploader"
    );

    let files: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();

    let mut manager = restore_or_create(
        Path::new(&config.queue_path),
        &config.destination,
        config.max_retries,
    )?;

    if !files.is_empty() {
        manager.enqueue(&files)?;
    }

    if manager.batch().items.is_empty() {
        info!("Nothing to upload");
        return Ok(());
    }

    let transport = Transport::new(&config)?;

    // Explicit cancellation releases the in-flight connection and leaves
    // the queue resumable
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Cancellation requested");
                cancel.cancel();
            }
        });
    }

    let destination = manager.batch().destination.clone();
    run_batch(&mut manager, &transport, &destination, &cancel).await?;

    let failed = manager.failed_items();
    if failed.is_empty() {
        info!("Upload session complete");
        Ok(())
    } else {
        for item in &failed {
            error!(
                filename = %item.filename,
                retries = item.retry_count,
                error = item.last_error.as_deref().unwrap_or("unknown"),
                "Item failed permanently"
            );
        }
        bail!("{} item(s) failed permanently", failed.len());
    }
}

/// Send every queued item to a terminal outcome (or until cancelled)
async fn run_batch(
    manager: &mut SessionManager,
    transport: &Transport,
    destination: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    while let Some(item) = manager.next_queued() {
        if cancel.is_cancelled() {
            manager.reset_in_flight()?;
            info!("Upload run cancelled");
            return Ok(());
        }

        manager.set_status(item.id, ItemStatus::Uploading)?;

        let last_percent = Arc::new(AtomicU8::new(0));
        let progress_percent = last_percent.clone();
        let progress_name = item.filename.clone();
        let on_progress: ProgressFn = Box::new(move |loaded, total| {
            let percent = if total == 0 {
                100
            } else {
                (loaded.saturating_mul(100) / total) as u8
            };
            progress_percent.store(percent, Ordering::Relaxed);
            debug!(filename = %progress_name, loaded, total, "Upload progress");
        });

        match transport
            .send_item(&item, destination, on_progress, cancel)
            .await
        {
            Ok(response) if response.is_ok() => {
                manager.set_progress(item.id, last_percent.load(Ordering::Relaxed));
                // All bytes were accepted; the server has processed the item
                manager.set_status(item.id, ItemStatus::Processing)?;

                match response.item_results() {
                    Ok(results) => manager.reconcile(&results)?,
                    Err(e) => {
                        warn!(error = %e, "Gateway returned an unparseable body");
                        manager.record_failure(
                            item.id,
                            format!("unparseable response: {e}"),
                            true,
                        )?;
                    }
                }
            }
            Ok(response) => {
                // Batch-wide rejection (auth, envelope): no item was
                // processed, so the queue stays intact for the next run
                manager.reset_in_flight()?;
                bail!(
                    "gateway rejected the batch: status {}: {}",
                    response.status,
                    response.body
                );
            }
            Err(TransportError::Cancelled) => {
                manager.reset_in_flight()?;
                info!("Upload cancelled mid-flight");
                return Ok(());
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(filename = %item.filename, error = %e, retryable, "Transport failure");
                manager.record_failure(item.id, e.to_string(), retryable)?;
            }
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
