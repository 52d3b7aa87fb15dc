//! Download coordination and progress bookkeeping.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::artifact::ArtifactStore;
use crate::model::ledger::{DownloadLedger, LedgerUpdate};
use crate::model::registry::CatalogRegistry;
use crate::model::transfer::{CancelFlag, TransferEngine, TransferOutcome};

/// One in-flight resumable transfer. At most one exists system-wide,
/// exclusively owned by the coordinator's background task.
#[derive(Debug)]
pub struct DownloadTask {
    pub model_id: String,
    pub source_url: String,
    pub destination: std::path::PathBuf,
    pub bytes_written: u64,
    pub bytes_expected: u64,
}

/// Progress stream for one download: zero or more `Progress` ticks followed
/// by exactly one terminal event.
#[derive(Debug)]
pub enum DownloadEvent {
    /// Monotonically non-decreasing completion ratio in `[0, 1]`.
    Progress(f32),
    Completed,
    Cancelled,
    Failed(Error),
}

/// Handle returned by [`DownloadCoordinator::start`].
#[derive(Debug)]
pub struct DownloadHandle {
    pub model_id: String,
    pub events: mpsc::Receiver<DownloadEvent>,
}

struct ActiveDownload {
    model_id: String,
    cancel: CancelFlag,
}

/// Drives at most one resumable transfer at a time, recording progress in
/// the ledger before projecting it into the registry.
pub struct DownloadCoordinator {
    registry: Arc<CatalogRegistry>,
    ledger: Arc<DownloadLedger>,
    artifacts: Arc<ArtifactStore>,
    transfer: Arc<dyn TransferEngine>,
    active: Arc<Mutex<Option<ActiveDownload>>>,
}

impl DownloadCoordinator {
    pub fn new(
        registry: Arc<CatalogRegistry>,
        ledger: Arc<DownloadLedger>,
        artifacts: Arc<ArtifactStore>,
        transfer: Arc<dyn TransferEngine>,
    ) -> Self {
        Self {
            registry,
            ledger,
            artifacts,
            transfer,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin a resumable download for `model_id`.
    ///
    /// Rejects with `AlreadyDownloaded`, `NoSourceUrl` or
    /// `AlreadyDownloading` without touching any state; on acceptance the
    /// transfer runs in the background and reports through the handle.
    pub async fn start(&self, model_id: &str) -> Result<DownloadHandle> {
        let descriptor = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;
        if descriptor.is_downloaded {
            return Err(Error::AlreadyDownloaded(descriptor.id));
        }
        let source_url = descriptor
            .download_url
            .clone()
            .ok_or_else(|| Error::NoSourceUrl(descriptor.id.clone()))?;

        self.artifacts.ensure_root()?;

        let cancel = CancelFlag::new();
        {
            let mut active = self.active.lock().await;
            if let Some(running) = active.as_ref() {
                return Err(Error::AlreadyDownloading(running.model_id.clone()));
            }
            *active = Some(ActiveDownload {
                model_id: descriptor.id.clone(),
                cancel: cancel.clone(),
            });
        }

        let task = DownloadTask {
            model_id: descriptor.id.clone(),
            source_url,
            destination: self.artifacts.path_for(&descriptor),
            bytes_written: 0,
            bytes_expected: 0,
        };
        info!(model = %task.model_id, url = %task.source_url, "starting download");

        let (event_tx, event_rx) = mpsc::channel(32);
        tokio::spawn(run_transfer(
            task,
            self.transfer.clone(),
            self.ledger.clone(),
            self.registry.clone(),
            self.active.clone(),
            cancel,
            event_tx,
        ));

        Ok(DownloadHandle {
            model_id: descriptor.id,
            events: event_rx,
        })
    }

    /// Signal the in-flight transfer to stop. Best-effort: partial bytes
    /// stay on disk and the ledger keeps the last recorded tick.
    pub async fn cancel(&self) {
        if let Some(running) = self.active.lock().await.as_ref() {
            info!(model = %running.model_id, "cancelling download");
            running.cancel.cancel();
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Id of the model currently being downloaded, if any.
    pub async fn active_model(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|running| running.model_id.clone())
    }
}

async fn run_transfer(
    mut task: DownloadTask,
    transfer: Arc<dyn TransferEngine>,
    ledger: Arc<DownloadLedger>,
    registry: Arc<CatalogRegistry>,
    active: Arc<Mutex<Option<ActiveDownload>>>,
    cancel: CancelFlag,
    events: mpsc::Sender<DownloadEvent>,
) {
    let (tick_tx, mut tick_rx) = mpsc::channel(32);
    let fetch = tokio::spawn({
        let transfer = transfer.clone();
        let source_url = task.source_url.clone();
        let destination = task.destination.clone();
        let cancel = cancel.clone();
        async move {
            transfer
                .fetch(&source_url, &destination, tick_tx, cancel)
                .await
        }
    });

    // A resumed transfer must not report less than what the ledger already
    // recorded.
    let mut last_ratio = ledger
        .read(&task.model_id)
        .map(|entry| entry.download_progress)
        .unwrap_or(0.0);

    while let Some(tick) = tick_rx.recv().await {
        task.bytes_written = tick.bytes_written;
        task.bytes_expected = tick.bytes_expected;

        let ratio = if tick.bytes_expected > 0 {
            (tick.bytes_written as f64 / tick.bytes_expected as f64) as f32
        } else {
            last_ratio
        };
        let ratio = ratio.clamp(0.0, 1.0);
        if ratio <= last_ratio {
            continue;
        }
        last_ratio = ratio;

        if let Err(err) = ledger.write(&task.model_id, LedgerUpdate::progress(ratio)) {
            warn!(model = %task.model_id, "failed to persist progress: {err}");
        }
        registry.refresh_from_ledger().await;
        let _ = events.send(DownloadEvent::Progress(ratio)).await;
    }

    // The tick channel closes once the fetch has resolved.
    let outcome = match fetch.await {
        Ok(outcome) => outcome,
        Err(err) => Err(Error::Network(format!("transfer task failed: {err}"))),
    };

    let terminal = match outcome {
        Ok(TransferOutcome::Completed) => {
            // Durable record first: a crash right here must leave the next
            // cold start seeing the completed download.
            match ledger.write(&task.model_id, LedgerUpdate::completed()) {
                Ok(()) => {
                    registry.refresh_from_ledger().await;
                    info!(model = %task.model_id, bytes = task.bytes_written, "download complete");
                    DownloadEvent::Completed
                }
                Err(err) => {
                    warn!(model = %task.model_id, "failed to record completion: {err}");
                    DownloadEvent::Failed(err)
                }
            }
        }
        Ok(TransferOutcome::Cancelled) => {
            info!(model = %task.model_id, "download cancelled");
            DownloadEvent::Cancelled
        }
        Err(err) => {
            warn!(model = %task.model_id, "download failed: {err}");
            DownloadEvent::Failed(err)
        }
    };

    active.lock().await.take();
    let _ = events.send(terminal).await;
}
