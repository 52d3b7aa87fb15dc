//! Byte-transfer collaborator and its HTTP implementation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One progress report: bytes on disk so far and the expected total
/// (0 when the server does not advertise a length).
#[derive(Debug, Clone, Copy)]
pub struct TransferTick {
    pub bytes_written: u64,
    pub bytes_expected: u64,
}

/// Cooperative cancellation flag shared with the transfer loop.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Cancelled,
}

/// Resumable byte transfer from a source URL to a destination file.
///
/// Implementations emit zero or more ticks and check `cancel` between
/// chunks; a cancelled transfer leaves the partial file in place.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Path,
        ticks: mpsc::Sender<TransferTick>,
        cancel: CancelFlag,
    ) -> Result<TransferOutcome>;
}

/// HTTP(S) transfer over reqwest with `Range`-header resume.
pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // Multi-gigabyte artifacts on mobile links take a while.
            .timeout(Duration::from_secs(3600))
            .build()
            .map_err(|err| Error::Network(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransferEngine for HttpTransfer {
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Path,
        ticks: mpsc::Sender<TransferTick>,
        cancel: CancelFlag,
    ) -> Result<TransferOutcome> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let mut resume_from = match fs::metadata(destination).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(source_url);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|err| Error::Network(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("HTTP {status} for {source_url}")));
        }

        let remaining = response.content_length().unwrap_or(0);
        let resumed = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        if resume_from > 0 && !resumed {
            debug!("server ignored range request, restarting from zero");
            resume_from = 0;
        }
        let bytes_expected = if remaining > 0 {
            resume_from + remaining
        } else {
            0
        };

        if resumed {
            info!(offset = resume_from, "resuming transfer");
        }
        let mut file = if resumed {
            OpenOptions::new()
                .append(true)
                .open(destination)
                .await
                .map_err(write_error)?
        } else {
            fs::File::create(destination).await.map_err(write_error)?
        };

        let mut bytes_written = resume_from;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                info!(bytes = bytes_written, "transfer cancelled");
                return Ok(TransferOutcome::Cancelled);
            }
            let chunk = chunk.map_err(|err| Error::Network(format!("read failed: {err}")))?;
            file.write_all(&chunk).await.map_err(write_error)?;
            bytes_written += chunk.len() as u64;
            let _ = ticks
                .send(TransferTick {
                    bytes_written,
                    bytes_expected,
                })
                .await;
        }
        file.flush().await.map_err(write_error)?;

        Ok(TransferOutcome::Completed)
    }
}

fn write_error(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::StorageFull {
        Error::StorageFull
    } else {
        Error::Write(err.to_string())
    }
}
