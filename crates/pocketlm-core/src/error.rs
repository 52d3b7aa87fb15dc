//! Error types for the model lifecycle runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of runtime failures.
///
/// Rejections (`AlreadyDownloading`, `AlreadyDownloaded`, `NoSourceUrl`,
/// `ModelNotFound`, `ModelNotDownloaded`, `InvalidState`) are reported
/// synchronously and mutate no state. `Network` is transient and may be
/// retried by the caller. The rest are fatal for the operation that raised
/// them; the ledger and registry are left at the last consistent record.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a download for {0} is already in progress")]
    AlreadyDownloading(String),

    #[error("model {0} is already downloaded")]
    AlreadyDownloaded(String),

    #[error("model {0} has no download source")]
    NoSourceUrl(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model {0} is not downloaded")]
    ModelNotDownloaded(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not enough free space to store the model")]
    StorageFull,

    #[error("write error: {0}")]
    Write(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("engine failed to load model: {0}")]
    EngineInit(String),

    #[error("inference error: {0}")]
    Inference(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            Error::StorageFull
        } else {
            Error::Write(err.to_string())
        }
    }
}
