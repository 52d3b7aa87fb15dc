//! Model catalog, artifacts, and download lifecycle.

pub mod artifact;
pub mod descriptor;
pub mod download;
pub mod ledger;
pub mod registry;
pub mod transfer;

pub use artifact::ArtifactStore;
pub use descriptor::{builtin_catalog, ModelDescriptor};
pub use download::{DownloadCoordinator, DownloadEvent, DownloadHandle, DownloadTask};
pub use ledger::{
    DownloadLedger, DownloadLedgerEntry, FileStore, KvStore, LedgerUpdate, MemoryStore, LEDGER_KEY,
};
pub use registry::CatalogRegistry;
pub use transfer::{
    CancelFlag, HttpTransfer, TransferEngine, TransferOutcome, TransferTick,
};
