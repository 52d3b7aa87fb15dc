//! Pocketlm Core - On-Device Language Model Runtime
//!
//! This crate owns the lifecycle of locally stored language models for a
//! host UI: a catalog registry merged with durable download state, a
//! single-flight resumable download coordinator, and a single-flight chat
//! session over a host-provided inference engine.
//!
//! # Architecture
//!
//! - The download ledger is the durable source of truth; the registry is a
//!   projection rebuilt from it on cold start and after every write.
//! - At most one download and at most one session are live at a time; a
//!   second `start`/`open_session` is rejected, never queued.
//! - The transfer engine, the persistence store, and the inference engine
//!   are collaborator traits the host implements.
//!
//! # Example
//!
//! ```ignore
//! use pocketlm_core::{ModelRuntime, RuntimeConfig};
//!
//! let runtime = ModelRuntime::with_defaults(RuntimeConfig::default(), loader)?;
//!
//! let mut handle = runtime.coordinator().start("qwen-2.5-1.5b").await?;
//! while let Some(event) = handle.events.recv().await { /* progress UI */ }
//!
//! let session = runtime.open_session("qwen-2.5-1.5b").await?;
//! let reply = session.send("hello", |delta| print!("{delta}")).await?;
//! session.close().await;
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod runtime;
pub mod session;

pub use config::{EngineSettings, RuntimeConfig};
pub use error::{Error, Result};
pub use model::{
    builtin_catalog, ArtifactStore, CancelFlag, CatalogRegistry, DownloadCoordinator,
    DownloadEvent, DownloadHandle, DownloadLedger, DownloadLedgerEntry, FileStore, HttpTransfer,
    KvStore, LedgerUpdate, MemoryStore, ModelDescriptor, TransferEngine, TransferOutcome,
    TransferTick,
};
pub use runtime::ModelRuntime;
pub use session::{
    ChatSession, EngineContext, EngineLoader, Role, SessionState, Turn,
};
