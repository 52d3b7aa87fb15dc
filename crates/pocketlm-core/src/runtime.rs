//! Top-level runtime wiring.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::model::artifact::ArtifactStore;
use crate::model::descriptor::{builtin_catalog, ModelDescriptor};
use crate::model::download::DownloadCoordinator;
use crate::model::ledger::{DownloadLedger, FileStore, KvStore};
use crate::model::registry::CatalogRegistry;
use crate::model::transfer::{HttpTransfer, TransferEngine};
use crate::session::{ChatSession, EngineLoader};

/// Owns the model lifecycle: artifact store, ledger, registry, download
/// coordinator and the single live chat session.
///
/// All state is reached through this object; there is no ambient global.
pub struct ModelRuntime {
    config: RuntimeConfig,
    artifacts: Arc<ArtifactStore>,
    ledger: Arc<DownloadLedger>,
    registry: Arc<CatalogRegistry>,
    coordinator: DownloadCoordinator,
    loader: Arc<dyn EngineLoader>,
    session: Mutex<Option<Arc<ChatSession>>>,
}

impl ModelRuntime {
    pub fn new(
        config: RuntimeConfig,
        catalog: Vec<ModelDescriptor>,
        store: Arc<dyn KvStore>,
        transfer: Arc<dyn TransferEngine>,
        loader: Arc<dyn EngineLoader>,
    ) -> Self {
        let artifacts = Arc::new(ArtifactStore::new(config.models_dir.clone()));
        let ledger = Arc::new(DownloadLedger::new(store));
        let registry = Arc::new(CatalogRegistry::new(catalog, ledger.clone()));
        let coordinator = DownloadCoordinator::new(
            registry.clone(),
            ledger.clone(),
            artifacts.clone(),
            transfer,
        );
        Self {
            config,
            artifacts,
            ledger,
            registry,
            coordinator,
            loader,
            session: Mutex::new(None),
        }
    }

    /// Runtime over the built-in catalog, file-backed persistence and the
    /// HTTP transfer engine. The engine loader stays host-provided.
    pub fn with_defaults(config: RuntimeConfig, loader: Arc<dyn EngineLoader>) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.state_dir.clone()));
        let transfer = Arc::new(HttpTransfer::new()?);
        Ok(Self::new(config, builtin_catalog(), store, transfer, loader))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CatalogRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Open a chat session for a downloaded model.
    ///
    /// At most one session is live at a time; the previous one must be
    /// closed first. A failed engine load leaves no session behind.
    pub async fn open_session(&self, model_id: &str) -> Result<Arc<ChatSession>> {
        let mut slot = self.session.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.is_live().await {
                return Err(Error::InvalidState(format!(
                    "a session for {} is already active",
                    existing.model_id()
                )));
            }
        }

        let descriptor = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;
        if !descriptor.is_downloaded {
            return Err(Error::ModelNotDownloaded(descriptor.id));
        }

        let session = Arc::new(ChatSession::new(
            descriptor.id.clone(),
            self.config.max_new_tokens,
        ));
        let artifact = self.artifacts.path_for(&descriptor);
        session
            .open(self.loader.clone(), artifact, self.config.engine_settings())
            .await?;

        *slot = Some(session.clone());
        Ok(session)
    }

    /// Close the live session, if any. Idempotent.
    pub async fn close_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    /// Forget a downloaded model: remove the artifact and reset its ledger
    /// entry. Rejected while the model is downloading or bound to a live
    /// session.
    pub async fn delete_model(&self, model_id: &str) -> Result<()> {
        let descriptor = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;

        if self.coordinator.active_model().await.as_deref() == Some(model_id) {
            return Err(Error::InvalidState(format!(
                "model {model_id} is being downloaded"
            )));
        }
        {
            let slot = self.session.lock().await;
            if let Some(session) = slot.as_ref() {
                if session.model_id() == model_id && session.is_live().await {
                    return Err(Error::InvalidState(format!(
                        "model {model_id} is bound to the active session"
                    )));
                }
            }
        }

        self.artifacts.remove(&descriptor)?;
        self.ledger.clear(&descriptor.id)?;
        self.registry.refresh_from_ledger().await;
        info!(model = %model_id, "model deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::error::Result;
    use crate::model::download::DownloadEvent;
    use crate::model::ledger::{LedgerUpdate, MemoryStore};
    use crate::model::transfer::{CancelFlag, TransferOutcome, TransferTick};
    use crate::session::{EngineContext, SessionState};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct EchoEngine {
        releases: AtomicUsize,
    }

    impl EngineContext for EchoEngine {
        fn generate(
            &self,
            _prompt: &str,
            _stops: &[String],
            _max_new_tokens: usize,
            on_token: &mut dyn FnMut(&str),
        ) -> Result<String> {
            on_token("pong");
            Ok("pong".into())
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct EchoLoader;

    impl EngineLoader for EchoLoader {
        fn load(
            &self,
            _artifact: &Path,
            _settings: &EngineSettings,
        ) -> Result<Arc<dyn EngineContext>> {
            Ok(Arc::new(EchoEngine {
                releases: AtomicUsize::new(0),
            }))
        }
    }

    /// Writes a fixed payload to the destination and completes.
    struct PayloadTransfer;

    #[async_trait]
    impl TransferEngine for PayloadTransfer {
        async fn fetch(
            &self,
            _source_url: &str,
            destination: &Path,
            ticks: mpsc::Sender<TransferTick>,
            _cancel: CancelFlag,
        ) -> Result<TransferOutcome> {
            tokio::fs::write(destination, b"weights").await?;
            let _ = ticks
                .send(TransferTick {
                    bytes_written: 7,
                    bytes_expected: 7,
                })
                .await;
            Ok(TransferOutcome::Completed)
        }
    }

    fn catalog() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::catalog_entry("m1", "M1", "m1", "first", Some("http://host/m1.gguf")),
            ModelDescriptor::catalog_entry("m2", "M2", "m2", "second", Some("http://host/m2.gguf")),
        ]
    }

    fn runtime_in(dir: &tempfile::TempDir) -> ModelRuntime {
        let config = RuntimeConfig {
            models_dir: dir.path().join("models"),
            state_dir: dir.path().join("state"),
            ..RuntimeConfig::default()
        };
        ModelRuntime::new(
            config,
            catalog(),
            Arc::new(MemoryStore::new()),
            Arc::new(PayloadTransfer),
            Arc::new(EchoLoader),
        )
    }

    async fn download(runtime: &ModelRuntime, model_id: &str) {
        let mut handle = runtime.coordinator().start(model_id).await.unwrap();
        while let Some(event) = handle.events.recv().await {
            if matches!(event, DownloadEvent::Completed) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn session_requires_a_downloaded_model() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_in(&dir);

        let err = runtime.open_session("m1").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotDownloaded(_)));

        let err = runtime.open_session("nope").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn download_then_chat() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_in(&dir);

        download(&runtime, "m1").await;
        let descriptor = runtime.registry().get("m1").await.unwrap();
        assert!(descriptor.is_downloaded);
        assert!(runtime.artifacts().exists(&descriptor));

        let session = runtime.open_session("m1").await.unwrap();
        assert_eq!(session.state().await, SessionState::Ready);
        let reply = session.send("ping", |_| {}).await.unwrap();
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn only_one_session_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_in(&dir);
        download(&runtime, "m1").await;
        download(&runtime, "m2").await;

        let first = runtime.open_session("m1").await.unwrap();
        let err = runtime.open_session("m2").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        // The first session is untouched by the rejection.
        assert_eq!(first.state().await, SessionState::Ready);

        first.close().await;
        let second = runtime.open_session("m2").await.unwrap();
        assert_eq!(second.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_in(&dir);
        download(&runtime, "m1").await;

        let session = runtime.open_session("m1").await.unwrap();
        runtime.close_session().await;
        runtime.close_session().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn delete_model_clears_artifact_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_in(&dir);
        download(&runtime, "m1").await;

        runtime.delete_model("m1").await.unwrap();
        let descriptor = runtime.registry().get("m1").await.unwrap();
        assert!(!descriptor.is_downloaded);
        assert_eq!(descriptor.download_progress, 0.0);
        assert!(!runtime.artifacts().exists(&descriptor));
    }

    #[tokio::test]
    async fn delete_is_rejected_while_the_session_uses_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_in(&dir);
        download(&runtime, "m1").await;

        let _session = runtime.open_session("m1").await.unwrap();
        let err = runtime.delete_model("m1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        runtime.close_session().await;
        runtime.delete_model("m1").await.unwrap();
    }

    #[tokio::test]
    async fn cold_start_sees_the_previous_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

        // First process lifetime: record a completed download.
        DownloadLedger::new(store.clone())
            .write("m1", LedgerUpdate::completed())
            .unwrap();

        // Second process lifetime over the same store.
        let config = RuntimeConfig {
            models_dir: dir.path().join("models"),
            state_dir: dir.path().join("state"),
            ..RuntimeConfig::default()
        };
        let runtime = ModelRuntime::new(
            config,
            catalog(),
            store,
            Arc::new(PayloadTransfer),
            Arc::new(EchoLoader),
        );
        let descriptor = runtime.registry().get("m1").await.unwrap();
        assert!(descriptor.is_downloaded);
        assert_eq!(descriptor.download_progress, 1.0);
    }
}
