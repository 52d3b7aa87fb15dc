//! Merged catalog view the host UI binds to.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::descriptor::ModelDescriptor;
use crate::model::ledger::{DownloadLedger, DownloadLedgerEntry};

/// In-memory projection of the static catalog merged with ledger state.
///
/// The registry performs no I/O of its own beyond reading the ledger
/// snapshot; it is pure merge logic, rebuilt at startup and after every
/// ledger write.
pub struct CatalogRegistry {
    catalog: Vec<ModelDescriptor>,
    ledger: Arc<DownloadLedger>,
    merged: RwLock<Vec<ModelDescriptor>>,
    selected: RwLock<Option<String>>,
}

impl CatalogRegistry {
    pub fn new(catalog: Vec<ModelDescriptor>, ledger: Arc<DownloadLedger>) -> Self {
        let merged = merge(&catalog, &ledger.read_all());
        Self {
            catalog,
            ledger,
            merged: RwLock::new(merged),
            selected: RwLock::new(None),
        }
    }

    /// All descriptors, in catalog order.
    pub async fn list(&self) -> Vec<ModelDescriptor> {
        self.merged.read().await.clone()
    }

    pub async fn get(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.merged
            .read()
            .await
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
    }

    /// Rebuild every descriptor's download state from the ledger.
    pub async fn refresh_from_ledger(&self) {
        let next = merge(&self.catalog, &self.ledger.read_all());
        *self.merged.write().await = next;
        debug!("registry refreshed from ledger");
    }

    /// Mark a model as the user's current selection. Plain UI state.
    pub async fn select(&self, model_id: &str) -> Result<()> {
        if self.get(model_id).await.is_none() {
            return Err(Error::ModelNotFound(model_id.to_string()));
        }
        *self.selected.write().await = Some(model_id.to_string());
        Ok(())
    }

    pub async fn selected(&self) -> Option<ModelDescriptor> {
        let id = self.selected.read().await.clone()?;
        self.get(&id).await
    }
}

fn merge(
    catalog: &[ModelDescriptor],
    entries: &HashMap<String, DownloadLedgerEntry>,
) -> Vec<ModelDescriptor> {
    catalog
        .iter()
        .cloned()
        .map(|mut model| {
            match entries.get(&model.id) {
                Some(entry) => {
                    model.is_downloaded = entry.is_downloaded;
                    model.download_progress = if entry.is_downloaded {
                        1.0
                    } else {
                        entry.download_progress
                    };
                }
                None => {
                    model.is_downloaded = false;
                    model.download_progress = 0.0;
                }
            }
            model
        })
        .collect()
}
