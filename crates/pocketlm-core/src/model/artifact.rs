//! Local artifact storage facts.

use std::fs;
use std::path::PathBuf;

use crate::error::Result;
use crate::model::descriptor::ModelDescriptor;

/// Maps models to their on-disk weight files.
///
/// Path derivation is pure; only `exists`/`size`/`remove` touch the
/// filesystem, and failures there surface to the caller unretried.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path the model's weights live at.
    pub fn path_for(&self, model: &ModelDescriptor) -> PathBuf {
        self.root.join(format!("{}.gguf", model.name))
    }

    pub fn exists(&self, model: &ModelDescriptor) -> bool {
        self.path_for(model).is_file()
    }

    /// Size of the artifact on disk, if present.
    pub fn size(&self, model: &ModelDescriptor) -> Option<u64> {
        fs::metadata(self.path_for(model)).ok().map(|m| m.len())
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Delete the artifact file. A missing file is not an error.
    pub fn remove(&self, model: &ModelDescriptor) -> Result<()> {
        let path = self.path_for(model);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> ModelDescriptor {
        ModelDescriptor::catalog_entry("m1", name, "icon", "a model", None)
    }

    #[test]
    fn path_is_name_plus_extension() {
        let store = ArtifactStore::new(PathBuf::from("/data/models"));
        assert_eq!(
            store.path_for(&model("Qwen-2.5 1.5B")),
            PathBuf::from("/data/models/Qwen-2.5 1.5B.gguf")
        );
    }

    #[test]
    fn exists_tracks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        let m = model("Tiny");
        assert!(!store.exists(&m));

        fs::write(store.path_for(&m), b"weights").unwrap();
        assert!(store.exists(&m));
        assert_eq!(store.size(&m), Some(7));

        store.remove(&m).unwrap();
        assert!(!store.exists(&m));
        assert!(store.remove(&m).is_ok());
    }
}
