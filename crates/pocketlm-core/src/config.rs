//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory downloaded model artifacts are stored in
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Directory the durable download ledger is stored in
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Context window size for the inference engine (tokens)
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    /// Number of model layers offloaded to the GPU
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: usize,

    /// Upper bound on tokens generated per assistant turn
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            state_dir: default_state_dir(),
            context_size: default_context_size(),
            gpu_layers: default_gpu_layers(),
            max_new_tokens: default_max_new_tokens(),
        }
    }
}

impl RuntimeConfig {
    /// Engine acquisition parameters derived from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            context_size: self.context_size,
            gpu_layers: self.gpu_layers,
        }
    }
}

/// Parameters passed to the engine when binding a context to an artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineSettings {
    pub context_size: usize,
    /// Hardware-acceleration preference: how many layers to place on the GPU.
    pub gpu_layers: usize,
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pocketlm")
}

fn default_models_dir() -> PathBuf {
    if let Ok(from_env) = std::env::var("POCKETLM_MODELS_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    data_root().join("models")
}

fn default_state_dir() -> PathBuf {
    data_root().join("state")
}

fn default_context_size() -> usize {
    2048
}

fn default_gpu_layers() -> usize {
    99
}

fn default_max_new_tokens() -> usize {
    100
}
