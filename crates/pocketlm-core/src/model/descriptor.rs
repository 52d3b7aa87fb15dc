//! Model descriptors and the built-in catalog.

use serde::{Deserialize, Serialize};

/// A catalog entry merged with its durable download state.
///
/// Descriptors are constructed at startup from the static catalog and the
/// download ledger, and mutated only through the registry's refresh path.
/// `is_downloaded == true` implies `download_progress == 1.0`; a descriptor
/// without a `download_url` can never be downloaded by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable identifier
    pub id: String,
    /// Human-readable name; also names the on-disk artifact
    pub name: String,
    pub description: String,
    /// Opaque asset key the host resolves to artwork
    pub icon: String,
    /// Source URL for the weight file; absent for bundled/unavailable models
    pub download_url: Option<String>,
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default)]
    pub download_progress: f32,
}

impl ModelDescriptor {
    /// A catalog entry in its initial (not-downloaded) state.
    pub fn catalog_entry(
        id: &str,
        name: &str,
        icon: &str,
        description: &str,
        download_url: Option<&str>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            icon: icon.to_string(),
            download_url: download_url.map(str::to_string),
            is_downloaded: false,
            download_progress: 0.0,
        }
    }
}

/// The built-in model catalog.
pub fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::catalog_entry(
            "tinyllama-3.2-3b",
            "TinyLlama-3.2 3B",
            "tiny_llama",
            "Meta AI's most performant LLM.",
            Some("https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q6_K.gguf"),
        ),
        ModelDescriptor::catalog_entry(
            "gemma-2-2b",
            "Gemma-2 2B",
            "gemma",
            "Gemma is a family of lightweight open models from Google.",
            Some("https://huggingface.co/bartowski/gemma-2-2b-it-GGUF/resolve/main/gemma-2-2b-it-Q6_K.gguf"),
        ),
        ModelDescriptor::catalog_entry(
            "qwen-2.5-1.5b",
            "Qwen-2.5 1.5B",
            "qwen",
            "A language model series including decoder language models of different model sizes.",
            Some("https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q8_0.gguf"),
        ),
        ModelDescriptor::catalog_entry(
            "phi-3.5-mini-3.8b",
            "Phi-3.5 Mini 3.8B",
            "msft",
            "Microsoft's smaller, less compute-intensive models for generative AI solutions.",
            Some("https://huggingface.co/MaziyarPanahi/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct.Q4_K_M.gguf"),
        ),
        ModelDescriptor::catalog_entry(
            "claude-3-opus",
            "Claude-3 Opus",
            "claude",
            "Designed to be fast, tiny, helpful, honest, and harmless.",
            None,
        ),
    ]
}
