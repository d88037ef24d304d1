//! Model registry — the peer's announced inventory, replaced atomically
//! whenever a fresh `model_registry` message arrives (spec §3, §4.E).

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Chat,
    Image,
    Video,
}

impl Modality {
    /// Derive modality from the peer-declared output capability string.
    /// Anything not recognized falls back to chat, matching the source's
    /// `model_info.get("type", "chat")` default.
    pub fn from_capability(raw: &str) -> Self {
        match raw {
            "image" => Modality::Image,
            "video" => Modality::Video,
            _ => Modality::Chat,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub public_name: String,
    pub upstream_id: String,
    pub modality: Modality,
}

/// Process-wide model inventory. Swapped wholesale on every
/// `model_registry` peer message; readers never observe a partial update.
#[derive(Default)]
pub struct ModelRegistry {
    inner: ArcSwap<HashMap<String, ModelInfo>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn replace(&self, models: HashMap<String, ModelInfo>) {
        self.inner.store(Arc::new(models));
    }

    pub fn get(&self, public_name: &str) -> Option<ModelInfo> {
        self.inner.load().get(public_name).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, ModelInfo>> {
        self.inner.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fallback inventory used before the peer ever reports one, so
/// `/v1/models` and startup warmup have something to iterate.
pub fn fallback_registry() -> HashMap<String, ModelInfo> {
    HashMap::new()
}
