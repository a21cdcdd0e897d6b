//! Content-text seam.
//!
//! The engine never reads source communication events itself; external
//! builders shape per-entity text out of the store. The trait below is
//! that boundary. Caching applies to the default episode builder only,
//! which is the one hit by both request classes.

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::EngineError;

/// External content-text builders, one per entity shape.
#[async_trait]
pub trait TextSource: Send + Sync {
    /// Default episode rendering.
    async fn episode_text(&self, id: &str) -> Result<String, EngineError>;
    /// Episode rendering with PII masked out.
    async fn episode_text_masked(&self, id: &str) -> Result<String, EngineError>;
    /// Per-turn quality rendering of an episode.
    async fn turn_quality_text(&self, id: &str) -> Result<String, EngineError>;
    async fn facet_text(&self, id: &str) -> Result<String, EngineError>;
    async fn person_text(&self, id: &str) -> Result<String, EngineError>;
    async fn document_text(&self, key: &str) -> Result<String, EngineError>;
}

/// Bounded in-memory cache for default episode text.
///
/// Both the analysis and embedding handlers render the same episodes; the
/// cache collapses that duplicate work. Eviction is crude (drop everything
/// once over capacity) because a bulk run touches each episode a small,
/// clustered number of times.
pub struct TextCache {
    entries: Mutex<HashMap<String, String>>,
    capacity: usize,
}

impl TextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.entries.lock().get(id).cloned()
    }

    pub fn put(&self, id: &str, text: &str) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(id) {
            entries.clear();
        }
        entries.insert(id.to_string(), text.to_string());
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fetch through the cache using the default episode builder.
    pub async fn episode_text(
        &self,
        source: &dyn TextSource,
        id: &str,
    ) -> Result<String, EngineError> {
        if let Some(text) = self.get(id) {
            return Ok(text);
        }
        let text = source.episode_text(id).await?;
        self.put(id, &text);
        Ok(text)
    }
}
