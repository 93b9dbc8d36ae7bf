//! Tag catalog: a soft vocabulary replicated through a compacted bus topic.
//!
//! The catalog is not a primary data source. Each enrichment reseeds a fresh
//! in-process copy from the topic, and only a successful enrichment writes
//! back. There is no cross-process locking; last write wins on the topic.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::bus::{BusError, RedisBus};

/// Maximum number of known tags offered to the model as a hint.
pub const PROMPT_TAG_LIMIT: usize = 100;

/// Durable side of the catalog (the compacted topic).
#[async_trait]
pub trait TagCatalogStore: Send + Sync {
    /// Load the current full tag set (empty if the topic has no entry yet).
    async fn load(&self) -> Result<Vec<String>, BusError>;

    /// Replace the catalog with the given full sorted set.
    async fn store(&self, tags: &[String]) -> Result<(), BusError>;
}

#[async_trait]
impl TagCatalogStore for RedisBus {
    async fn load(&self) -> Result<Vec<String>, BusError> {
        self.read_compacted_tags().await
    }

    async fn store(&self, tags: &[String]) -> Result<(), BusError> {
        self.publish_tags(tags).await
    }
}

/// In-memory catalog state for a single enrichment pass.
#[derive(Debug, Default, Clone)]
pub struct TagCatalog {
    tags: BTreeSet<String>,
}

impl TagCatalog {
    pub fn from_tags(tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            tags: tags
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Merge newly discovered tags; returns true when the set grew.
    pub fn merge(&mut self, new_tags: impl IntoIterator<Item = String>) -> bool {
        let before = self.tags.len();
        for tag in new_tags {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                self.tags.insert(tag);
            }
        }
        self.tags.len() > before
    }

    /// Full sorted set, the value written to the compacted topic.
    pub fn sorted(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }

    /// The slice offered to the model as a vocabulary hint.
    pub fn prompt_hint(&self) -> Vec<String> {
        self.tags.iter().take(PROMPT_TAG_LIMIT).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
