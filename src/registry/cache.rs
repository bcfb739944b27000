//! In-memory capability cache.
//!
//! Maps a server name to the records from its most recent manifest. Each entry
//! is replaced or evicted as a whole, so readers never see a partial list.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::types::CapabilityRecord;

#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: RwLock<HashMap<String, Arc<[CapabilityRecord]>>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records cached for `server`, or `None` if there is no entry.
    /// An empty entry is still an entry.
    pub async fn get(&self, server: &str) -> Option<Arc<[CapabilityRecord]>> {
        self.entries.read().await.get(server).cloned()
    }

    /// Replace the entry for `server` wholesale.
    pub async fn replace(&self, server: &str, records: Vec<CapabilityRecord>) {
        let records: Arc<[CapabilityRecord]> = records.into();
        self.entries
            .write()
            .await
            .insert(server.to_string(), records);
    }

    /// Drop the entry for `server`. Returns whether one existed.
    pub async fn evict(&self, server: &str) -> bool {
        self.entries.write().await.remove(server).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(server: &str, name: &str) -> CapabilityRecord {
        CapabilityRecord::from_descriptor(server, json!({ "name": name })).unwrap()
    }

    #[tokio::test]
    async fn test_replace_is_not_a_merge() {
        let cache = CapabilityCache::new();
        cache
            .replace("s", vec![record("s", "a"), record("s", "b")])
            .await;
        cache.replace("s", vec![record("s", "c")]).await;

        let cached = cache.get("s").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "c");
    }

    #[tokio::test]
    async fn test_empty_entry_is_distinct_from_absent() {
        let cache = CapabilityCache::new();
        assert!(cache.get("s").await.is_none());

        cache.replace("s", Vec::new()).await;
        assert_eq!(cache.get("s").await.unwrap().len(), 0);

        assert!(cache.evict("s").await);
        assert!(!cache.evict("s").await);
        assert!(cache.get("s").await.is_none());
    }
}
