// ABOUTME: Short-lived status cache mirroring instance snapshots for read-heavy polling
// ABOUTME: Best effort only; the registry stays authoritative and staleness is tolerated

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::registry::Instance;

struct CacheEntry {
    instance: Instance,
    cached_at: Instant,
}

/// Write-through TTL cache keyed by instance id. Never consulted for
/// admission or lifecycle decisions.
pub struct StatusCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached snapshot if it is still fresh.
    pub async fn get(&self, instance_id: &str) -> Option<Instance> {
        let entries = self.entries.read().await;
        entries
            .get(instance_id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.instance.clone())
    }

    pub async fn put(&self, instance: Instance) {
        let mut entries = self.entries.write().await;
        entries.insert(
            instance.id.clone(),
            CacheEntry {
                instance,
                cached_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, instance_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(instance_id);
    }

    /// Drop entries past their TTL so the map does not grow with churn.
    pub async fn purge_stale(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::registry::InstanceStatus;
    use chrono::Utc;

    fn snapshot(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            lab_id: "sqli-basics".to_string(),
            user_id: "user-1".to_string(),
            backend: BackendKind::Local,
            resource_id: Some("abc123".to_string()),
            private_addr: None,
            public_addr: None,
            port_mappings: vec![],
            access_url: None,
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            stopped_at: None,
            expires_at: Utc::now(),
            restart_count: 0,
            auto_cleanup: false,
            error_message: None,
            provider_metadata: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_entry_is_returned() {
        let cache = StatusCache::new(Duration::from_secs(60));
        cache.put(snapshot("lab_1")).await;

        let hit = cache.get("lab_1").await;
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().id, "lab_1");
        assert!(cache.get("lab_2").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_entry_is_ignored() {
        let cache = StatusCache::new(Duration::from_millis(10));
        cache.put(snapshot("lab_1")).await;

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get("lab_1").await.is_none());

        cache.purge_stale().await;
        assert!(cache.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = StatusCache::new(Duration::from_secs(60));
        cache.put(snapshot("lab_1")).await;
        cache.invalidate("lab_1").await;
        assert!(cache.get("lab_1").await.is_none());
    }
}
