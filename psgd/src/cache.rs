//! Tenant snapshot cache.
//!
//! Maps `(tenant, channel)` to an immutable compiled [`Snapshot`] with TTL
//! invalidation. Reads never block on the store for a warm entry; stale reads
//! within the TTL are accepted. On a miss or expiry, a per-key loader lock
//! guarantees only one loader hits the store while concurrent readers wait on
//! it (single-flight). `purge` / `purge_all` force a reload on next access —
//! bundle activation calls `purge_all` so the next decide for the pair
//! observes exactly the new bundle.

use psg_common::types::Channel;
use psg_detect::snapshot::Snapshot;
use psg_store::{RuleStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

type Key = (String, Channel);

struct CacheEntry {
    snapshot: Arc<Snapshot>,
    loaded_at: Instant,
}

/// Read-many, write-rare snapshot cache.
pub struct TenantCache {
    store: RuleStore,
    ttl: Duration,
    entries: RwLock<HashMap<Key, CacheEntry>>,
    /// Per-key loader locks for single-flight misses.
    loaders: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl TenantCache {
    pub fn new(store: RuleStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: RwLock::new(HashMap::new()),
            loaders: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot for a tenant/channel, served from cache when fresh.
    pub async fn snapshot(
        &self,
        tenant: &str,
        channel: Channel,
    ) -> Result<Arc<Snapshot>, StoreError> {
        let key = (tenant.to_string(), channel);

        if let Some(snapshot) = self.fresh(&key).await {
            return Ok(snapshot);
        }

        // Single-flight: one loader per key; latecomers wait and re-check.
        let loader = {
            let mut loaders = self.loaders.lock().await;
            loaders.entry(key.clone()).or_default().clone()
        };
        let _flight = loader.lock().await;

        if let Some(snapshot) = self.fresh(&key).await {
            return Ok(snapshot);
        }

        let snapshot = Arc::new(self.load(tenant, channel).await?);
        self.entries.write().await.insert(
            key,
            CacheEntry {
                snapshot: snapshot.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(snapshot)
    }

    async fn fresh(&self, key: &Key) -> Option<Arc<Snapshot>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.loaded_at.elapsed() < self.ttl)
            .map(|e| e.snapshot.clone())
    }

    async fn load(&self, tenant: &str, channel: Channel) -> Result<Snapshot, StoreError> {
        match self.store.get_active_bundle(tenant, channel).await? {
            Some(bundle) => {
                let rules = self.store.list_rules(bundle.id).await?;
                let allowlist = self.store.list_allowlist(bundle.id).await?;
                let blocklist = self.store.list_blocklist(bundle.id).await?;
                debug!(
                    tenant,
                    channel = %channel,
                    bundle = bundle.id,
                    rules = rules.len(),
                    "snapshot loaded"
                );
                Ok(Snapshot::compile(&bundle, &rules, &allowlist, &blocklist))
            }
            None => {
                debug!(tenant, channel = %channel, "no active bundle, built-in snapshot");
                Ok(Snapshot::builtin(channel))
            }
        }
    }

    /// Drop every channel entry for a tenant; next access reloads.
    pub async fn purge(&self, tenant: &str) {
        self.entries.write().await.retain(|(t, _), _| t != tenant);
    }

    /// Drop everything; used on bundle activation for strong intra-process
    /// visibility of the swap.
    pub async fn purge_all(&self) {
        self.entries.write().await.clear();
    }

    /// Number of cached snapshots backed by a real bundle.
    pub async fn bundles_loaded(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.snapshot.bundle_id.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psg_common::types::{Action, DetectorKind};
    use psg_store::NewRule;

    async fn store_with_active_bundle() -> (RuleStore, i64) {
        let store = RuleStore::open_in_memory().unwrap();
        let bundle = store
            .create_bundle("t1", "baseline", "1.0.0", Channel::Prod, None, None)
            .await
            .unwrap();
        store
            .upsert_rule(
                None,
                NewRule {
                    bundle_id: bundle.id,
                    rule_type: DetectorKind::Static,
                    pattern: "forbidden".into(),
                    threshold: None,
                    action: Action::Block,
                    context: serde_json::json!({}),
                    enabled: true,
                },
            )
            .await
            .unwrap();
        store.activate_bundle("t1", Channel::Prod, bundle.id).await.unwrap();
        (store, bundle.id)
    }

    #[tokio::test]
    async fn loads_and_caches_snapshot() {
        let (store, bundle_id) = store_with_active_bundle().await;
        let cache = TenantCache::new(store, Duration::from_secs(300));

        let first = cache.snapshot("t1", Channel::Prod).await.unwrap();
        assert_eq!(first.bundle_id, Some(bundle_id));
        assert_eq!(first.static_rules.len(), 1);

        let second = cache.snapshot("t1", Channel::Prod).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second), "warm read reuses the snapshot");
        assert_eq!(cache.bundles_loaded().await, 1);
    }

    #[tokio::test]
    async fn unknown_tenant_gets_builtin_snapshot() {
        let store = RuleStore::open_in_memory().unwrap();
        let cache = TenantCache::new(store, Duration::from_secs(300));
        let snapshot = cache.snapshot("ghost", Channel::Prod).await.unwrap();
        assert!(snapshot.bundle_id.is_none());
        assert_eq!(snapshot.bundle.name, "builtin");
        assert_eq!(cache.bundles_loaded().await, 0);
    }

    #[tokio::test]
    async fn purge_all_forces_reload_with_new_rules() {
        let (store, _) = store_with_active_bundle().await;
        let cache = TenantCache::new(store.clone(), Duration::from_secs(300));

        let before = cache.snapshot("t1", Channel::Prod).await.unwrap();
        assert_eq!(before.static_rules.len(), 1);

        // Activate a richer bundle, then purge: the next read must see it.
        let b2 = store
            .create_bundle("t1", "baseline", "2.0.0", Channel::Prod, None, None)
            .await
            .unwrap();
        for pattern in ["forbidden", "also forbidden"] {
            store
                .upsert_rule(
                    None,
                    NewRule {
                        bundle_id: b2.id,
                        rule_type: DetectorKind::Static,
                        pattern: pattern.into(),
                        threshold: None,
                        action: Action::Block,
                        context: serde_json::json!({}),
                        enabled: true,
                    },
                )
                .await
                .unwrap();
        }
        store.activate_bundle("t1", Channel::Prod, b2.id).await.unwrap();
        cache.purge_all().await;

        let after = cache.snapshot("t1", Channel::Prod).await.unwrap();
        assert_eq!(after.bundle_id, Some(b2.id));
        assert_eq!(after.static_rules.len(), 2);
    }

    #[tokio::test]
    async fn expired_ttl_reloads() {
        let (store, _) = store_with_active_bundle().await;
        let cache = TenantCache::new(store, Duration::from_millis(10));

        let first = cache.snapshot("t1", Channel::Prod).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = cache.snapshot("t1", Channel::Prod).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second), "expired entry reloaded");
    }

    #[tokio::test]
    async fn purge_is_tenant_scoped() {
        let (store, _) = store_with_active_bundle().await;
        let b = store
            .create_bundle("t2", "other", "1.0.0", Channel::Prod, None, None)
            .await
            .unwrap();
        store.activate_bundle("t2", Channel::Prod, b.id).await.unwrap();

        let cache = TenantCache::new(store, Duration::from_secs(300));
        let t1 = cache.snapshot("t1", Channel::Prod).await.unwrap();
        let t2 = cache.snapshot("t2", Channel::Prod).await.unwrap();

        cache.purge("t1").await;
        let t1_after = cache.snapshot("t1", Channel::Prod).await.unwrap();
        let t2_after = cache.snapshot("t2", Channel::Prod).await.unwrap();
        assert!(!Arc::ptr_eq(&t1, &t1_after), "t1 reloaded");
        assert!(Arc::ptr_eq(&t2, &t2_after), "t2 untouched");
    }
}
