//! Revocation and the published revocation list.
//!
//! The list is served from an in-memory snapshot that is rebuilt at most
//! once per lifetime. The store query runs without holding the lock; only
//! the swap takes the write lock, so readers always see a whole snapshot.
//! Concurrent refreshes keep whichever query started last.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::LodestarError;
use crate::records::RevocationEntry;
use crate::store::{bounded, CertificateStore};

struct Snapshot {
    entries: Arc<[RevocationEntry]>,
    taken_at: Instant,
}

pub struct RevocationRegistry {
    store: Arc<dyn CertificateStore>,
    ttl: Duration,
    store_timeout: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl RevocationRegistry {
    pub fn new(store: Arc<dyn CertificateStore>, ttl: Duration, store_timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            store_timeout,
            snapshot: RwLock::new(None),
        }
    }

    /// Revoke the caller's active certificates named `node_name`.
    pub async fn revoke(
        &self,
        owner: &str,
        node_name: &str,
        reason: &str,
    ) -> Result<DateTime<Utc>, LodestarError> {
        let at = Utc::now();
        let revoked = bounded(
            self.store_timeout,
            self.store.revoke(owner, node_name, reason, at),
        )
        .await?;
        if revoked == 0 {
            return Err(LodestarError::NotFound(format!(
                "no active certificate named {node_name}"
            )));
        }
        tracing::info!(owner, node = node_name, reason, count = revoked, "Certificate revoked");
        Ok(at)
    }

    /// The revocation list, newest first, at most one lifetime stale.
    pub async fn list_revoked(&self) -> Result<Arc<[RevocationEntry]>, LodestarError> {
        if let Some(entries) = self.fresh() {
            return Ok(entries);
        }

        let queried_at = Instant::now();
        let entries: Arc<[RevocationEntry]> =
            bounded(self.store_timeout, self.store.revocations()).await?.into();
        Ok(self.install(entries, queried_at))
    }

    /// Swap in a freshly queried list unless a newer query already landed.
    fn install(&self, entries: Arc<[RevocationEntry]>, queried_at: Instant) -> Arc<[RevocationEntry]> {
        let mut guard = self.snapshot.write();
        if let Some(current) = guard.as_ref().filter(|s| s.taken_at >= queried_at) {
            return Arc::clone(&current.entries);
        }
        tracing::debug!(entries = entries.len(), "Revocation list refreshed");
        *guard = Some(Snapshot {
            entries: Arc::clone(&entries),
            taken_at: queried_at,
        });
        entries
    }

    fn fresh(&self) -> Option<Arc<[RevocationEntry]>> {
        let guard = self.snapshot.read();
        guard
            .as_ref()
            .filter(|s| s.taken_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CertificateRecord, NodeClass};
    use crate::store::MemoryStore;
    use std::net::Ipv4Addr;

    fn record(name: &str, host: u8) -> CertificateRecord {
        let now = Utc::now();
        CertificateRecord {
            id: uuid::Uuid::new_v4(),
            owner: "u1".into(),
            node_class: NodeClass::Laptop,
            node_name: name.into(),
            address: Ipv4Addr::new(192, 168, 100, host),
            environment: None,
            groups: vec![],
            certificate_pem: String::new(),
            serial: format!("serial-{name}"),
            created_at: now,
            expires_at: now,
            revoked: false,
            revoked_at: None,
            revoke_reason: None,
            device_metadata: None,
        }
    }

    fn registry(store: Arc<MemoryStore>) -> RevocationRegistry {
        RevocationRegistry::new(store, Duration::from_secs(3600), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn revoking_twice_is_not_found_the_second_time() {
        let store = Arc::new(MemoryStore::new());
        store.insert(record("mbp", 150)).await.unwrap();
        let registry = registry(store.clone());

        registry.revoke("u1", "mbp", "lost").await.unwrap();
        assert!(matches!(
            registry.revoke("u1", "mbp", "lost").await,
            Err(LodestarError::NotFound(_))
        ));
        assert_eq!(store.revocations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_owners_cannot_revoke() {
        let store = Arc::new(MemoryStore::new());
        store.insert(record("mbp", 150)).await.unwrap();
        let registry = registry(store);
        assert!(matches!(
            registry.revoke("u2", "mbp", "mine now").await,
            Err(LodestarError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn list_is_cached_for_its_lifetime() {
        let store = Arc::new(MemoryStore::new());
        store.insert(record("a", 150)).await.unwrap();
        store.insert(record("b", 151)).await.unwrap();
        let registry = registry(store.clone());

        registry.revoke("u1", "a", "lost").await.unwrap();
        assert_eq!(registry.list_revoked().await.unwrap().len(), 1);

        // Revocations after the snapshot stay invisible until it expires.
        registry.revoke("u1", "b", "stolen").await.unwrap();
        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(registry.list_revoked().await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let list = registry.list_revoked().await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].revoked_at >= list[1].revoked_at);
    }

    #[tokio::test(start_paused = true)]
    async fn slower_older_refresh_does_not_replace_newer_list() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let entry = |serial: &str| RevocationEntry {
            serial: serial.into(),
            revoked_at: Utc::now(),
            reason: "lost".into(),
        };

        let older = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        let newer = Instant::now();

        let newer_list: Arc<[RevocationEntry]> = vec![entry("a"), entry("b")].into();
        registry.install(newer_list, newer);

        // The older query finishes last; its result must not win.
        let kept = registry.install(vec![entry("a")].into(), older);
        assert_eq!(kept.len(), 2);
        assert_eq!(registry.list_revoked().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_readers_see_whole_snapshots() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5u8 {
            store.insert(record(&format!("n{i}"), 150 + i)).await.unwrap();
            store
                .revoke("u1", &format!("n{i}"), "bulk", Utc::now())
                .await
                .unwrap();
        }
        let registry = Arc::new(registry(store));

        let readers: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.list_revoked().await.unwrap().len() })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), 5);
        }
    }
}
