//! Certificate and credential storage.
//!
//! The core talks to storage through two traits so the backing store can
//! be swapped. [`MemoryStore`] implements both: every mutation is staged
//! on a copy, written through to an optional JSON snapshot, and only then
//! committed by swapping the copy in. Writers are serialized by a commit
//! lock; readers only take the data lock for the swap, never for I/O.
//! Snapshot writes run on the blocking pool, so a stalled disk surfaces
//! as a [`bounded`] timeout instead of a parked runtime worker. A timed-out
//! write still finishes or fails as a whole in the background.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::LodestarError;
use crate::records::{CachedCredential, CertificateRecord, NodeClass, RevocationEntry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an active certificate already exists for node {node_name} ({node_class}) of {owner}")]
    DuplicateNode {
        owner: String,
        node_class: NodeClass,
        node_name: String,
    },

    #[error("address {0} is already assigned to an active certificate")]
    AddressInUse(Ipv4Addr),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Filter for listing an owner's certificates, newest first.
#[derive(Debug, Clone)]
pub struct CertificateQuery {
    pub owner: String,
    pub node_class: Option<NodeClass>,
    pub limit: usize,
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find_active(
        &self,
        owner: &str,
        node_class: NodeClass,
        node_name: &str,
    ) -> Result<Option<CertificateRecord>, StoreError>;

    /// Addresses currently held by non-revoked certificates.
    async fn active_addresses(&self) -> Result<HashSet<Ipv4Addr>, StoreError>;

    /// Insert a new record. Must reject a second active record for the
    /// same (owner, class, name) or the same address.
    async fn insert(&self, record: CertificateRecord) -> Result<(), StoreError>;

    async fn list(&self, query: &CertificateQuery) -> Result<Vec<CertificateRecord>, StoreError>;

    /// Revoke every active record matching (owner, name) and append one
    /// revocation entry per serial, as a single transaction. Appends are
    /// idempotent by serial. Returns how many records were revoked.
    async fn revoke(
        &self,
        owner: &str,
        node_name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// The full revocation list, newest first.
    async fn revocations(&self) -> Result<Vec<RevocationEntry>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// A cached credential whose expiry is strictly after `now`.
    async fn lookup(
        &self,
        digest: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedCredential>, StoreError>;

    async fn upsert(&self, entry: CachedCredential) -> Result<(), StoreError>;

    /// Remove entries expired at `now`. Returns how many were removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Run a store call under `limit`, mapping a timeout to a persistence error.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LodestarError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(LodestarError::from),
        Err(_) => Err(LodestarError::Persistence(format!(
            "store call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

// ── MemoryStore ─────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    certificates: Vec<CertificateRecord>,
    #[serde(default)]
    revocations: Vec<RevocationEntry>,
    #[serde(default)]
    credentials: HashMap<String, CachedCredential>,
}

struct Shared {
    data: RwLock<StoreData>,
    /// Held for the whole stage, persist and swap of one mutation.
    commit: Mutex<()>,
    path: Option<PathBuf>,
}

impl Shared {
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _serial = self.commit.lock();
        let mut staged = self.data.read().clone();
        let out = change(&mut staged)?;
        if let Some(path) = &self.path {
            lodestar_common::persist::write_json_pretty(path, &staged)?;
        }
        *self.data.write() = staged;
        Ok(out)
    }
}

/// In-process store, optionally snapshotted to a JSON file.
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// A volatile store that lives only in memory.
    pub fn new() -> Self {
        Self::with_data(StoreData::default(), None)
    }

    /// Open a file-backed store, loading the snapshot at `path` if present.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data: StoreData =
            lodestar_common::persist::read_json_if_exists(path)?.unwrap_or_default();
        tracing::info!(
            path = %path.display(),
            certificates = data.certificates.len(),
            revocations = data.revocations.len(),
            "Store loaded"
        );
        Ok(Self::with_data(data, Some(path.to_path_buf())))
    }

    fn with_data(data: StoreData, path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: RwLock::new(data),
                commit: Mutex::new(()),
                path,
            }),
        }
    }

    /// Apply `change` to a staged copy, persist it, then commit.
    async fn transact<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreData) -> Result<T, StoreError> + Send + 'static,
    {
        if self.shared.path.is_none() {
            return self.shared.commit(change);
        }
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.commit(change))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store write task failed: {e}")))?
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn find_active(
        &self,
        owner: &str,
        node_class: NodeClass,
        node_name: &str,
    ) -> Result<Option<CertificateRecord>, StoreError> {
        let data = self.shared.data.read();
        Ok(data
            .certificates
            .iter()
            .find(|c| {
                c.is_active()
                    && c.owner == owner
                    && c.node_class == node_class
                    && c.node_name == node_name
            })
            .cloned())
    }

    async fn active_addresses(&self) -> Result<HashSet<Ipv4Addr>, StoreError> {
        let data = self.shared.data.read();
        Ok(data
            .certificates
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.address)
            .collect())
    }

    async fn insert(&self, record: CertificateRecord) -> Result<(), StoreError> {
        self.transact(move |data| {
            for existing in data.certificates.iter().filter(|c| c.is_active()) {
                if existing.owner == record.owner
                    && existing.node_class == record.node_class
                    && existing.node_name == record.node_name
                {
                    return Err(StoreError::DuplicateNode {
                        owner: record.owner.clone(),
                        node_class: record.node_class,
                        node_name: record.node_name.clone(),
                    });
                }
                if existing.address == record.address {
                    return Err(StoreError::AddressInUse(record.address));
                }
            }
            data.certificates.push(record);
            Ok(())
        })
        .await
    }

    async fn list(&self, query: &CertificateQuery) -> Result<Vec<CertificateRecord>, StoreError> {
        let data = self.shared.data.read();
        let mut matches: Vec<CertificateRecord> = data
            .certificates
            .iter()
            .filter(|c| c.owner == query.owner)
            .filter(|c| query.node_class.map_or(true, |class| c.node_class == class))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(query.limit);
        Ok(matches)
    }

    async fn revoke(
        &self,
        owner: &str,
        node_name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        // Read-only lookup first so a miss never rewrites the snapshot.
        let any_match = {
            let data = self.shared.data.read();
            data.certificates
                .iter()
                .any(|c| c.is_active() && c.owner == owner && c.node_name == node_name)
        };
        if !any_match {
            return Ok(0);
        }

        let (owner, node_name, reason) =
            (owner.to_string(), node_name.to_string(), reason.to_string());
        self.transact(move |data| {
            let mut revoked = 0;
            for cert in data
                .certificates
                .iter_mut()
                .filter(|c| c.is_active() && c.owner == owner && c.node_name == node_name)
            {
                cert.revoked = true;
                cert.revoked_at = Some(at);
                cert.revoke_reason = Some(reason.clone());
                revoked += 1;

                if data.revocations.iter().any(|r| r.serial == cert.serial) {
                    continue;
                }
                data.revocations.push(RevocationEntry {
                    serial: cert.serial.clone(),
                    revoked_at: at,
                    reason: reason.clone(),
                });
            }
            Ok(revoked)
        })
        .await
    }

    async fn revocations(&self) -> Result<Vec<RevocationEntry>, StoreError> {
        let data = self.shared.data.read();
        let mut entries = data.revocations.clone();
        entries.sort_by(|a, b| b.revoked_at.cmp(&a.revoked_at));
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn lookup(
        &self,
        digest: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedCredential>, StoreError> {
        let data = self.shared.data.read();
        Ok(data
            .credentials
            .get(digest)
            .filter(|c| c.expires_at > now)
            .cloned())
    }

    async fn upsert(&self, entry: CachedCredential) -> Result<(), StoreError> {
        self.transact(move |data| {
            data.credentials.insert(entry.digest.clone(), entry);
            Ok(())
        })
        .await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = {
            let data = self.shared.data.read();
            data.credentials
                .values()
                .filter(|c| c.expires_at <= now)
                .count()
        };
        if expired == 0 {
            return Ok(0);
        }
        self.transact(move |data| {
            let before = data.credentials.len();
            data.credentials.retain(|_, c| c.expires_at > now);
            Ok(before - data.credentials.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn record(owner: &str, class: NodeClass, name: &str, host: u8) -> CertificateRecord {
        let now = Utc::now();
        CertificateRecord {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            node_class: class,
            node_name: name.to_string(),
            address: Ipv4Addr::new(192, 168, 100, host),
            environment: None,
            groups: vec!["developer".to_string()],
            certificate_pem: String::new(),
            serial: format!("serial-{owner}-{name}-{host}"),
            created_at: now,
            expires_at: now + ChronoDuration::days(365),
            revoked: false,
            revoked_at: None,
            revoke_reason: None,
            device_metadata: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_active_node() {
        let store = MemoryStore::new();
        store
            .insert(record("u1", NodeClass::Laptop, "mbp", 150))
            .await
            .unwrap();
        let err = store
            .insert(record("u1", NodeClass::Laptop, "mbp", 151))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNode { .. }));
    }

    #[tokio::test]
    async fn insert_rejects_active_address_reuse() {
        let store = MemoryStore::new();
        store
            .insert(record("u1", NodeClass::Laptop, "a", 150))
            .await
            .unwrap();
        let err = store
            .insert(record("u2", NodeClass::Laptop, "b", 150))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AddressInUse(_)));
    }

    #[tokio::test]
    async fn revoked_record_frees_name_and_address() {
        let store = MemoryStore::new();
        store
            .insert(record("u1", NodeClass::Laptop, "mbp", 150))
            .await
            .unwrap();
        let revoked = store
            .revoke("u1", "mbp", "lost", Utc::now())
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(store.active_addresses().await.unwrap().is_empty());

        let mut again = record("u1", NodeClass::Laptop, "mbp", 150);
        again.serial = "second".into();
        store.insert(again).await.unwrap();
    }

    #[tokio::test]
    async fn revoke_without_match_is_a_no_op() {
        let store = MemoryStore::new();
        let revoked = store
            .revoke("u1", "ghost", "lost", Utc::now())
            .await
            .unwrap();
        assert_eq!(revoked, 0);
        assert!(store.revocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revocation_append_is_idempotent_by_serial() {
        let store = MemoryStore::new();
        store
            .insert(record("u1", NodeClass::Laptop, "mbp", 150))
            .await
            .unwrap();
        // Simulate a retried append for a serial already on the list.
        store
            .transact(|data| {
                data.revocations.push(RevocationEntry {
                    serial: "serial-u1-mbp-150".into(),
                    revoked_at: Utc::now(),
                    reason: "earlier".into(),
                });
                Ok(())
            })
            .await
            .unwrap();

        let revoked = store
            .revoke("u1", "mbp", "lost", Utc::now())
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        let list = store.revocations().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reason, "earlier");
        assert!(store.find_active("u1", NodeClass::Laptop, "mbp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first_filtered_and_limited() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for (i, class) in [NodeClass::Laptop, NodeClass::Ec2, NodeClass::Laptop]
            .into_iter()
            .enumerate()
        {
            let mut r = record("u1", class, &format!("n{i}"), 100 + i as u8);
            r.created_at = base + ChronoDuration::seconds(i as i64);
            store.insert(r).await.unwrap();
        }
        store
            .insert(record("u2", NodeClass::Laptop, "other", 120))
            .await
            .unwrap();

        let all = store
            .list(&CertificateQuery {
                owner: "u1".into(),
                node_class: None,
                limit: 20,
            })
            .await
            .unwrap();
        let names: Vec<_> = all.iter().map(|r| r.node_name.as_str()).collect();
        assert_eq!(names, vec!["n2", "n1", "n0"]);

        let laptops = store
            .list(&CertificateQuery {
                owner: "u1".into(),
                node_class: Some(NodeClass::Laptop),
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(laptops.len(), 1);
        assert_eq!(laptops[0].node_name, "n2");
    }

    #[tokio::test]
    async fn credential_lookup_requires_future_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert(CachedCredential {
                digest: "d".into(),
                owner: "u1".into(),
                groups: vec![],
                cached_at: now,
                expires_at: now + ChronoDuration::seconds(300),
            })
            .await
            .unwrap();

        assert!(store.lookup("d", now).await.unwrap().is_some());
        let at_expiry = now + ChronoDuration::seconds(300);
        assert!(store.lookup("d", at_expiry).await.unwrap().is_none());
        assert_eq!(store.sweep_expired(at_expiry).await.unwrap(), 1);
        assert_eq!(store.sweep_expired(at_expiry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let path = lodestar_common::test::temp_dir("store").join("store.json");
        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .insert(record("u1", NodeClass::Ec2, "web-1", 10))
                .await
                .unwrap();
            store.revoke("u1", "web-1", "retired", Utc::now()).await.unwrap();
        }
        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.revocations().await.unwrap().len(), 1);
        let listed = reopened
            .list(&CertificateQuery {
                owner: "u1".into(),
                node_class: None,
                limit: 20,
            })
            .await
            .unwrap();
        assert!(listed[0].revoked);
    }

    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        // A directory at the snapshot path makes every write fail.
        let dir = lodestar_common::test::temp_dir("store-fail");
        let store = MemoryStore::with_data(StoreData::default(), Some(dir));
        let err = store
            .insert(record("u1", NodeClass::Laptop, "mbp", 150))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.active_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_write_times_out_without_blocking_readers() {
        let path = lodestar_common::test::temp_dir("store-stall").join("store.json");
        let store = MemoryStore::open(&path).unwrap();

        // Hold the commit lock so the snapshot write cannot proceed.
        let stall = store.shared.commit.lock();
        let result = bounded(
            Duration::from_millis(50),
            store.insert(record("u1", NodeClass::Laptop, "mbp", 150)),
        )
        .await;
        assert!(matches!(result, Err(LodestarError::Persistence(_))));

        // Reads stay available while the writer is stuck.
        let addresses = bounded(Duration::from_millis(50), store.active_addresses()).await;
        assert!(addresses.unwrap().is_empty());
        drop(stall);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_timeout_to_persistence() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(())
        };
        let err = bounded(Duration::from_secs(1), slow).await.unwrap_err();
        assert!(matches!(err, LodestarError::Persistence(_)));
    }
}
