//! Tenant-partitioned key/value store
//!
//! Data, cache, session and configuration values live in one partition per
//! tenant. Every operation names a [`ScopedKey`] and goes through the
//! [`TenantIsolationEnforcer`] before the partition is touched.

use super::context::TenantId;
use super::enforcer::{Namespace, RequestScope, ScopedKey, TenantIsolationEnforcer};
use crate::error::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

type Partition = HashMap<(Namespace, String), Entry>;

/// Per-tenant partitioned store (DashMap for per-tenant locking)
pub struct IsolatedStore {
    enforcer: Arc<TenantIsolationEnforcer>,
    partitions: DashMap<TenantId, Partition>,
}

impl IsolatedStore {
    pub fn new(enforcer: Arc<TenantIsolationEnforcer>) -> Self {
        Self {
            enforcer,
            partitions: DashMap::new(),
        }
    }

    pub fn enforcer(&self) -> &Arc<TenantIsolationEnforcer> {
        &self.enforcer
    }

    pub async fn get(&self, scope: &mut RequestScope, key: &ScopedKey) -> Result<Option<Value>> {
        self.enforcer.authorize_key(scope, key).await?;
        let now = Instant::now();
        let Some(mut partition) = self.partitions.get_mut(&key.tenant_id) else {
            return Ok(None);
        };
        let slot = (key.namespace, key.key.clone());
        match partition.get(&slot) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                partition.remove(&slot);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn put(&self, scope: &mut RequestScope, key: &ScopedKey, value: Value) -> Result<()> {
        self.insert(scope, key, value, None).await
    }

    /// Store a value that expires after `ttl`, typically in the cache namespace.
    pub async fn put_with_ttl(
        &self,
        scope: &mut RequestScope,
        key: &ScopedKey,
        value: Value,
        ttl: Duration,
    ) -> Result<()> {
        self.insert(scope, key, value, Some(Instant::now() + ttl))
            .await
    }

    async fn insert(
        &self,
        scope: &mut RequestScope,
        key: &ScopedKey,
        value: Value,
        expires_at: Option<Instant>,
    ) -> Result<()> {
        self.enforcer.authorize_key(scope, key).await?;
        self.partitions
            .entry(key.tenant_id.clone())
            .or_default()
            .insert((key.namespace, key.key.clone()), Entry { value, expires_at });
        Ok(())
    }

    /// Remove a key. Returns whether a live value was removed.
    pub async fn delete(&self, scope: &mut RequestScope, key: &ScopedKey) -> Result<bool> {
        self.enforcer.authorize_key(scope, key).await?;
        let now = Instant::now();
        Ok(self
            .partitions
            .get_mut(&key.tenant_id)
            .and_then(|mut p| p.remove(&(key.namespace, key.key.clone())))
            .is_some_and(|entry| entry.is_live(now)))
    }

    /// Live keys of the scope's own tenant in one namespace, sorted
    pub async fn list(&self, scope: &mut RequestScope, namespace: Namespace) -> Result<Vec<String>> {
        let tenant_id = scope.require_context()?.tenant_id.clone();
        self.enforcer
            .enforce(scope, &tenant_id, namespace.as_str())
            .await?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .partitions
            .get(&tenant_id)
            .map(|p| {
                p.iter()
                    .filter(|((ns, _), entry)| *ns == namespace && entry.is_live(now))
                    .map(|((_, k), _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// Drop expired entries across all partitions
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for mut partition in self.partitions.iter_mut() {
            let before = partition.len();
            partition.retain(|_, entry| entry.is_live(now));
            evicted += before - partition.len();
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditLogger};
    use crate::error::Error;
    use crate::tenant::context::{IsolationLevel, Region};
    use crate::tenant::registry::{StaticTenantRegistry, TenantRecord};
    use crate::tenant::session::SessionManager;
    use proptest::prelude::*;
    use serde_json::json;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    async fn store(dir: &std::path::Path) -> IsolatedStore {
        let records: Vec<TenantRecord> = ["malmo", "stockholm"]
            .iter()
            .map(|id| TenantRecord {
                id: tenant(id),
                region: Region::new("se"),
                isolation_level: IsolationLevel::Standard,
            })
            .collect();
        let registry = Arc::new(StaticTenantRegistry::from_records(&records).unwrap());
        let sessions = Arc::new(SessionManager::new(SECRET, 3600).unwrap());
        let audit = AuditLogger::open(&AuditConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let enforcer = TenantIsolationEnforcer::new(registry, sessions, audit, Region::new("se"));
        IsolatedStore::new(Arc::new(enforcer))
    }

    fn scope_for(store: &IsolatedStore, id: &str) -> RequestScope {
        let session = store.enforcer().sessions().issue(&tenant(id), "user");
        store.enforcer().resolve(&session.token).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete_own_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut scope = scope_for(&store, "malmo");
        let key = scope.key(Namespace::Data, "quiz-1").unwrap();

        store.put(&mut scope, &key, json!({"q": "Vad heter kommunen?"})).await.unwrap();
        assert_eq!(
            store.get(&mut scope, &key).await.unwrap(),
            Some(json!({"q": "Vad heter kommunen?"}))
        );
        assert_eq!(store.list(&mut scope, Namespace::Data).await.unwrap(), vec!["quiz-1"]);
        assert!(store.list(&mut scope, Namespace::Cache).await.unwrap().is_empty());
        assert!(store.delete(&mut scope, &key).await.unwrap());
        assert_eq!(store.get(&mut scope, &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malmo_cannot_read_stockholm() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut sthlm = scope_for(&store, "stockholm");
        let key = sthlm.key(Namespace::Data, "grades").unwrap();
        store.put(&mut sthlm, &key, json!("secret")).await.unwrap();

        let mut malmo = scope_for(&store, "malmo");
        let result = store.get(&mut malmo, &key).await;
        assert!(matches!(result, Err(Error::IsolationViolation { .. })));
        assert!(store.delete(&mut scope_for(&store, "malmo"), &key).await.is_err());

        let mut sthlm = scope_for(&store, "stockholm");
        assert_eq!(store.get(&mut sthlm, &key).await.unwrap(), Some(json!("secret")));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut scope = scope_for(&store, "malmo");
        let key = scope.key(Namespace::Cache, "render").unwrap();
        store
            .put_with_ttl(&mut scope, &key, json!(1), Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.get(&mut scope, &key).await.unwrap(), None);

        store
            .put_with_ttl(&mut scope, &key, json!(2), Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(store.evict_expired(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_scope_denied() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut scope = RequestScope::new();
        let key = ScopedKey::new(tenant("malmo"), Namespace::Data, "k").unwrap();
        assert!(store.get(&mut scope, &key).await.is_err());
        assert!(store.list(&mut scope, Namespace::Data).await.is_err());
    }

    // ---- Isolation property ----

    #[derive(Debug, Clone)]
    enum Op {
        Get(usize),
        Put(usize),
        Delete(usize),
        List,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..8).prop_map(Op::Get),
            (0usize..8).prop_map(Op::Put),
            (0usize..8).prop_map(Op::Delete),
            Just(Op::List),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_other_tenant_never_sees_values(
            keys in proptest::collection::btree_set("[a-z0-9]{1,8}", 1..8),
            ops in proptest::collection::vec((op_strategy(), any::<bool>()), 1..24),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let store = store(dir.path()).await;
                let keys: Vec<String> = keys.into_iter().collect();

                let mut a = scope_for(&store, "stockholm");
                for k in &keys {
                    let key = a.key(Namespace::Data, k.clone()).unwrap();
                    store.put(&mut a, &key, json!(format!("secret-{}", k))).await.unwrap();
                }

                for (op, target_a) in ops {
                    let mut b = scope_for(&store, "malmo");
                    let owner = if target_a { "stockholm" } else { "malmo" };
                    let pick = |i: usize| {
                        ScopedKey::new(tenant(owner), Namespace::Data, keys[i % keys.len()].clone()).unwrap()
                    };
                    match op {
                        Op::Get(i) => {
                            let result = store.get(&mut b, &pick(i)).await;
                            if target_a {
                                assert!(result.is_err());
                            } else if let Ok(Some(value)) = result {
                                assert!(!value.as_str().unwrap_or("").starts_with("secret-"));
                            }
                        }
                        Op::Put(i) => {
                            let result = store.put(&mut b, &pick(i), json!("from-malmo")).await;
                            assert_eq!(result.is_err(), target_a);
                        }
                        Op::Delete(i) => {
                            let result = store.delete(&mut b, &pick(i)).await;
                            assert_eq!(result.is_err(), target_a);
                        }
                        Op::List => {
                            let listed = store.list(&mut b, Namespace::Data).await.unwrap();
                            for k in listed {
                                let key = ScopedKey::new(tenant("malmo"), Namespace::Data, k).unwrap();
                                let mut b2 = scope_for(&store, "malmo");
                                let value = store.get(&mut b2, &key).await.unwrap();
                                assert_eq!(value, Some(json!("from-malmo")));
                            }
                        }
                    }
                }

                // Stockholm's data is untouched
                let mut a = scope_for(&store, "stockholm");
                for k in &keys {
                    let key = a.key(Namespace::Data, k.clone()).unwrap();
                    let value = store.get(&mut a, &key).await.unwrap();
                    assert_eq!(value, Some(json!(format!("secret-{}", k))));
                }
            });
        }
    }
}
