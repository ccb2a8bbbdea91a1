//! Tenant-partitioned cache of sanitization results
//!
//! Keys always carry the tenant, so an entry computed for one tenant can
//! never be served to another even when the raw content is identical.

use super::engine::{ContentPayload, SanitizationResult};
use crate::patterns::ContentType;
use crate::tenant::TenantId;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Cache key: tenant, content type and a digest of the raw content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    tenant_id: TenantId,
    content_type: ContentType,
    digest: [u8; 32],
}

impl CacheKey {
    pub fn for_payload(payload: &ContentPayload) -> Self {
        let digest: [u8; 32] = Sha256::digest(payload.raw().as_bytes()).into();
        Self {
            tenant_id: payload.tenant_id().clone(),
            content_type: payload.content_type(),
            digest,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, SanitizationResult>,
    order: VecDeque<CacheKey>,
}

/// Bounded FIFO cache of sanitization results.
pub struct SanitizationCache {
    inner: RwLock<CacheInner>,
    capacity: usize,
}

impl SanitizationCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            capacity,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<SanitizationResult> {
        self.inner.read().await.entries.get(key).cloned()
    }

    pub async fn insert(&self, key: CacheKey, result: SanitizationResult) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.write().await;
        if inner.entries.insert(key.clone(), result).is_some() {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// Drop every entry belonging to a tenant.
    pub async fn invalidate_tenant(&self, tenant_id: &TenantId) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|k, _| k.tenant_id() != tenant_id);
        inner.order.retain(|k| k.tenant_id() != tenant_id);
        before - inner.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str) -> SanitizationResult {
        SanitizationResult {
            sanitized: text.to_string(),
            threats_detected: vec![],
            safe: true,
            structure_preserved: true,
        }
    }

    fn key(tenant: &str, raw: &str) -> CacheKey {
        CacheKey::for_payload(&ContentPayload::new(
            raw,
            ContentType::Feedback,
            TenantId::new(tenant).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_same_content_different_tenants_do_not_collide() {
        let cache = SanitizationCache::new(16);
        cache.insert(key("malmo", "hej"), result("malmo")).await;
        assert!(cache.get(&key("stockholm", "hej")).await.is_none());
        assert_eq!(
            cache.get(&key("malmo", "hej")).await.unwrap().sanitized,
            "malmo"
        );
    }

    #[tokio::test]
    async fn test_content_type_is_part_of_key() {
        let tenant = TenantId::new("malmo").unwrap();
        let a = CacheKey::for_payload(&ContentPayload::new("x", ContentType::Document, tenant.clone()));
        let b = CacheKey::for_payload(&ContentPayload::new("x", ContentType::QuizText, tenant));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_eviction_is_fifo() {
        let cache = SanitizationCache::new(2);
        cache.insert(key("malmo", "a"), result("a")).await;
        cache.insert(key("malmo", "b"), result("b")).await;
        cache.insert(key("malmo", "c"), result("c")).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&key("malmo", "a")).await.is_none());
        assert!(cache.get(&key("malmo", "c")).await.is_some());
    }

    #[tokio::test]
    async fn test_zero_capacity_disables() {
        let cache = SanitizationCache::new(0);
        cache.insert(key("malmo", "a"), result("a")).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_tenant() {
        let cache = SanitizationCache::new(16);
        cache.insert(key("malmo", "a"), result("a")).await;
        cache.insert(key("lund", "a"), result("a")).await;
        assert_eq!(cache.invalidate_tenant(&TenantId::new("malmo").unwrap()).await, 1);
        assert_eq!(cache.len().await, 1);
    }
}
