//! Tenant-segregated audit logger
//!
//! ```text
//! record(incident)
//!   ├─ critical ──► append + sync_all ──────────────┐
//!   └─ other ─────► bounded queue ─► flusher task ──┤──► <dir>/<tenant>/incidents.jsonl
//!                    (full: synchronous append) ────┘
//!   then: per-tenant memory ring, broadcast feed
//! ```
//!
//! A critical incident is on disk before `record` returns. When that write
//! fails the error is returned so the triggering operation can fail closed.

use super::incident::{IncidentFilter, IncidentStats, SecurityIncident, Severity};
use super::persistence::TenantAuditFiles;
use super::retention::RetentionPolicy;
use crate::error::{Error, Result};
use crate::tenant::TenantId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Audit logger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Root directory of the per-tenant trails
    pub dir: PathBuf,
    /// Capacity of the asynchronous write queue
    pub buffer_capacity: usize,
    /// Flush interval for buffered incidents in milliseconds
    pub flush_interval_ms: u64,
    /// Incidents kept in memory per tenant
    pub memory_capacity: usize,
    pub retention: RetentionPolicy,
    /// Capacity of the incident feed
    pub feed_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            buffer_capacity: 1024,
            flush_interval_ms: 200,
            memory_capacity: 10_000,
            retention: RetentionPolicy::default(),
            feed_capacity: 256,
        }
    }
}

fn default_audit_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("civicguard")
        .join("audit")
}

/// Buffered incidents written in one batch
const FLUSH_BATCH: usize = 64;

enum FlushCommand {
    Write(SecurityIncident),
    Flush(oneshot::Sender<Result<()>>),
}

/// Append-only, per-tenant audit logger
pub struct AuditLogger {
    files: TenantAuditFiles,
    /// Recent incidents per tenant, oldest first
    memory: DashMap<TenantId, VecDeque<SecurityIncident>>,
    memory_capacity: usize,
    queue: mpsc::Sender<FlushCommand>,
    feed: broadcast::Sender<SecurityIncident>,
    retention: RetentionPolicy,
}

impl AuditLogger {
    /// Open the audit directory, load existing trails and start the flusher.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(config: &AuditConfig) -> Result<Arc<Self>> {
        if config.buffer_capacity == 0 || config.feed_capacity == 0 {
            return Err(Error::Config(
                "audit buffer_capacity and feed_capacity must be positive".to_string(),
            ));
        }
        let files = TenantAuditFiles::new(&config.dir).await?;
        let (queue, rx) = mpsc::channel(config.buffer_capacity);
        let (feed, _) = broadcast::channel(config.feed_capacity);

        let logger = Arc::new(Self {
            files: files.clone(),
            memory: DashMap::new(),
            memory_capacity: config.memory_capacity.max(1),
            queue,
            feed,
            retention: config.retention.clone(),
        });
        logger.hydrate().await?;

        tokio::spawn(run_flusher(
            files,
            rx,
            Duration::from_millis(config.flush_interval_ms.max(1)),
        ));

        tracing::info!(
            dir = %config.dir.display(),
            regime = %config.retention.regime,
            "Audit logger opened"
        );
        Ok(logger)
    }

    async fn hydrate(&self) -> Result<()> {
        for tenant_id in self.files.tenants().await? {
            let incidents = self.files.load(&tenant_id).await?;
            let skip = incidents.len().saturating_sub(self.memory_capacity);
            let ring: VecDeque<SecurityIncident> = incidents.into_iter().skip(skip).collect();
            tracing::debug!(tenant_id = %tenant_id, count = ring.len(), "Loaded audit trail");
            self.memory.insert(tenant_id, ring);
        }
        Ok(())
    }

    /// Record an incident in its tenant's trail.
    pub async fn record(&self, incident: SecurityIncident) -> Result<()> {
        if incident.severity == Severity::Critical {
            self.files
                .append(&incident.tenant_id, std::slice::from_ref(&incident), true)
                .await?;
        } else {
            match self.queue.try_send(FlushCommand::Write(incident.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(tenant_id = %incident.tenant_id, "Audit queue unavailable, writing synchronously");
                    self.files
                        .append(&incident.tenant_id, std::slice::from_ref(&incident), false)
                        .await?;
                }
            }
        }

        if incident.blocked {
            tracing::warn!(
                tenant_id = %incident.tenant_id,
                threat = %incident.threat_kind,
                severity = incident.severity.as_str(),
                incident_id = %incident.incident_id,
                "Security incident recorded"
            );
        } else {
            tracing::info!(
                tenant_id = %incident.tenant_id,
                threat = %incident.threat_kind,
                severity = incident.severity.as_str(),
                "Threat sanitized"
            );
        }

        {
            let mut ring = self.memory.entry(incident.tenant_id.clone()).or_default();
            ring.push_back(incident.clone());
            while ring.len() > self.memory_capacity {
                ring.pop_front();
            }
        }

        // No subscribers is fine
        let _ = self.feed.send(incident);
        Ok(())
    }

    /// Wait until every queued incident is on disk.
    ///
    /// Fails when a buffered batch could not be written; those incidents stay
    /// queued and are retried on the next flush.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(FlushCommand::Flush(tx))
            .await
            .map_err(|_| Error::Audit("Audit flusher stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Audit("Audit flusher stopped".to_string()))?
    }

    /// Recent incidents of one tenant
    pub fn incidents(&self, tenant_id: &TenantId, filter: &IncidentFilter) -> Vec<SecurityIncident> {
        self.memory
            .get(tenant_id)
            .map(|ring| filter.apply(ring.iter()))
            .unwrap_or_default()
    }

    /// Full persisted trail of one tenant
    pub async fn load_persisted(&self, tenant_id: &TenantId) -> Result<Vec<SecurityIncident>> {
        self.flush().await?;
        self.files.load(tenant_id).await
    }

    pub fn stats(&self, tenant_id: &TenantId) -> IncidentStats {
        self.memory
            .get(tenant_id)
            .map(|ring| IncidentStats::from_incidents(ring.iter()))
            .unwrap_or_default()
    }

    /// Subscribe to the incident feed. Consumers filter by tenant.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityIncident> {
        self.feed.subscribe()
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Drop incidents outside the retention window. Returns how many were
    /// removed per tenant.
    pub async fn purge_expired(&self, now_ms: i64) -> Result<BTreeMap<TenantId, usize>> {
        let mut purged = BTreeMap::new();
        if self.retention.cutoff(now_ms).is_none() {
            return Ok(purged);
        }
        self.flush().await?;

        for tenant_id in self.files.tenants().await? {
            let removed = self
                .files
                .retain(&tenant_id, |i| self.retention.retains(i.timestamp, now_ms))
                .await?;
            if removed == 0 {
                continue;
            }
            if let Some(mut ring) = self.memory.get_mut(&tenant_id) {
                ring.retain(|i| self.retention.retains(i.timestamp, now_ms));
            }
            tracing::info!(
                tenant_id = %tenant_id,
                removed,
                regime = %self.retention.regime,
                "Purged expired audit incidents"
            );
            purged.insert(tenant_id, removed);
        }
        Ok(purged)
    }

    /// Periodically apply the retention policy.
    pub fn spawn_retention_sweeper(
        self: &Arc<Self>,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                if let Err(e) = logger.purge_expired(now).await {
                    tracing::error!(error = %e, "Audit retention sweep failed");
                }
            }
        })
    }
}

async fn run_flusher(
    files: TenantAuditFiles,
    mut rx: mpsc::Receiver<FlushCommand>,
    interval: Duration,
) {
    let mut buffer: Vec<SecurityIncident> = Vec::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(FlushCommand::Write(incident)) => {
                    buffer.push(incident);
                    if buffer.len() >= FLUSH_BATCH {
                        let _ = write_batch(&files, &mut buffer).await;
                    }
                }
                Some(FlushCommand::Flush(done)) => {
                    let _ = done.send(write_batch(&files, &mut buffer).await);
                }
                None => {
                    if write_batch(&files, &mut buffer).await.is_err() {
                        tracing::error!(count = buffer.len(), "Audit incidents lost at shutdown");
                    }
                    break;
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    let _ = write_batch(&files, &mut buffer).await;
                }
            }
        }
    }
    tracing::debug!("Audit flusher stopped");
}

/// Write the buffer tenant by tenant. Batches that fail go back into the
/// buffer in their original order.
async fn write_batch(files: &TenantAuditFiles, buffer: &mut Vec<SecurityIncident>) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let mut by_tenant: BTreeMap<TenantId, Vec<SecurityIncident>> = BTreeMap::new();
    for incident in buffer.drain(..) {
        by_tenant
            .entry(incident.tenant_id.clone())
            .or_default()
            .push(incident);
    }
    let mut failure = None;
    for (tenant_id, incidents) in by_tenant {
        if let Err(e) = files.append(&tenant_id, &incidents, false).await {
            tracing::error!(
                tenant_id = %tenant_id,
                count = incidents.len(),
                error = %e,
                "Failed to flush audit incidents, keeping them queued"
            );
            buffer.extend(incidents);
            failure = Some(e);
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::incident::{Component, Decision};
    use crate::audit::retention::RetentionRegime;
    use crate::patterns::ThreatKind;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn config(dir: &std::path::Path) -> AuditConfig {
        AuditConfig {
            dir: dir.to_path_buf(),
            flush_interval_ms: 10,
            ..Default::default()
        }
    }

    fn sanitized(t: &str) -> SecurityIncident {
        SecurityIncident::new(tenant(t), ThreatKind::ScriptTag, Component::Sanitizer, Decision::Sanitized)
    }

    fn denial(t: &str) -> SecurityIncident {
        SecurityIncident::new(
            tenant(t),
            ThreatKind::CrossTenantAccess,
            Component::Isolation,
            Decision::Denied,
        )
    }

    // ---- Durability ----

    #[tokio::test]
    async fn test_critical_on_disk_before_return() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
        logger.record(denial("malmo")).await.unwrap();

        let files = TenantAuditFiles::new(dir.path()).await.unwrap();
        let on_disk = files.load(&tenant("malmo")).await.unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_buffered_visible_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
        logger.record(sanitized("lund")).await.unwrap();
        logger.record(sanitized("lund")).await.unwrap();
        logger.flush().await.unwrap();
        assert_eq!(logger.load_persisted(&tenant("lund")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_critical_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
        // A plain file where the tenant directory should be
        std::fs::write(dir.path().join("malmo"), b"blocked").unwrap();
        let result = logger.record(denial("malmo")).await;
        assert!(matches!(result, Err(Error::Audit(_))));
        assert!(logger.incidents(&tenant("malmo"), &IncidentFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_is_reported_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::open(&AuditConfig {
            flush_interval_ms: 60_000,
            ..config(dir.path())
        })
        .await
        .unwrap();
        let blocker = dir.path().join("lund");
        std::fs::write(&blocker, b"blocked").unwrap();

        logger.record(sanitized("lund")).await.unwrap();
        assert!(matches!(logger.flush().await, Err(Error::Audit(_))));

        std::fs::remove_file(&blocker).unwrap();
        logger.flush().await.unwrap();
        assert_eq!(logger.load_persisted(&tenant("lund")).await.unwrap().len(), 1);
    }

    // ---- Segregation ----

    #[tokio::test]
    async fn test_trails_are_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
        logger.record(denial("malmo")).await.unwrap();
        logger.record(sanitized("stockholm")).await.unwrap();

        let malmo = logger.incidents(&tenant("malmo"), &IncidentFilter::default());
        assert_eq!(malmo.len(), 1);
        assert!(malmo.iter().all(|i| i.tenant_id == tenant("malmo")));
        assert_eq!(logger.stats(&tenant("stockholm")).total, 1);
        assert_eq!(logger.stats(&tenant("kiruna")).total, 0);
    }

    #[tokio::test]
    async fn test_reopen_hydrates_memory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
            logger.record(denial("malmo")).await.unwrap();
            logger.record(sanitized("malmo")).await.unwrap();
            logger.flush().await.unwrap();
        }
        let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
        assert_eq!(logger.stats(&tenant("malmo")).total, 2);
    }

    // ---- Feed ----

    #[tokio::test]
    async fn test_feed_receives_incidents() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::open(&config(dir.path())).await.unwrap();
        let mut rx = logger.subscribe();
        logger.record(denial("malmo")).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.tenant_id, tenant("malmo"));
        assert_eq!(received.threat_kind, ThreatKind::CrossTenantAccess);
    }

    // ---- Retention ----

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AuditConfig {
            retention: RetentionPolicy::new(RetentionRegime::Custom).with_days(30),
            ..config(dir.path())
        };
        let logger = AuditLogger::open(&cfg).await.unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        let mut old = denial("malmo");
        old.timestamp = now - 40 * DAY;
        logger.record(old).await.unwrap();
        logger.record(denial("malmo")).await.unwrap();

        let purged = logger.purge_expired(now).await.unwrap();
        assert_eq!(purged.get(&tenant("malmo")), Some(&1));
        assert_eq!(logger.load_persisted(&tenant("malmo")).await.unwrap().len(), 1);
        assert_eq!(logger.stats(&tenant("malmo")).total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_purge_keeps_concurrent_critical_incidents() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AuditConfig {
            retention: RetentionPolicy::new(RetentionRegime::Custom).with_days(30),
            ..config(dir.path())
        };
        let logger = AuditLogger::open(&cfg).await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let logger = Arc::clone(&logger);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        logger.record(denial("malmo")).await.unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..20 {
            let now = chrono::Utc::now().timestamp_millis();
            logger.purge_expired(now).await.unwrap();
        }
        for w in writers {
            w.await.unwrap();
        }
        assert_eq!(logger.load_persisted(&tenant("malmo")).await.unwrap().len(), 80);
    }

    const DAY: i64 = 24 * 60 * 60 * 1000;
}
