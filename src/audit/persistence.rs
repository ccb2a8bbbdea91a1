//! Per-tenant JSONL incident files
//!
//! Each tenant's trail lives in its own file, `<dir>/<tenant>/incidents.jsonl`,
//! so one municipality's incidents never share storage with another's.
//! Durable appends call `sync_all` before returning.
//!
//! Every operation on a trail holds that tenant's file lock, so a
//! retention rewrite never races an append to the same file.

use super::incident::SecurityIncident;
use crate::error::{Error, Result};
use crate::tenant::TenantId;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

const INCIDENT_FILE: &str = "incidents.jsonl";

/// Append-only per-tenant incident files.
#[derive(Debug, Clone)]
pub struct TenantAuditFiles {
    dir: PathBuf,
    /// One lock per tenant trail, shared by every clone
    locks: Arc<DashMap<TenantId, Arc<Mutex<()>>>>,
}

impl TenantAuditFiles {
    /// Open the audit directory, creating it if needed.
    pub async fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await.map_err(|e| {
            Error::Audit(format!(
                "Failed to create audit directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Arc::new(DashMap::new()),
        })
    }

    fn lock_for(&self, tenant_id: &TenantId) -> Arc<Mutex<()>> {
        self.locks.entry(tenant_id.clone()).or_default().clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tenant_id: &TenantId) -> PathBuf {
        self.dir.join(tenant_id.as_str()).join(INCIDENT_FILE)
    }

    /// Append incidents of one tenant. `durable` forces them to disk.
    pub async fn append(
        &self,
        tenant_id: &TenantId,
        incidents: &[SecurityIncident],
        durable: bool,
    ) -> Result<()> {
        if incidents.is_empty() {
            return Ok(());
        }
        let lock = self.lock_for(tenant_id);
        let _guard = lock.lock().await;
        let mut buf = String::new();
        for incident in incidents {
            if &incident.tenant_id != tenant_id {
                return Err(Error::Audit(format!(
                    "Incident for {} routed to trail of {}",
                    incident.tenant_id, tenant_id
                )));
            }
            buf.push_str(&serde_json::to_string(incident)?);
            buf.push('\n');
        }

        let path = self.path_for(tenant_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Audit(format!("Failed to create tenant audit dir: {}", e)))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                Error::Audit(format!("Failed to open audit file {}: {}", path.display(), e))
            })?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| Error::Audit(format!("Failed to write audit incident: {}", e)))?;
        if durable {
            file.sync_all()
                .await
                .map_err(|e| Error::Audit(format!("Failed to sync audit file: {}", e)))?;
        } else {
            file.flush()
                .await
                .map_err(|e| Error::Audit(format!("Failed to flush audit file: {}", e)))?;
        }
        Ok(())
    }

    /// All persisted incidents of a tenant, oldest first.
    pub async fn load(&self, tenant_id: &TenantId) -> Result<Vec<SecurityIncident>> {
        let lock = self.lock_for(tenant_id);
        let _guard = lock.lock().await;
        self.load_unlocked(tenant_id).await
    }

    async fn load_unlocked(&self, tenant_id: &TenantId) -> Result<Vec<SecurityIncident>> {
        let path = self.path_for(tenant_id);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Audit(format!(
                    "Failed to open audit file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut lines = BufReader::new(file).lines();
        let mut incidents = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::Audit(format!("Failed to read audit file: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SecurityIncident>(&line) {
                Ok(incident) => incidents.push(incident),
                Err(e) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %e, "Skipping unreadable audit line")
                }
            }
        }
        Ok(incidents)
    }

    /// Atomically replace a tenant's trail.
    pub async fn rewrite(&self, tenant_id: &TenantId, incidents: &[SecurityIncident]) -> Result<()> {
        let lock = self.lock_for(tenant_id);
        let _guard = lock.lock().await;
        self.rewrite_unlocked(tenant_id, incidents).await
    }

    /// Keep only the incidents matching `keep`, holding the tenant's lock
    /// from read to rename. Returns how many were removed.
    pub async fn retain<F>(&self, tenant_id: &TenantId, keep: F) -> Result<usize>
    where
        F: Fn(&SecurityIncident) -> bool,
    {
        let lock = self.lock_for(tenant_id);
        let _guard = lock.lock().await;
        let incidents = self.load_unlocked(tenant_id).await?;
        let before = incidents.len();
        let kept: Vec<SecurityIncident> = incidents.into_iter().filter(|i| keep(i)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite_unlocked(tenant_id, &kept).await?;
        }
        Ok(removed)
    }

    async fn rewrite_unlocked(&self, tenant_id: &TenantId, incidents: &[SecurityIncident]) -> Result<()> {
        let path = self.path_for(tenant_id);
        let tmp = path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for incident in incidents {
            buf.push_str(&serde_json::to_string(incident)?);
            buf.push('\n');
        }
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| Error::Audit(format!("Failed to create {}: {}", tmp.display(), e)))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| Error::Audit(format!("Failed to write audit file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Audit(format!("Failed to sync audit file: {}", e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Audit(format!("Failed to replace audit file: {}", e)))?;
        Ok(())
    }

    /// Tenants that have a trail on disk
    pub async fn tenants(&self) -> Result<Vec<TenantId>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Audit(format!("Failed to read audit dir: {}", e)))?;
        let mut tenants = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Audit(format!("Failed to read dir entry: {}", e)))?
        {
            if let Ok(id) = TenantId::new(entry.file_name().to_string_lossy().to_string()) {
                if entry.path().join(INCIDENT_FILE).exists() {
                    tenants.push(id);
                }
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::incident::{Component, Decision};
    use crate::patterns::ThreatKind;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn incident(t: &str) -> SecurityIncident {
        SecurityIncident::new(tenant(t), ThreatKind::ScriptTag, Component::Sanitizer, Decision::Sanitized)
    }

    #[tokio::test]
    async fn test_append_and_load_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let files = TenantAuditFiles::new(dir.path()).await.unwrap();
        files.append(&tenant("malmo"), &[incident("malmo")], true).await.unwrap();
        files
            .append(&tenant("lund"), &[incident("lund"), incident("lund")], false)
            .await
            .unwrap();

        assert_eq!(files.load(&tenant("malmo")).await.unwrap().len(), 1);
        assert_eq!(files.load(&tenant("lund")).await.unwrap().len(), 2);
        assert!(files.load(&tenant("kiruna")).await.unwrap().is_empty());
        assert!(dir.path().join("malmo").join("incidents.jsonl").exists());
        assert_eq!(files.tenants().await.unwrap(), vec![tenant("lund"), tenant("malmo")]);
    }

    #[tokio::test]
    async fn test_wrong_tenant_refused() {
        let dir = tempfile::tempdir().unwrap();
        let files = TenantAuditFiles::new(dir.path()).await.unwrap();
        let result = files.append(&tenant("malmo"), &[incident("lund")], true).await;
        assert!(matches!(result, Err(Error::Audit(_))));
    }

    #[tokio::test]
    async fn test_rewrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let files = TenantAuditFiles::new(dir.path()).await.unwrap();
        files
            .append(&tenant("malmo"), &[incident("malmo"), incident("malmo")], true)
            .await
            .unwrap();
        let kept = vec![incident("malmo")];
        files.rewrite(&tenant("malmo"), &kept).await.unwrap();
        assert_eq!(files.load(&tenant("malmo")).await.unwrap(), kept);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retain_does_not_lose_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let files = TenantAuditFiles::new(dir.path()).await.unwrap();
        let mut stale = incident("malmo");
        stale.timestamp = 0;
        files.append(&tenant("malmo"), &[stale], true).await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let files = files.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        files
                            .append(&tenant("malmo"), &[incident("malmo")], false)
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        let mut removed = 0;
        for _ in 0..20 {
            removed += files
                .retain(&tenant("malmo"), |i| i.timestamp > 0)
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
        for w in writers {
            w.await.unwrap();
        }
        removed += files.retain(&tenant("malmo"), |i| i.timestamp > 0).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(files.load(&tenant("malmo")).await.unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let files = TenantAuditFiles::new(dir.path()).await.unwrap();
        files.append(&tenant("malmo"), &[incident("malmo")], true).await.unwrap();
        let path = files.path_for(&tenant("malmo"));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();
        assert_eq!(files.load(&tenant("malmo")).await.unwrap().len(), 1);
    }
}
