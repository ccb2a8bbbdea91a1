//! Security metrics snapshots and corpus evaluation

use crate::audit::TenantAuditFiles;
use crate::error::{Error, Result, RejectReason};
use crate::patterns::{ContentType, ThreatKind};
use crate::sanitize::{ContentPayload, SanitizationEngine};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Aggregated metrics of one domain over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub domain: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub detection_accuracy: f64,
    pub false_positive_rate: f64,
    #[serde(default)]
    pub isolation_probes: u64,
    #[serde(default)]
    pub isolation_breaches: u64,
}

impl MetricsSnapshot {
    /// `1 - breaches / probes`, 1.0 without probes
    pub fn isolation_guarantee(&self) -> f64 {
        if self.isolation_probes == 0 {
            return 1.0;
        }
        1.0 - (self.isolation_breaches as f64 / self.isolation_probes as f64)
    }
}

/// Read snapshots from a JSON file holding an array of snapshots
pub fn load_snapshots(path: &Path) -> Result<Vec<MetricsSnapshot>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Baseline(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Baseline(format!("Invalid metrics file {}: {}", path.display(), e)))
}

/// Domain the audit trail's isolation counts are reported under
pub const ISOLATION_DOMAIN: &str = "isolation";

/// Isolation incidents taken from the tenant audit trails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsolationCounts {
    /// Cross-tenant and residency incidents in the window
    pub attempts: u64,
    /// Those that were not denied
    pub breaches: u64,
}

impl IsolationCounts {
    /// Fold the counts into the isolation snapshot, adding one for the
    /// window when none was supplied.
    pub fn apply(
        &self,
        snapshots: &mut Vec<MetricsSnapshot>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        let mut found = false;
        for snapshot in snapshots.iter_mut().filter(|s| s.domain == ISOLATION_DOMAIN) {
            snapshot.isolation_probes = snapshot.isolation_probes.saturating_add(self.attempts);
            snapshot.isolation_breaches = snapshot.isolation_breaches.saturating_add(self.breaches);
            found = true;
        }
        if !found {
            snapshots.push(MetricsSnapshot {
                domain: ISOLATION_DOMAIN.to_string(),
                window_start,
                window_end,
                detection_accuracy: 1.0,
                false_positive_rate: 0.0,
                isolation_probes: self.attempts,
                isolation_breaches: self.breaches,
            });
        }
    }
}

/// Count isolation incidents across every tenant trail with a timestamp
/// in `[window_start, window_end)`.
pub async fn isolation_counts(
    files: &TenantAuditFiles,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<IsolationCounts> {
    let (from, to) = (window_start.timestamp_millis(), window_end.timestamp_millis());
    let mut counts = IsolationCounts::default();
    for tenant_id in files.tenants().await? {
        for incident in files.load(&tenant_id).await? {
            let isolation = matches!(
                incident.threat_kind,
                ThreatKind::CrossTenantAccess | ThreatKind::ResidencyViolation
            );
            if !isolation || incident.timestamp < from || incident.timestamp >= to {
                continue;
            }
            counts.attempts += 1;
            if !incident.blocked {
                counts.breaches += 1;
            }
        }
    }
    tracing::debug!(
        attempts = counts.attempts,
        breaches = counts.breaches,
        dir = %files.dir().display(),
        "Isolation incidents aggregated"
    );
    Ok(counts)
}

/// One labelled corpus line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabeledSample {
    pub content: String,
    pub content_type: ContentType,
    /// Whether the sample carries an attack
    pub malicious: bool,
    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_domain() -> String {
    "sanitization".to_string()
}

/// Read a JSONL corpus, one [`LabeledSample`] per line
pub fn load_corpus(path: &Path) -> Result<Vec<LabeledSample>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Baseline(format!("Failed to read {}: {}", path.display(), e)))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::Baseline(format!("{}:{}: invalid sample: {}", path.display(), n + 1, e))
            })
        })
        .collect()
}

#[derive(Default)]
struct Confusion {
    true_pos: u64,
    true_neg: u64,
    false_pos: u64,
    false_neg: u64,
}

impl Confusion {
    fn accuracy(&self) -> f64 {
        let total = self.true_pos + self.true_neg + self.false_pos + self.false_neg;
        if total == 0 {
            return 0.0;
        }
        (self.true_pos + self.true_neg) as f64 / total as f64
    }

    fn false_positive_rate(&self) -> f64 {
        let benign = self.false_pos + self.true_neg;
        if benign == 0 {
            return 0.0;
        }
        self.false_pos as f64 / benign as f64
    }
}

/// Run the engine over a labelled corpus and produce one snapshot per
/// domain. A sample counts as detected when it is rejected, reported with
/// threats, or reduced to an unsafe result.
pub fn evaluate_corpus(
    engine: &SanitizationEngine,
    samples: &[LabeledSample],
) -> Result<Vec<MetricsSnapshot>> {
    let tenant = TenantId::new("baseline-eval")?;
    let start = Utc::now();
    let mut by_domain: BTreeMap<&str, Confusion> = BTreeMap::new();

    for sample in samples {
        let payload = ContentPayload::new(sample.content.clone(), sample.content_type, tenant.clone());
        let detected = match engine.sanitize(&payload) {
            Ok(result) => !result.threats_detected.is_empty() || !result.safe,
            Err(Error::Rejected { reason, .. }) => reason != RejectReason::Oversized,
            Err(e) => return Err(e),
        };
        let cell = by_domain.entry(sample.domain.as_str()).or_default();
        match (sample.malicious, detected) {
            (true, true) => cell.true_pos += 1,
            (true, false) => cell.false_neg += 1,
            (false, true) => cell.false_pos += 1,
            (false, false) => cell.true_neg += 1,
        }
    }

    let end = Utc::now();
    Ok(by_domain
        .into_iter()
        .map(|(domain, cell)| {
            tracing::debug!(
                domain,
                true_pos = cell.true_pos,
                false_neg = cell.false_neg,
                false_pos = cell.false_pos,
                "Corpus domain evaluated"
            );
            MetricsSnapshot {
                domain: domain.to_string(),
                window_start: start,
                window_end: end,
                detection_accuracy: cell.accuracy(),
                false_positive_rate: cell.false_positive_rate(),
                isolation_probes: 0,
                isolation_breaches: 0,
            }
        })
        .collect())
}
