//! Regression gate against the last accepted baseline

use super::metrics::MetricsSnapshot;
use super::store::{BaselineDocument, BaselineStore};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;

/// Metric compared against a baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    DetectionAccuracy,
    FalsePositiveRate,
    IsolationGuarantee,
    /// No snapshot was supplied for the domain
    Missing,
}

/// One metric outside its accepted band
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Regression {
    pub domain: String,
    pub metric: Metric,
    pub accepted: f64,
    pub measured: Option<f64>,
}

impl std::fmt::Display for Regression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.measured {
            Some(measured) => write!(
                f,
                "{}: {:?} {} outside accepted {}",
                self.domain, self.metric, measured, self.accepted
            ),
            None => write!(f, "{}: no metrics supplied", self.domain),
        }
    }
}

/// Outcome of a baseline comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineReport {
    pub baseline_version: u32,
    pub regressed: bool,
    pub regressions: Vec<Regression>,
    pub checked_domains: Vec<String>,
}

/// Compare snapshots with a baseline. Every baseline domain must have a
/// snapshot; a missing one is a regression. When a domain has several
/// snapshots the last one counts.
pub fn compare(baseline: &BaselineDocument, snapshots: &[MetricsSnapshot]) -> BaselineReport {
    let latest: HashMap<&str, &MetricsSnapshot> =
        snapshots.iter().map(|s| (s.domain.as_str(), s)).collect();
    let mut regressions = Vec::new();
    let mut checked = Vec::new();

    for accepted in &baseline.baselines {
        checked.push(accepted.domain.clone());
        let Some(snapshot) = latest.get(accepted.domain.as_str()) else {
            regressions.push(Regression {
                domain: accepted.domain.clone(),
                metric: Metric::Missing,
                accepted: 0.0,
                measured: None,
            });
            continue;
        };

        let mut check = |metric: Metric, accepted_value: f64, measured: f64, ok: bool| {
            if !(measured.is_finite() && ok) {
                regressions.push(Regression {
                    domain: accepted.domain.clone(),
                    metric,
                    accepted: accepted_value,
                    measured: Some(measured),
                });
            }
        };
        check(
            Metric::DetectionAccuracy,
            accepted.detection_accuracy,
            snapshot.detection_accuracy,
            snapshot.detection_accuracy >= accepted.detection_accuracy,
        );
        check(
            Metric::FalsePositiveRate,
            accepted.false_positive_rate,
            snapshot.false_positive_rate,
            snapshot.false_positive_rate <= accepted.false_positive_rate,
        );
        let isolation = snapshot.isolation_guarantee();
        check(
            Metric::IsolationGuarantee,
            accepted.isolation_guarantee,
            isolation,
            isolation >= accepted.isolation_guarantee,
        );
    }

    BaselineReport {
        baseline_version: baseline.version,
        regressed: !regressions.is_empty(),
        regressions,
        checked_domains: checked,
    }
}

/// CI-time regression gate
pub struct BaselineTracker {
    store: BaselineStore,
}

impl BaselineTracker {
    pub fn new(store: BaselineStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    /// Compare against the latest accepted baseline. Without one there is
    /// nothing to pass against, which is an error.
    pub fn check(&self, snapshots: &[MetricsSnapshot]) -> Result<BaselineReport> {
        let baseline = self
            .store
            .latest()?
            .ok_or_else(|| Error::Baseline("No accepted security baseline".to_string()))?;
        let report = compare(&baseline, snapshots);
        if report.regressed {
            for regression in &report.regressions {
                tracing::error!(baseline_version = baseline.version, "Security regression: {}", regression);
            }
        } else {
            tracing::info!(
                baseline_version = baseline.version,
                domains = report.checked_domains.len(),
                "Security baseline holds"
            );
        }
        Ok(report)
    }
}
