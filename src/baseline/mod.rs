//! Security baseline tracking
//!
//! Runs in CI, outside the request path. Aggregated metrics are compared
//! with the last accepted baseline; any metric outside its band marks the
//! build regressed and blocks promotion.

pub mod metrics;
pub mod store;
pub mod tracker;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use metrics::{
    evaluate_corpus, isolation_counts, load_corpus, load_snapshots, IsolationCounts, LabeledSample,
    MetricsSnapshot, ISOLATION_DOMAIN,
};
pub use store::{BaselineDocument, BaselineStore, SecurityBaseline};
pub use tracker::{compare, BaselineReport, BaselineTracker, Metric, Regression};

/// Baseline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Directory of `baseline-v<N>.toml` documents
    pub dir: PathBuf,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            dir: dirs_next::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("civicguard")
                .join("baselines"),
        }
    }
}
