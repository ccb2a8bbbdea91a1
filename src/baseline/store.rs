//! Versioned baseline documents
//!
//! Each accepted baseline is a TOML file `baseline-v<N>.toml`. Accepting a
//! new baseline writes `N+1`; earlier versions stay on disk for audit and
//! are never rewritten.
//!
//! ```toml
//! version = 3
//! accepted_at = "2024-11-02T09:30:00Z"
//!
//! [[baseline]]
//! domain = "sanitization"
//! detection_accuracy = 0.998
//! false_positive_rate = 0.02
//! isolation_guarantee = 1.0
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Accepted thresholds for one security domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityBaseline {
    pub domain: String,
    /// Minimum detection accuracy
    pub detection_accuracy: f64,
    /// Maximum false-positive rate
    pub false_positive_rate: f64,
    /// Minimum isolation guarantee
    pub isolation_guarantee: f64,
}

/// A versioned set of baselines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(rename = "baseline", default)]
    pub baselines: Vec<SecurityBaseline>,
}

impl BaselineDocument {
    pub fn parse(text: &str) -> Result<Self> {
        let doc: Self = toml::from_str(text)
            .map_err(|e| Error::Baseline(format!("Invalid baseline document: {}", e)))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> Result<()> {
        if self.baselines.is_empty() {
            return Err(Error::Baseline("Baseline document has no domains".to_string()));
        }
        let mut seen = HashSet::new();
        for b in &self.baselines {
            if b.domain.trim().is_empty() {
                return Err(Error::Baseline("Baseline domain must not be empty".to_string()));
            }
            if !seen.insert(b.domain.as_str()) {
                return Err(Error::Baseline(format!("Duplicate baseline domain: {}", b.domain)));
            }
            for (name, value) in [
                ("detection_accuracy", b.detection_accuracy),
                ("false_positive_rate", b.false_positive_rate),
                ("isolation_guarantee", b.isolation_guarantee),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(Error::Baseline(format!(
                        "{}.{} must be within [0, 1], got {}",
                        b.domain, name, value
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, domain: &str) -> Option<&SecurityBaseline> {
        self.baselines.iter().find(|b| b.domain == domain)
    }
}

/// Directory of versioned baseline documents
#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, version: u32) -> PathBuf {
        self.dir.join(format!("baseline-v{}.toml", version))
    }

    /// Stored versions, ascending
    pub fn versions(&self) -> Result<Vec<u32>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_prefix("baseline-v")?
                    .strip_suffix(".toml")?
                    .parse()
                    .ok()
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn load(&self, version: u32) -> Result<BaselineDocument> {
        let path = self.path_for(version);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Baseline(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let doc = BaselineDocument::parse(&text)?;
        if doc.version != version {
            return Err(Error::Baseline(format!(
                "{} declares version {}",
                path.display(),
                doc.version
            )));
        }
        Ok(doc)
    }

    /// The most recently accepted baseline
    pub fn latest(&self) -> Result<Option<BaselineDocument>> {
        match self.versions()?.last() {
            Some(&version) => self.load(version).map(Some),
            None => Ok(None),
        }
    }

    /// Store a new version superseding the latest one.
    pub fn accept(&self, mut doc: BaselineDocument) -> Result<BaselineDocument> {
        doc.validate()?;
        std::fs::create_dir_all(&self.dir)?;
        let next = self.versions()?.last().map_or(1, |v| v + 1);
        doc.version = next;
        doc.accepted_at = Some(Utc::now());

        let text = toml::to_string_pretty(&doc)
            .map_err(|e| Error::Baseline(format!("Failed to encode baseline: {}", e)))?;
        let path = self.path_for(next);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::Baseline(format!("Failed to create {}: {}", path.display(), e)))?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;

        tracing::info!(version = next, domains = doc.baselines.len(), "Security baseline accepted");
        Ok(doc)
    }
}
