//! Retention regimes for audit trails
//!
//! Municipal records fall under different regulatory regimes. Each regime
//! carries a default retention window that configuration may override.

use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Regulatory regime governing audit retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionRegime {
    /// GDPR storage limitation, 3 years by default
    #[default]
    Gdpr,
    /// Archives Act (Arkivlagen), 7 years by default
    ArchivesAct,
    /// Explicit number of days only
    Custom,
}

impl RetentionRegime {
    /// Default retention in days, `None` for `Custom`
    pub fn default_days(&self) -> Option<u32> {
        match self {
            Self::Gdpr => Some(3 * 365),
            Self::ArchivesAct => Some(7 * 365),
            Self::Custom => None,
        }
    }
}

impl std::fmt::Display for RetentionRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gdpr => write!(f, "GDPR"),
            Self::ArchivesAct => write!(f, "Archives Act"),
            Self::Custom => write!(f, "Custom"),
        }
    }
}

/// Retention policy
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub regime: RetentionRegime,
    /// Overrides the regime default. Required for `Custom`.
    pub days: Option<u32>,
}

impl RetentionPolicy {
    pub fn new(regime: RetentionRegime) -> Self {
        Self { regime, days: None }
    }

    pub fn with_days(mut self, days: u32) -> Self {
        self.days = Some(days);
        self
    }

    /// Effective retention in days. `None` keeps everything.
    pub fn effective_days(&self) -> Option<u32> {
        self.days.or_else(|| self.regime.default_days())
    }

    /// Oldest timestamp (Unix ms) still retained at `now_ms`
    pub fn cutoff(&self, now_ms: i64) -> Option<i64> {
        self.effective_days()
            .map(|days| now_ms.saturating_sub(i64::from(days) * DAY_MS))
    }

    pub fn retains(&self, timestamp_ms: i64, now_ms: i64) -> bool {
        self.cutoff(now_ms).map_or(true, |cutoff| timestamp_ms >= cutoff)
    }
}
