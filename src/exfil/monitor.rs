//! Exfiltration monitor
//!
//! Watches the response path of data-bearing operations for three
//! anomalies: bulk volume, sequential identifier enumeration and data sent
//! to a destination outside the allowlist. A detection blocks the response,
//! records a critical incident and puts the session in cooldown.

use super::window::{CounterKey, CounterStore, Observation, WindowCounterStore, WindowSnapshot};
use crate::audit::{AuditLogger, Component, Decision, SecurityIncident, Severity};
use crate::error::{Error, Result};
use crate::patterns::ThreatKind;
use crate::tenant::{IsolationLevel, TenantContext, TenantId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exfiltration monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExfiltrationConfig {
    pub enabled: bool,
    /// Sliding window length in seconds
    pub window_secs: u64,
    /// Typical records per response for resources without an entry below
    pub default_typical_records: u64,
    /// Typical records per response, by resource
    pub typical_records: HashMap<String, u64>,
    /// How far above typical a single response may go
    pub bulk_factor: f64,
    /// Sequential identifiers in a row that count as enumeration
    pub enumeration_run: usize,
    /// Allowed outbound destination hosts; `*.example.se` matches subdomains
    pub allowed_domains: Vec<String>,
    /// Seconds a session stays blocked after a detection
    pub cooldown_secs: u64,
}

impl Default for ExfiltrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            default_typical_records: 50,
            typical_records: HashMap::new(),
            bulk_factor: 10.0,
            enumeration_run: 20,
            allowed_domains: Vec::new(),
            cooldown_secs: 300,
        }
    }
}

/// Where outbound data is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundChannel {
    ApiResponse,
    StorageRead,
    CacheRead,
}

/// A data-bearing response about to leave the system
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub channel: OutboundChannel,
    pub resource: String,
    pub record_count: u64,
    /// Tenant-scoped record identifiers, in response order
    pub identifiers: Vec<u64>,
    /// Navigation target paired with the data, if any
    pub destination: Option<String>,
}

impl OutboundResponse {
    pub fn new(channel: OutboundChannel, resource: impl Into<String>, record_count: u64) -> Self {
        Self {
            channel,
            resource: resource.into(),
            record_count,
            identifiers: Vec::new(),
            destination: None,
        }
    }

    pub fn with_identifiers(mut self, identifiers: Vec<u64>) -> Self {
        self.identifiers = identifiers;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Detected anomaly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    Volume { records: u64, threshold: u64 },
    Enumeration { run: usize },
    Destination { host: String },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Volume { records, threshold } => {
                write!(f, "volume {} over threshold {}", records, threshold)
            }
            Self::Enumeration { run } => write!(f, "sequential enumeration of {} identifiers", run),
            Self::Destination { host } => write!(f, "destination {} not allowlisted", host),
        }
    }
}

/// Monitor verdict for one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExfilDecision {
    Allow,
    Block(Anomaly),
    /// Session is cooling down from an earlier detection
    Cooldown,
}

impl ExfilDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Observes outbound responses per tenant and session
pub struct ExfiltrationMonitor {
    config: ExfiltrationConfig,
    counters: Arc<dyn CounterStore>,
    cooldowns: DashMap<(TenantId, String), Instant>,
    audit: Arc<AuditLogger>,
}

impl ExfiltrationMonitor {
    pub fn new(config: ExfiltrationConfig, audit: Arc<AuditLogger>) -> Result<Self> {
        Self::with_store(config, Arc::new(WindowCounterStore::new()), audit)
    }

    pub fn with_store(
        config: ExfiltrationConfig,
        counters: Arc<dyn CounterStore>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self> {
        if !(config.bulk_factor.is_finite() && config.bulk_factor >= 1.0) {
            return Err(Error::Config(
                "exfiltration.bulk_factor must be at least 1.0".to_string(),
            ));
        }
        if config.enumeration_run < 2 {
            return Err(Error::Config(
                "exfiltration.enumeration_run must be at least 2".to_string(),
            ));
        }
        Ok(Self {
            config,
            counters,
            cooldowns: DashMap::new(),
            audit,
        })
    }

    pub fn config(&self) -> &ExfiltrationConfig {
        &self.config
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Fail if the session is cooling down.
    pub fn check_session(&self, tenant_id: &TenantId, session_id: &str) -> Result<()> {
        if self.in_cooldown(tenant_id, session_id, Instant::now()) {
            return Err(Error::SessionBlocked(format!(
                "session {} is in exfiltration cooldown",
                session_id
            )));
        }
        Ok(())
    }

    fn in_cooldown(&self, tenant_id: &TenantId, session_id: &str, now: Instant) -> bool {
        let key = (tenant_id.clone(), session_id.to_string());
        let Some(until) = self.cooldowns.get(&key).map(|u| *u) else {
            return false;
        };
        if now < until {
            return true;
        }
        self.cooldowns.remove(&key);
        false
    }

    /// Drop idle counter windows and expired cooldowns. Returns the number
    /// of windows and cooldowns removed.
    pub fn sweep(&self, now: Instant) -> (usize, usize) {
        let windows = self.counters.prune(now, self.window());
        let before = self.cooldowns.len();
        self.cooldowns.retain(|_, until| *until > now);
        let cooldowns = before.saturating_sub(self.cooldowns.len());
        if windows > 0 || cooldowns > 0 {
            tracing::debug!(windows, cooldowns, "Swept exfiltration state");
        }
        (windows, cooldowns)
    }

    /// Sessions currently cooling down
    pub fn cooldown_count(&self) -> usize {
        self.cooldowns.len()
    }

    /// Observe a response. A `Block` has already been recorded as a critical
    /// incident when this returns.
    pub async fn observe(
        &self,
        context: &TenantContext,
        session_id: &str,
        response: &OutboundResponse,
    ) -> Result<ExfilDecision> {
        self.observe_at(context, session_id, response, Instant::now())
            .await
    }

    pub async fn observe_at(
        &self,
        context: &TenantContext,
        session_id: &str,
        response: &OutboundResponse,
        now: Instant,
    ) -> Result<ExfilDecision> {
        if !self.config.enabled {
            return Ok(ExfilDecision::Allow);
        }
        let tenant_id = &context.tenant_id;
        if self.in_cooldown(tenant_id, session_id, now) {
            tracing::warn!(tenant_id = %tenant_id, session_id, "Response refused during cooldown");
            return Ok(ExfilDecision::Cooldown);
        }

        let key = CounterKey::new(tenant_id.clone(), session_id, response.resource.clone());
        let snapshot = self.counters.observe(
            &key,
            &Observation {
                at: now,
                records: response.record_count,
                identifiers: response.identifiers.clone(),
            },
            self.window(),
        );

        let Some(anomaly) = self.detect(context, response, &snapshot) else {
            tracing::debug!(
                tenant_id = %tenant_id,
                resource = %response.resource,
                window_records = snapshot.total_records,
                "Outbound response allowed"
            );
            return Ok(ExfilDecision::Allow);
        };

        let incident = SecurityIncident::new(
            tenant_id.clone(),
            ThreatKind::DataExfiltration,
            Component::Exfiltration,
            Decision::Blocked,
        )
        .with_severity(Severity::Critical)
        .with_session(session_id)
        .with_detail(format!("{:?} read of {}: {}", response.channel, response.resource, anomaly));
        self.audit.record(incident).await?;

        self.cooldowns.insert(
            (tenant_id.clone(), session_id.to_string()),
            now + Duration::from_secs(self.config.cooldown_secs),
        );
        self.counters.clear_session(tenant_id, session_id);
        tracing::warn!(
            tenant_id = %tenant_id,
            session_id,
            resource = %response.resource,
            anomaly = %anomaly,
            "Exfiltration blocked"
        );
        Ok(ExfilDecision::Block(anomaly))
    }

    fn detect(
        &self,
        context: &TenantContext,
        response: &OutboundResponse,
        snapshot: &WindowSnapshot,
    ) -> Option<Anomaly> {
        if response.record_count > 0 {
            if let Some(host) = response.destination.as_deref().map(destination_host) {
                if !self.is_allowed_host(&host) {
                    return Some(Anomaly::Destination { host });
                }
            }
        }

        let strict = context.isolation_level == IsolationLevel::Strict;
        let factor = if strict {
            (self.config.bulk_factor / 2.0).max(1.0)
        } else {
            self.config.bulk_factor
        };
        let typical = self
            .config
            .typical_records
            .get(&response.resource)
            .copied()
            .unwrap_or(self.config.default_typical_records)
            .max(1);
        let single = (typical as f64 * factor).ceil() as u64;
        if response.record_count > single {
            return Some(Anomaly::Volume {
                records: response.record_count,
                threshold: single,
            });
        }
        let windowed = single.saturating_mul(4);
        if snapshot.total_records > windowed {
            return Some(Anomaly::Volume {
                records: snapshot.total_records,
                threshold: windowed,
            });
        }

        let run_limit = if strict {
            (self.config.enumeration_run / 2).max(2)
        } else {
            self.config.enumeration_run
        };
        if snapshot.sequential_run >= run_limit {
            return Some(Anomaly::Enumeration {
                run: snapshot.sequential_run,
            });
        }
        None
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        self.config.allowed_domains.iter().any(|pattern| {
            let pattern = pattern.trim().to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
                None => host == pattern,
            }
        })
    }
}

/// Host part of a URL or bare host, lowercased
fn destination_host(destination: &str) -> String {
    let rest = destination
        .split_once("://")
        .map_or(destination, |(_, rest)| rest);
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = if host.starts_with('[') {
        host.split_once(']').map_or(host, |(h, _)| h).trim_start_matches('[')
    } else {
        host.split(':').next().unwrap_or(host)
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}
