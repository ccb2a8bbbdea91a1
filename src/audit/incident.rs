//! Security incident model

use crate::patterns::ThreatKind;
use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Incident severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl Severity {
    /// Default severity for a detected threat
    pub fn for_threat(kind: ThreatKind) -> Self {
        match kind {
            ThreatKind::CrossTenantAccess
            | ThreatKind::ResidencyViolation
            | ThreatKind::DataExfiltration => Severity::Critical,
            _ => Severity::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(crate::error::Error::Audit(format!("Unknown severity: {}", other))),
        }
    }
}

/// Component that made the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Sanitizer,
    QueryGuard,
    Isolation,
    Exfiltration,
}

/// What was done about the threat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Content was cleaned and allowed through
    Sanitized,
    /// Content or query was refused
    Rejected,
    /// Access across a boundary was denied
    Denied,
    /// An outbound flow or session was stopped
    Blocked,
}

/// A recorded security decision.
///
/// `detail` is an internal description for security staff; it never
/// contains the raw content that triggered the incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityIncident {
    pub incident_id: String,
    pub tenant_id: TenantId,
    pub threat_kind: ThreatKind,
    pub severity: Severity,
    /// Unix milliseconds
    pub timestamp: i64,
    pub blocked: bool,
    pub component: Component,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub detail: String,
}

impl SecurityIncident {
    pub fn new(
        tenant_id: TenantId,
        threat_kind: ThreatKind,
        component: Component,
        decision: Decision,
    ) -> Self {
        Self {
            incident_id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            threat_kind,
            severity: Severity::for_threat(threat_kind),
            timestamp: chrono::Utc::now().timestamp_millis(),
            blocked: decision != Decision::Sanitized,
            component,
            decision,
            session_id: None,
            detail: String::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Query filter for incidents
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentFilter {
    /// Minimum severity
    pub severity: Option<Severity>,
    pub threat_kind: Option<ThreatKind>,
    /// Only incidents at or after this Unix millisecond timestamp
    pub since: Option<i64>,
    /// Most recent N
    pub limit: Option<usize>,
}

impl IncidentFilter {
    pub fn matches(&self, incident: &SecurityIncident) -> bool {
        self.severity.map_or(true, |s| incident.severity >= s)
            && self.threat_kind.map_or(true, |k| incident.threat_kind == k)
            && self.since.map_or(true, |t| incident.timestamp >= t)
    }

    /// Apply to a chronologically ordered list
    pub fn apply<'a>(&self, incidents: impl Iterator<Item = &'a SecurityIncident>) -> Vec<SecurityIncident> {
        let matched: Vec<SecurityIncident> = incidents.filter(|i| self.matches(i)).cloned().collect();
        match self.limit {
            Some(limit) if matched.len() > limit => matched[matched.len() - limit..].to_vec(),
            _ => matched,
        }
    }
}

/// Per-tenant incident statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentStats {
    pub total: usize,
    pub blocked: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_threat: BTreeMap<String, usize>,
    pub last_incident_at: Option<i64>,
}

impl IncidentStats {
    pub fn from_incidents<'a>(incidents: impl Iterator<Item = &'a SecurityIncident>) -> Self {
        let mut stats = Self::default();
        for incident in incidents {
            stats.total += 1;
            if incident.blocked {
                stats.blocked += 1;
            }
            *stats
                .by_severity
                .entry(incident.severity.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_threat
                .entry(incident.threat_kind.as_str().to_string())
                .or_default() += 1;
            stats.last_incident_at = Some(
                stats
                    .last_incident_at
                    .map_or(incident.timestamp, |t| t.max(incident.timestamp)),
            );
        }
        stats
    }
}
