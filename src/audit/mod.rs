//! Audit & compliance logging
//!
//! Every security decision that altered, rejected or denied something is
//! recorded as a [`SecurityIncident`] in the trail of the tenant it belongs
//! to. Trails never mix tenants, on disk or in memory.

pub mod handler;
pub mod incident;
pub mod log;
pub mod persistence;
pub mod retention;

pub use handler::{audit_router, AuditState};
pub use incident::{
    Component, Decision, IncidentFilter, IncidentStats, SecurityIncident, Severity,
};
pub use log::{AuditConfig, AuditLogger};
pub use persistence::TenantAuditFiles;
pub use retention::{RetentionPolicy, RetentionRegime};
