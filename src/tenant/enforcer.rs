//! Tenant isolation enforcement
//!
//! Every request carries a [`RequestScope`] that moves through a small state
//! machine:
//!
//! ```text
//!  Unresolved ──bind──► TenantBound ──evaluate──► Granted ──┐
//!                            │                       ▲      │ evaluate
//!                            │                       └──────┘
//!                            └──────────────────────► Denied (sticky)
//! ```
//!
//! A scope binds exactly one tenant, from a verified session. Any key or
//! query that targets another tenant moves the scope to `Denied` for the
//! rest of the request. There is no bypass for administrative roles.

use super::context::{Region, TenantContext, TenantId};
use super::registry::TenantRegistry;
use super::session::SessionManager;
use crate::audit::{AuditLogger, Component, Decision, SecurityIncident, Severity};
use crate::error::{Error, Result};
use crate::patterns::ThreatKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Key namespace inside a tenant partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Data,
    Cache,
    Session,
    Config,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [Self::Data, Self::Cache, Self::Session, Self::Config];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Cache => "cache",
            Self::Session => "session",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| Error::Tenant(format!("Unknown namespace: {}", s)))
    }
}

/// A storage, cache, session or configuration key that names its tenant.
///
/// Rendered as `tenant:namespace:key`. Tenant ids cannot contain `:`, so the
/// rendering is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopedKey {
    pub tenant_id: TenantId,
    pub namespace: Namespace,
    pub key: String,
}

impl ScopedKey {
    pub fn new(tenant_id: TenantId, namespace: Namespace, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.chars().any(char::is_control) {
            return Err(Error::Tenant("Invalid key".to_string()));
        }
        Ok(Self {
            tenant_id,
            namespace,
            key,
        })
    }
}

impl std::fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.namespace, self.key)
    }
}

impl std::str::FromStr for ScopedKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(tenant), Some(ns), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::Tenant(format!("Malformed scoped key: {:?}", s)));
        };
        Self::new(tenant.parse()?, ns.parse()?, key)
    }
}

/// Request scope state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Unresolved,
    TenantBound,
    Granted,
    Denied,
}

/// Why an access was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// No tenant bound yet
    Unresolved,
    /// Target belongs to another tenant
    CrossTenant,
    /// Tenant's residency region differs from the storage region
    Residency,
    /// The scope was already denied earlier in the request
    PreviouslyDenied,
}

impl DenyReason {
    fn threat(&self) -> ThreatKind {
        match self {
            Self::Residency => ThreatKind::ResidencyViolation,
            _ => ThreatKind::CrossTenantAccess,
        }
    }
}

/// Outcome of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Per-request tenant scope. Created per request, never shared.
#[derive(Debug, Clone)]
pub struct RequestScope {
    state: ScopeState,
    context: Option<TenantContext>,
    session_id: Option<Uuid>,
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScope {
    pub fn new() -> Self {
        Self {
            state: ScopeState::Unresolved,
            context: None,
            session_id: None,
        }
    }

    /// Bind the scope to one tenant. Only valid from `Unresolved`.
    pub fn bind(&mut self, context: TenantContext, session_id: Option<Uuid>) -> Result<()> {
        if self.state != ScopeState::Unresolved {
            return Err(Error::Tenant("Request scope is already bound".to_string()));
        }
        self.context = Some(context);
        self.session_id = session_id;
        self.state = ScopeState::TenantBound;
        Ok(())
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn context(&self) -> Option<&TenantContext> {
        self.context.as_ref()
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.context.as_ref().map(|c| &c.tenant_id)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// The bound context, or an error while unresolved
    pub fn require_context(&self) -> Result<&TenantContext> {
        self.context
            .as_ref()
            .ok_or_else(|| Error::Unauthenticated("no tenant bound to request".to_string()))
    }

    /// Decide an access without changing state.
    pub fn evaluate(&self, target: &TenantId, storage_region: &Region) -> AccessDecision {
        let Some(context) = &self.context else {
            return AccessDecision::Denied(DenyReason::Unresolved);
        };
        if self.state == ScopeState::Denied {
            return AccessDecision::Denied(DenyReason::PreviouslyDenied);
        }
        if &context.tenant_id != target {
            return AccessDecision::Denied(DenyReason::CrossTenant);
        }
        if &context.data_residency_region != storage_region {
            return AccessDecision::Denied(DenyReason::Residency);
        }
        AccessDecision::Granted
    }

    fn apply(&mut self, decision: AccessDecision) {
        self.state = match (self.state, decision) {
            (ScopeState::Denied, _) => ScopeState::Denied,
            (_, AccessDecision::Denied(_)) => ScopeState::Denied,
            (ScopeState::Unresolved, AccessDecision::Granted) => ScopeState::Unresolved,
            (_, AccessDecision::Granted) => ScopeState::Granted,
        };
    }

    /// A key in the bound tenant's partition
    pub fn key(&self, namespace: Namespace, key: impl Into<String>) -> Result<ScopedKey> {
        ScopedKey::new(self.require_context()?.tenant_id.clone(), namespace, key)
    }
}

/// Mandatory tenant check in front of every data, cache, session and
/// configuration access.
pub struct TenantIsolationEnforcer {
    registry: Arc<dyn TenantRegistry>,
    sessions: Arc<SessionManager>,
    audit: Arc<AuditLogger>,
    storage_region: Region,
}

impl TenantIsolationEnforcer {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        sessions: Arc<SessionManager>,
        audit: Arc<AuditLogger>,
        storage_region: Region,
    ) -> Self {
        Self {
            registry,
            sessions,
            audit,
            storage_region,
        }
    }

    pub fn registry(&self) -> &Arc<dyn TenantRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn storage_region(&self) -> &Region {
        &self.storage_region
    }

    /// Authenticate a session token and bind a fresh scope to its tenant.
    pub fn resolve(&self, token: &str) -> Result<RequestScope> {
        let claims = self.sessions.verify(token)?;
        let context = self.registry.resolve(&claims.tenant_id).ok_or_else(|| {
            tracing::warn!(tenant_id = %claims.tenant_id, "Session names an unknown tenant");
            Error::Unauthenticated("unknown tenant".to_string())
        })?;
        let mut scope = RequestScope::new();
        scope.bind(context, Some(claims.session_id))?;
        tracing::debug!(
            tenant_id = %claims.tenant_id,
            session_id = %claims.session_id,
            "Request scope bound"
        );
        Ok(scope)
    }

    /// Check that `scope` may touch data of `target`.
    ///
    /// Denials are recorded as critical incidents in the requesting tenant's
    /// trail before returning. If that write fails the audit error is
    /// returned instead.
    pub async fn enforce(
        &self,
        scope: &mut RequestScope,
        target: &TenantId,
        resource: &str,
    ) -> Result<()> {
        let decision = scope.evaluate(target, &self.storage_region);
        scope.apply(decision);

        let reason = match decision {
            AccessDecision::Granted => return Ok(()),
            AccessDecision::Denied(reason) => reason,
        };
        let requester = scope
            .tenant_id()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unresolved".to_string());

        if reason == DenyReason::PreviouslyDenied {
            tracing::debug!(tenant_id = %requester, resource, "Access refused on denied scope");
        } else {
            // Unresolved scopes have no trail of their own
            let trail = scope.tenant_id().cloned().unwrap_or_else(|| target.clone());
            let mut incident = SecurityIncident::new(
                trail,
                reason.threat(),
                Component::Isolation,
                Decision::Denied,
            )
            .with_severity(Severity::Critical)
            .with_detail(format!("{:?} access denied on {}", reason, resource));
            if let Some(session_id) = scope.session_id() {
                incident = incident.with_session(session_id.to_string());
            }
            self.audit.record(incident).await?;
            tracing::warn!(
                tenant_id = %requester,
                target = %target,
                reason = ?reason,
                resource,
                "Tenant isolation violation denied"
            );
        }

        Err(Error::IsolationViolation {
            requester,
            target: target.to_string(),
        })
    }

    /// Check a scoped key against the request scope.
    pub async fn authorize_key(&self, scope: &mut RequestScope, key: &ScopedKey) -> Result<()> {
        self.enforce(scope, &key.tenant_id, key.namespace.as_str())
            .await
    }
}
