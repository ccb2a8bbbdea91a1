//! HTTP handlers for the Audit API
//!
//! Every route is scoped to the tenant of the caller's session. Sessions are
//! resolved through the gateway, so a session in exfiltration cooldown is
//! refused here as everywhere else:
//! - GET /security/audit/incidents   — list incidents (filterable)
//! - GET /security/audit/stats       — summary statistics
//! - GET /security/incidents/feed    — live incidents as server-sent events

use super::incident::{IncidentFilter, IncidentStats, SecurityIncident};
use crate::error::{Error, Result};
use crate::gateway::SecurityGateway;
use crate::tenant::{bearer_token, TenantId};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Shared state for audit handlers
#[derive(Clone)]
pub struct AuditState {
    pub gateway: Arc<SecurityGateway>,
}

/// Create the audit router
pub fn audit_router(state: AuditState) -> Router {
    Router::new()
        .route("/security/audit/incidents", get(list_incidents))
        .route("/security/audit/stats", get(get_stats))
        .route("/security/incidents/feed", get(incident_feed))
        .with_state(state)
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IncidentListResponse {
    tenant_id: TenantId,
    incidents: Vec<SecurityIncident>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    tenant_id: TenantId,
    #[serde(flatten)]
    stats: IncidentStats,
}

/// Default and maximum page size
const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

fn caller_tenant(state: &AuditState, headers: &HeaderMap) -> Result<TenantId> {
    let token = bearer_token(headers)
        .ok_or_else(|| Error::Unauthenticated("missing bearer token".to_string()))?;
    let scope = state.gateway.authenticate(token)?;
    Ok(scope.require_context()?.tenant_id.clone())
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /security/audit/incidents
async fn list_incidents(
    State(state): State<AuditState>,
    headers: HeaderMap,
    Query(mut filter): Query<IncidentFilter>,
) -> Result<Json<IncidentListResponse>> {
    let tenant_id = caller_tenant(&state, &headers)?;
    filter.limit = Some(filter.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT));
    let incidents = state.gateway.audit().incidents(&tenant_id, &filter);
    Ok(Json(IncidentListResponse {
        tenant_id,
        incidents,
    }))
}

/// GET /security/audit/stats
async fn get_stats(
    State(state): State<AuditState>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>> {
    let tenant_id = caller_tenant(&state, &headers)?;
    let stats = state.gateway.audit().stats(&tenant_id);
    Ok(Json(StatsResponse { tenant_id, stats }))
}

/// GET /security/incidents/feed
async fn incident_feed(
    State(state): State<AuditState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let tenant_id = caller_tenant(&state, &headers)?;
    tracing::debug!(tenant_id = %tenant_id, "Incident feed subscribed");

    let stream = BroadcastStream::new(state.gateway.audit().subscribe()).filter_map(move |item| {
        let incident = own_incident(&tenant_id, item)?;
        Event::default()
            .event("incident")
            .json_data(&incident)
            .ok()
            .map(Ok)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Keep only the caller's incidents; lagged receivers skip what they missed.
fn own_incident(
    tenant_id: &TenantId,
    item: std::result::Result<SecurityIncident, BroadcastStreamRecvError>,
) -> Option<SecurityIncident> {
    match item {
        Ok(incident) if &incident.tenant_id == tenant_id => Some(incident),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(tenant_id = %tenant_id, skipped, "Incident feed lagged");
            None
        }
    }
}
