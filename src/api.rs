//! Unified API router for CivicGuard
//!
//! Merges the module routers into a single axum `Router` with CORS and
//! request tracing.
//!
//! ## Endpoint Map
//!
//! | Path                          | Module   | Description                      |
//! |-------------------------------|----------|----------------------------------|
//! | `/health`                     | api      | Load balancer health probe       |
//! | `/security/sanitize`          | sanitize | Sanitize untrusted content       |
//! | `/security/audit/incidents`   | audit    | Caller tenant's incidents        |
//! | `/security/audit/stats`       | audit    | Caller tenant's incident summary |
//! | `/security/incidents/feed`    | audit    | Live incidents (SSE)             |

use crate::audit::{audit_router, AuditState};
use crate::gateway::SecurityGateway;
use crate::sanitize::{sanitize_router, SanitizeState};
use axum::{
    extract::State,
    http::{header, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the complete CivicGuard HTTP application
///
/// Returns a single `Router` ready to be served by `axum::serve`.
pub fn build_app(gateway: Arc<SecurityGateway>, cors_origins: &[String]) -> Router {
    let cors = build_cors(cors_origins);

    Router::new()
        .route("/health", get(health_check).with_state(gateway.clone()))
        .merge(sanitize_router(SanitizeState {
            gateway: gateway.clone(),
        }))
        .merge(audit_router(AuditState { gateway }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// =============================================================================
// Root handlers
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    pattern_library: String,
}

async fn health_check(State(gateway): State<Arc<SecurityGateway>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pattern_library: gateway.library().version().to_string(),
    })
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(parsed)
    }
}
