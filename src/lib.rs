//! CivicGuard - content security and tenant isolation for multi-tenant
//! municipal training platforms
//!
//! CivicGuard sits between the platform's request handlers and its
//! storage and AI components. Untrusted content is sanitized before it is
//! rendered or handed to a model, queries are built from typed specs,
//! every data access is checked against the caller's tenant and outbound
//! data is watched for bulk extraction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SecurityGateway                            │
//! │                                                                   │
//! │  Bearer token ──► TenantIsolationEnforcer ──► RequestScope        │
//! │                                                   │               │
//! │     ┌──────────────────┬──────────────────┬───────┴──────────┐    │
//! │     ▼                  ▼                  ▼                  │    │
//! │  SanitizationEngine  QueryGuard       IsolatedStore          │    │
//! │  (decode, strip,     (taint check,    (per-tenant            │    │
//! │   prompt injection)   ceilings)        partitions)           │    │
//! │     │                  │                  │                  │    │
//! │     └──────────────────┴────────┬─────────┘                  │    │
//! │                                 ▼                            │    │
//! │                       ExfiltrationMonitor ──► response       │    │
//! │                                                              │    │
//! │  every decision ──► AuditLogger (per tenant, JSONL, SSE feed)◄┘    │
//! └──────────────────────────────────────────────────────────────────┘
//!
//!  CI:  corpus / metrics ──► BaselineTracker ──► pass | regressed
//! ```
//!
//! ## Modules
//!
//! - [`patterns`]: Versioned pattern library and content-type policies
//! - [`sanitize`]: Content Sanitization Engine and its HTTP handler
//! - [`query`]: Query Guard with taint-tracked query specs
//! - [`tenant`]: Tenant contexts, sessions, isolation enforcement and the isolated store
//! - [`exfil`]: Exfiltration Monitor
//! - [`audit`]: Per-tenant security incident audit trail
//! - [`baseline`]: Security baseline regression gate
//! - [`gateway`]: Composition of every component
//! - [`api`]: HTTP application
//! - [`config`]: Configuration management

pub mod api;
pub mod audit;
pub mod baseline;
pub mod config;
pub mod error;
pub mod exfil;
pub mod gateway;
pub mod patterns;
pub mod query;
pub mod sanitize;
pub mod tenant;

pub use config::CivicGuardConfig;
pub use error::{Error, Result};
