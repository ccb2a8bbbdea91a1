//! Tenant isolation
//!
//! Each municipality is a tenant with its own partition of data, cache,
//! sessions and configuration.
//!
//! ```text
//!  Bearer token ──► SessionManager ──► TenantRegistry ──► RequestScope
//!                    (HMAC verify)      (context)          (TenantBound)
//!                                                              │
//!            IsolatedStore / QueryGuard / cache ──► TenantIsolationEnforcer
//!                                                   Granted │ Denied ──► audit (critical)
//! ```

pub mod context;
pub mod enforcer;
pub mod registry;
pub mod session;
pub mod store;

pub use context::{IsolationLevel, Region, TenantContext, TenantId};
pub use enforcer::{
    AccessDecision, DenyReason, Namespace, RequestScope, ScopeState, ScopedKey,
    TenantIsolationEnforcer,
};
pub use registry::{StaticTenantRegistry, TenantRecord, TenantRegistry};
pub use session::{bearer_token, IssuedSession, SessionClaims, SessionConfig, SessionManager};
pub use store::IsolatedStore;
