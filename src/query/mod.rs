//! Query Guard
//!
//! Data-access requests reach storage only as [`QuerySpec`]s: literal text
//! and bound parameters kept apart, owned by one tenant, validated before
//! execution and run under a per-class time ceiling.

pub mod executor;
pub mod guard;
pub mod spec;

pub use executor::{PreparedQuery, QueryExecutor, QueryOutput};
pub use guard::{QueryDecision, QueryGuard, QueryGuardConfig};
pub use spec::{OperationClass, Origin, QuerySpec, SqlValue};
