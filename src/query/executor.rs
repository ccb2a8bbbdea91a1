//! Storage seam for validated queries

use super::spec::{OperationClass, QuerySpec, SqlValue};
use crate::error::Result;
use crate::tenant::TenantId;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A query that passed the guard, ready for a driver
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedQuery {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub class: OperationClass,
    pub text: String,
    pub params: Vec<SqlValue>,
}

impl PreparedQuery {
    pub(crate) fn from_spec(spec: &QuerySpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: spec.tenant_id().clone(),
            class: spec.class(),
            text: spec.text(),
            params: spec.params().to_vec(),
        }
    }
}

/// Result rows of a query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub rows: Vec<serde_json::Value>,
    pub rows_affected: u64,
}

/// Database driver behind the guard.
///
/// `execute` should stop early once `cancel` fires. `cancel` asks the
/// server to terminate a running query by id.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &PreparedQuery, cancel: CancellationToken) -> Result<QueryOutput>;

    async fn cancel(&self, query_id: Uuid) -> Result<()>;
}
