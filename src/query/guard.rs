//! Query Guard
//!
//! Structural validation of [`QuerySpec`]s and bounded execution. Injection
//! is refused because untrusted text in the literal part of a query is
//! refused, whatever it looks like. SQL signatures only label the incident.

use super::executor::{PreparedQuery, QueryExecutor, QueryOutput};
use super::spec::{Fragment, OperationClass, QuerySpec};
use crate::audit::{AuditLogger, Component, Decision, SecurityIncident};
use crate::error::{Error, Result};
use crate::patterns::{PatternLibrary, ThreatKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Query Guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryGuardConfig {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub report_timeout_ms: u64,
    /// Maximum bound parameters per query
    pub max_params: usize,
}

impl Default for QueryGuardConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1000,
            write_timeout_ms: 2000,
            report_timeout_ms: 2000,
            max_params: 256,
        }
    }
}

impl QueryGuardConfig {
    /// Execution ceiling for an operation class in milliseconds
    pub fn ceiling_ms(&self, class: OperationClass) -> u64 {
        match class {
            OperationClass::Read => self.read_timeout_ms,
            OperationClass::Write => self.write_timeout_ms,
            OperationClass::Report => self.report_timeout_ms,
        }
    }
}

/// Validation outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat: Option<ThreatKind>,
}

impl QueryDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            threat: None,
        }
    }

    fn deny(reason: &str, threat: Option<ThreatKind>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            threat,
        }
    }
}

const MAX_IDENT_LEN: usize = 63;

fn is_identifier(name: &str) -> bool {
    let part_ok = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && part.len() <= MAX_IDENT_LEN
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let mut parts = name.split('.');
    let first = parts.next().is_some_and(part_ok);
    let rest: Vec<&str> = parts.collect();
    first && rest.len() <= 1 && rest.iter().all(|p| part_ok(p))
}

/// `?` characters outside single-quoted string literals
fn literal_placeholders(text: &str) -> usize {
    let mut in_string = false;
    let mut count = 0;
    for c in text.chars() {
        match c {
            '\'' => in_string = !in_string,
            '?' if !in_string => count += 1,
            _ => {}
        }
    }
    count
}

/// Validates and executes query specs
pub struct QueryGuard {
    library: Arc<PatternLibrary>,
    config: QueryGuardConfig,
    audit: Arc<AuditLogger>,
}

impl QueryGuard {
    pub fn new(library: Arc<PatternLibrary>, config: QueryGuardConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            library,
            config,
            audit,
        }
    }

    pub fn config(&self) -> &QueryGuardConfig {
        &self.config
    }

    /// Validate a spec. Pure; records nothing.
    pub fn validate(&self, spec: &QuerySpec) -> QueryDecision {
        let tainted: Vec<&str> = spec.untrusted_literals().collect();
        if !tainted.is_empty() {
            let threat = self
                .library
                .classify_sql(&tainted.join(" "))
                .unwrap_or(ThreatKind::UnparameterizedQuery);
            return QueryDecision::deny("tainted-literal", Some(threat));
        }

        if spec.text().trim().is_empty() {
            return QueryDecision::deny("empty-query", None);
        }

        let mut bound = 0;
        let mut literal = 0;
        for fragment in spec.fragments() {
            match fragment {
                Fragment::Static(text) => literal += literal_placeholders(text),
                Fragment::Dynamic { text, .. } => literal += literal_placeholders(text),
                Fragment::Ident(name) => {
                    if !is_identifier(name) {
                        return QueryDecision::deny(
                            "invalid-identifier",
                            Some(ThreatKind::UnparameterizedQuery),
                        );
                    }
                }
                Fragment::Placeholder => bound += 1,
            }
        }
        if literal > 0 || bound != spec.params().len() {
            return QueryDecision::deny("arity-mismatch", None);
        }
        if spec.params().len() > self.config.max_params {
            return QueryDecision::deny("too-many-params", None);
        }
        QueryDecision::allow()
    }

    /// Validate and record a rejection in the spec tenant's trail.
    pub async fn check(&self, spec: &QuerySpec, session_id: Option<&str>) -> Result<()> {
        let decision = self.validate(spec);
        if decision.allowed {
            tracing::debug!(tenant_id = %spec.tenant_id(), class = spec.class().as_str(), "Query allowed");
            return Ok(());
        }
        let reason = decision.reason.unwrap_or_else(|| "invalid-query".to_string());
        let threat = decision.threat.unwrap_or(ThreatKind::UnparameterizedQuery);
        let mut incident = SecurityIncident::new(
            spec.tenant_id().clone(),
            threat,
            Component::QueryGuard,
            Decision::Rejected,
        )
        .with_detail(format!("{} query rejected: {}", spec.class().as_str(), reason));
        if let Some(session_id) = session_id {
            incident = incident.with_session(session_id);
        }
        self.audit.record(incident).await?;
        tracing::warn!(tenant_id = %spec.tenant_id(), threat = %threat, reason = %reason, "Query rejected");
        Err(Error::QueryRejected(reason))
    }

    /// Validate, then run under the class ceiling. A query that outlives
    /// its ceiling is cancelled on the server and reported as a possible
    /// time-based injection.
    pub async fn execute(
        &self,
        executor: &dyn QueryExecutor,
        spec: &QuerySpec,
        session_id: Option<&str>,
    ) -> Result<QueryOutput> {
        self.check(spec, session_id).await?;

        let prepared = PreparedQuery::from_spec(spec);
        let ceiling_ms = self.config.ceiling_ms(spec.class());
        let token = CancellationToken::new();

        let run = executor.execute(&prepared, token.child_token());
        match tokio::time::timeout(Duration::from_millis(ceiling_ms), run).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                if let Err(e) = executor.cancel(prepared.id).await {
                    tracing::error!(query_id = %prepared.id, error = %e, "Server-side cancel failed");
                }
                let mut incident = SecurityIncident::new(
                    spec.tenant_id().clone(),
                    ThreatKind::SqlTimeBased,
                    Component::QueryGuard,
                    Decision::Blocked,
                )
                .with_detail(format!(
                    "{} query {} cancelled after {} ms",
                    spec.class().as_str(),
                    prepared.id,
                    ceiling_ms
                ));
                if let Some(session_id) = session_id {
                    incident = incident.with_session(session_id);
                }
                self.audit.record(incident).await?;
                tracing::warn!(
                    tenant_id = %spec.tenant_id(),
                    query_id = %prepared.id,
                    ceiling_ms,
                    "Query exceeded execution ceiling"
                );
                Err(Error::QueryTimeout(ceiling_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, IncidentFilter};
    use crate::query::spec::{Origin, SqlValue};
    use crate::tenant::TenantId;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn malmo() -> TenantId {
        TenantId::new("malmo").unwrap()
    }

    async fn guard(dir: &std::path::Path, config: QueryGuardConfig) -> QueryGuard {
        let audit = AuditLogger::open(&AuditConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        QueryGuard::new(Arc::new(PatternLibrary::builtin().unwrap()), config, audit)
    }

    /// Sleeps for `delay` unless cancelled
    struct SlowExecutor {
        delay: Duration,
        cancelled: Mutex<Vec<Uuid>>,
        seen: Mutex<Vec<PreparedQuery>>,
    }

    impl SlowExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                cancelled: Mutex::new(Vec::new()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueryExecutor for SlowExecutor {
        async fn execute(&self, query: &PreparedQuery, cancel: CancellationToken) -> Result<QueryOutput> {
            self.seen.lock().unwrap().push(query.clone());
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(QueryOutput {
                    rows: vec![serde_json::json!({"name": "Anna"})],
                    rows_affected: 0,
                }),
                _ = cancel.cancelled() => Err(Error::Internal("cancelled".to_string())),
            }
        }

        async fn cancel(&self, query_id: Uuid) -> Result<()> {
            self.cancelled.lock().unwrap().push(query_id);
            Ok(())
        }
    }

    // ---- Validation ----

    #[tokio::test]
    async fn test_parameterized_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(dir.path(), QueryGuardConfig::default()).await;
        let spec = QuerySpec::read(malmo())
            .sql("SELECT name FROM ")
            .ident("pupils")
            .sql(" WHERE id = ")
            .bind("x' OR '1'='1");
        assert_eq!(guard.validate(&spec), QueryDecision::allow());
    }

    #[tokio::test]
    async fn test_tainted_literal_labelled() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(dir.path(), QueryGuardConfig::default()).await;
        let cases = [
            ("x' OR '1'='1", ThreatKind::SqlBlind),
            ("1 UNION SELECT password FROM users", ThreatKind::SqlUnion),
            ("1; WAITFOR DELAY '0:0:5'", ThreatKind::SqlTimeBased),
            ("1; DROP TABLE pupils", ThreatKind::SqlStacked),
            ("Anna", ThreatKind::UnparameterizedQuery),
        ];
        for (payload, expected) in cases {
            let spec = QuerySpec::read(malmo())
                .sql("SELECT * FROM pupils WHERE name = '")
                .push_dynamic(payload, Origin::Untrusted)
                .sql("'");
            let decision = guard.validate(&spec);
            assert!(!decision.allowed, "{}", payload);
            assert_eq!(decision.reason.as_deref(), Some("tainted-literal"));
            assert_eq!(decision.threat, Some(expected), "{}", payload);
        }
    }

    #[tokio::test]
    async fn test_structural_checks() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(
            dir.path(),
            QueryGuardConfig {
                max_params: 2,
                ..Default::default()
            },
        )
        .await;

        let empty = QuerySpec::read(malmo()).sql("   ");
        assert_eq!(guard.validate(&empty).reason.as_deref(), Some("empty-query"));

        let arity = QuerySpec::read(malmo()).sql("SELECT * FROM t WHERE a = ?");
        assert_eq!(guard.validate(&arity).reason.as_deref(), Some("arity-mismatch"));

        let quoted = QuerySpec::read(malmo()).sql("SELECT 'why?' FROM t");
        assert!(guard.validate(&quoted).allowed);

        let bad_ident = QuerySpec::read(malmo()).sql("SELECT * FROM ").ident("t; DROP");
        assert_eq!(
            guard.validate(&bad_ident).reason.as_deref(),
            Some("invalid-identifier")
        );
        let dotted = QuerySpec::read(malmo()).sql("SELECT * FROM ").ident("school.pupils");
        assert!(guard.validate(&dotted).allowed);

        let many = QuerySpec::write(malmo())
            .sql("INSERT INTO t VALUES (")
            .bind(1)
            .sql(", ")
            .bind(2)
            .sql(", ")
            .bind(3)
            .sql(")");
        assert_eq!(guard.validate(&many).reason.as_deref(), Some("too-many-params"));
    }

    #[tokio::test]
    async fn test_trusted_dynamic_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(dir.path(), QueryGuardConfig::default()).await;
        let spec = QuerySpec::read(malmo())
            .sql("SELECT * FROM pupils ")
            .push_dynamic("ORDER BY name", Origin::Trusted);
        assert!(guard.validate(&spec).allowed);
    }

    #[tokio::test]
    async fn test_check_records_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(dir.path(), QueryGuardConfig::default()).await;
        let spec = QuerySpec::read(malmo())
            .sql("SELECT * FROM t WHERE a = ")
            .push_dynamic("1 OR 1=1", Origin::Untrusted);
        let result = guard.check(&spec, Some("s1")).await;
        assert!(matches!(result, Err(Error::QueryRejected(r)) if r == "tainted-literal"));
        let incidents = guard.audit.incidents(&malmo(), &IncidentFilter::default());
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].threat_kind, ThreatKind::SqlBlind);
        assert_eq!(incidents[0].decision, Decision::Rejected);
        assert!(!incidents[0].detail.contains("1=1"));
    }

    // ---- Execution ----

    #[tokio::test]
    async fn test_execute_within_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(dir.path(), QueryGuardConfig::default()).await;
        let executor = SlowExecutor::new(Duration::from_millis(1));
        let spec = QuerySpec::read(malmo())
            .sql("SELECT name FROM pupils WHERE id = ")
            .bind(7);
        let output = guard.execute(&executor, &spec, None).await.unwrap();
        assert_eq!(output.rows.len(), 1);

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].text, "SELECT name FROM pupils WHERE id = ?");
        assert_eq!(seen[0].params, vec![SqlValue::Int(7)]);
        assert_eq!(seen[0].tenant_id, malmo());
    }

    #[tokio::test]
    async fn test_timeout_cancels_server_side() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(
            dir.path(),
            QueryGuardConfig {
                read_timeout_ms: 20,
                ..Default::default()
            },
        )
        .await;
        let executor = SlowExecutor::new(Duration::from_secs(30));
        let spec = QuerySpec::read(malmo()).sql("SELECT 1");

        let result = guard.execute(&executor, &spec, Some("s1")).await;
        assert!(matches!(result, Err(Error::QueryTimeout(20))));

        let seen_id = executor.seen.lock().unwrap()[0].id;
        assert_eq!(*executor.cancelled.lock().unwrap(), vec![seen_id]);

        let incidents = guard.audit.incidents(&malmo(), &IncidentFilter::default());
        assert_eq!(incidents[0].threat_kind, ThreatKind::SqlTimeBased);
        assert!(incidents[0].blocked);
    }

    #[tokio::test]
    async fn test_rejected_spec_never_reaches_executor() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard(dir.path(), QueryGuardConfig::default()).await;
        let executor = SlowExecutor::new(Duration::from_millis(1));
        let spec = QuerySpec::read(malmo())
            .sql("SELECT * FROM t WHERE a = ")
            .push_dynamic("1 UNION SELECT 1", Origin::Untrusted);
        assert!(guard.execute(&executor, &spec, None).await.is_err());
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    // ---- Properties ----

    fn payload() -> impl Strategy<Value = String> {
        let attack = prop_oneof![
            Just("' OR '1'='1".to_string()),
            Just("UNION SELECT".to_string()),
            Just("1 UNION ALL SELECT password FROM users".to_string()),
            Just("'; WAITFOR DELAY '0:0:5'--".to_string()),
            Just("1 AND SLEEP(5)".to_string()),
        ];
        ("[a-zA-Z0-9 ]{0,12}", attack, "[a-zA-Z0-9 ]{0,12}")
            .prop_map(|(pre, attack, post)| format!("{}{}{}", pre, attack, post))
    }

    proptest! {
        #[test]
        fn prop_payload_refused_in_literal_allowed_as_param(p in payload()) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let guard = rt.block_on(guard(dir.path(), QueryGuardConfig::default()));

            let literal = QuerySpec::read(malmo())
                .sql("SELECT * FROM pupils WHERE name = '")
                .push_dynamic(p.clone(), Origin::Untrusted)
                .sql("'");
            prop_assert!(!guard.validate(&literal).allowed);

            let bound = QuerySpec::read(malmo())
                .sql("SELECT * FROM pupils WHERE name = ")
                .bind(p.clone());
            prop_assert!(guard.validate(&bound).allowed);
            prop_assert_eq!(bound.params(), &[SqlValue::Text(p.clone())][..]);
            prop_assert!(!bound.text().contains(&p));
        }
    }
}
