//! Tenant-bound sessions
//!
//! A session token names exactly one tenant and carries an HMAC-SHA256
//! signature, so the tenant a request acts for is derived from a value the
//! client cannot forge:
//!
//! ```text
//! <tenant>.<session-uuid>.<expires-at>.<base64url(hmac(tenant.uuid.expires))>
//! ```
//!
//! Tokens are stateless so that `civicguard token` can mint them offline;
//! revocation is tracked in memory.

use super::context::TenantId;
use crate::error::{Error, Result};
use axum::http::{header, HeaderMap};
use base64::Engine;
use dashmap::DashMap;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Environment variable holding the signing secret
    pub secret_env: String,
    /// Token lifetime in seconds
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret_env: "CIVICGUARD_SESSION_SECRET".to_string(),
            ttl_secs: 8 * 60 * 60,
        }
    }
}

/// Verified contents of a session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub tenant_id: TenantId,
    pub session_id: Uuid,
    /// Unix seconds
    pub expires_at: i64,
}

/// A freshly issued session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedSession {
    pub token: String,
    pub tenant_id: TenantId,
    pub session_id: Uuid,
    pub user_id: String,
    pub expires_at: i64,
}

/// Minimum signing secret length in bytes
const MIN_SECRET_LEN: usize = 32;

/// Issues and verifies tenant-bound session tokens.
pub struct SessionManager {
    key: hmac::Key,
    ttl_secs: i64,
    issued: DashMap<(TenantId, Uuid), IssuedSession>,
    revoked: DashMap<(TenantId, Uuid), i64>,
}

impl SessionManager {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "Session secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            ttl_secs: i64::try_from(ttl_secs)
                .map_err(|_| Error::Config("session.ttl_secs out of range".to_string()))?,
            issued: DashMap::new(),
            revoked: DashMap::new(),
        })
    }

    /// Build from configuration, reading the secret from the environment.
    ///
    /// Without a configured secret a random one is generated; tokens then
    /// only stay valid for the lifetime of the process.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        match std::env::var(&config.secret_env) {
            Ok(secret) => Self::new(secret.as_bytes(), config.ttl_secs),
            Err(_) => {
                tracing::warn!(
                    env = %config.secret_env,
                    "No session secret configured; using an ephemeral secret"
                );
                let mut secret = [0u8; 32];
                SystemRandom::new()
                    .fill(&mut secret)
                    .map_err(|_| Error::Internal("Failed to generate session secret".to_string()))?;
                Self::new(&secret, config.ttl_secs)
            }
        }
    }

    fn sign(&self, message: &str) -> String {
        let tag = hmac::sign(&self.key, message.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(tag.as_ref())
    }

    /// Issue a session for a user of one tenant.
    pub fn issue(&self, tenant_id: &TenantId, user_id: &str) -> IssuedSession {
        let session_id = Uuid::new_v4();
        let expires_at = chrono::Utc::now().timestamp() + self.ttl_secs;
        let message = format!("{}.{}.{}", tenant_id, session_id, expires_at);
        let token = format!("{}.{}", message, self.sign(&message));

        let session = IssuedSession {
            token,
            tenant_id: tenant_id.clone(),
            session_id,
            user_id: user_id.to_string(),
            expires_at,
        };
        self.issued
            .insert((tenant_id.clone(), session_id), session.clone());
        tracing::info!(tenant_id = %tenant_id, session_id = %session_id, "Session issued");
        session
    }

    /// Verify signature, expiry and revocation.
    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        let invalid = || Error::Unauthenticated("invalid session token".to_string());

        let (message, signature) = token.rsplit_once('.').ok_or_else(invalid)?;
        let signature = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| invalid())?;
        hmac::verify(&self.key, message.as_bytes(), &signature).map_err(|_| invalid())?;

        let mut parts = message.splitn(3, '.');
        let tenant_id = parts
            .next()
            .and_then(|t| TenantId::new(t).ok())
            .ok_or_else(invalid)?;
        let session_id = parts
            .next()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(invalid)?;
        let expires_at: i64 = parts
            .next()
            .and_then(|e| e.parse().ok())
            .ok_or_else(invalid)?;

        if chrono::Utc::now().timestamp() >= expires_at {
            return Err(Error::Unauthenticated("session expired".to_string()));
        }
        if self.revoked.contains_key(&(tenant_id.clone(), session_id)) {
            return Err(Error::Unauthenticated("session revoked".to_string()));
        }

        Ok(SessionClaims {
            tenant_id,
            session_id,
            expires_at,
        })
    }

    /// Revoke a session. Takes effect on the next verification.
    pub fn revoke(&self, tenant_id: &TenantId, session_id: Uuid) {
        let key = (tenant_id.clone(), session_id);
        self.issued.remove(&key);
        self.revoked
            .insert(key, chrono::Utc::now().timestamp_millis());
        tracing::info!(tenant_id = %tenant_id, session_id = %session_id, "Session revoked");
    }

    /// Sessions this process issued for a tenant
    pub fn sessions_for(&self, tenant_id: &TenantId) -> Vec<IssuedSession> {
        self.issued
            .iter()
            .filter(|entry| &entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Bearer token from the `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn manager() -> SessionManager {
        SessionManager::new(SECRET, 3600).unwrap()
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let mgr = manager();
        let session = mgr.issue(&tenant("malmo"), "anna");
        let claims = mgr.verify(&session.token).unwrap();
        assert_eq!(claims.tenant_id, tenant("malmo"));
        assert_eq!(claims.session_id, session.session_id);
        assert_eq!(mgr.sessions_for(&tenant("malmo")).len(), 1);
    }

    #[test]
    fn test_tampered_tenant_rejected() {
        let mgr = manager();
        let session = mgr.issue(&tenant("malmo"), "anna");
        let forged = session.token.replacen("malmo", "lund", 1);
        assert!(matches!(mgr.verify(&forged), Err(Error::Unauthenticated(_))));
    }

    #[test]
    fn test_other_secret_rejected() {
        let session = manager().issue(&tenant("malmo"), "anna");
        let other = SessionManager::new(b"ffffffffffffffffffffffffffffffff", 3600).unwrap();
        assert!(other.verify(&session.token).is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let mgr = SessionManager::new(SECRET, 0).unwrap();
        let session = mgr.issue(&tenant("malmo"), "anna");
        assert!(matches!(mgr.verify(&session.token), Err(Error::Unauthenticated(m)) if m.contains("expired")));
    }

    #[test]
    fn test_revoked_rejected() {
        let mgr = manager();
        let session = mgr.issue(&tenant("malmo"), "anna");
        mgr.revoke(&tenant("malmo"), session.session_id);
        assert!(mgr.verify(&session.token).is_err());
        assert!(mgr.sessions_for(&tenant("malmo")).is_empty());
    }

    #[test]
    fn test_garbage_rejected() {
        let mgr = manager();
        assert!(mgr.verify("").is_err());
        assert!(mgr.verify("malmo").is_err());
        assert!(mgr.verify("a.b.c.d").is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(SessionManager::new(b"short", 60), Err(Error::Config(_))));
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }
}
