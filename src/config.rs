//! CivicGuard configuration management

use crate::audit::AuditConfig;
use crate::baseline::BaselineConfig;
use crate::error::{Error, Result};
use crate::exfil::ExfiltrationConfig;
use crate::query::QueryGuardConfig;
use crate::sanitize::SanitizerConfig;
use crate::tenant::{Region, SessionConfig, TenantRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Main CivicGuard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CivicGuardConfig {
    /// HTTP server
    pub server: ServerConfig,

    /// Session tokens
    pub session: SessionConfig,

    /// Storage boundary
    pub storage: StorageConfig,

    /// Sanitization engine
    pub sanitizer: SanitizerConfig,

    /// Query guard
    pub query_guard: QueryGuardConfig,

    /// Exfiltration monitor
    pub exfiltration: ExfiltrationConfig,

    /// Audit logging
    pub audit: AuditConfig,

    /// Security baselines
    pub baseline: BaselineConfig,

    /// Tenants served by this deployment
    pub tenants: Vec<TenantRecord>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins; empty allows any
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18470,
            cors_origins: Vec::new(),
        }
    }
}

/// Storage boundary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data residency region of the storage this deployment writes to
    pub region: Region,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: Region::new("se"),
        }
    }
}

impl CivicGuardConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if !seen.insert(&tenant.id) {
                return Err(Error::Config(format!("Duplicate tenant: {}", tenant.id)));
            }
        }
        if self.storage.region.as_str().is_empty() {
            return Err(Error::Config("storage.region must not be empty".to_string()));
        }
        if self.sanitizer.max_decode_depth == 0 {
            return Err(Error::Config(
                "sanitizer.max_decode_depth must be at least 1".to_string(),
            ));
        }
        for (name, ms) in [
            ("read_timeout_ms", self.query_guard.read_timeout_ms),
            ("write_timeout_ms", self.query_guard.write_timeout_ms),
            ("report_timeout_ms", self.query_guard.report_timeout_ms),
        ] {
            if ms == 0 {
                return Err(Error::Config(format!("query_guard.{} must be positive", name)));
            }
        }
        if self.exfiltration.window_secs == 0 {
            return Err(Error::Config(
                "exfiltration.window_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The default configuration as a TOML document
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| Error::Config(format!("Failed to encode configuration: {}", e)))
    }
}
