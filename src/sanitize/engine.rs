//! Content Sanitization Engine
//!
//! Turns untrusted user content into a safe form under its content type's
//! policy, or rejects it when no safe form exists.
//!
//! ```text
//! raw ──▶ size check ──▶ decode layers ──▶ deferred-execution check
//!                                      └─▶ prompt-injection check (AI-adjacent)
//!     ──▶ ┌──────────── pass (repeat until stable) ─────────────┐
//!         │ strip markup ─▶ decode stripped text ─▶ re-strip if │
//!         │                 decoding reveals threats            │
//!         └─────────────────────────────────────────────────────┘
//!     ──▶ SanitizationResult
//! ```
//!
//! Repeating the pass until its output is stable makes sanitization
//! idempotent: the sanitized text is a fixed point of the pass, so
//! sanitizing it again returns it unchanged.

use super::decode::decode_layers;
use super::injection::{InjectionDetector, InjectionVerdict};
use super::markup::{strip_markup, text_content};
use crate::error::{Error, RejectReason, Result};
use crate::patterns::{
    ContentType, ContentTypePolicy, LibraryExtensions, PatternLibrary, PolicyOverride, PolicySet,
    ThreatKind,
};
use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Sanitizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Maximum encoding layers peeled per pass
    pub max_decode_depth: usize,
    /// Maximum strip/decode passes before giving up on convergence
    pub max_passes: usize,
    /// Default size ceiling for every content type
    pub max_content_bytes: usize,
    /// Entries kept in the per-tenant result cache
    pub cache_capacity: usize,
    /// Look for base64-wrapped injection phrases
    pub detect_encoded_prompts: bool,
    /// Per-content-type policy overrides
    pub policies: HashMap<ContentType, PolicyOverride>,
    /// Extra prompt-injection phrases
    pub patterns: LibraryExtensions,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_decode_depth: 3,
            max_passes: 4,
            max_content_bytes: 256 * 1024,
            cache_capacity: 4096,
            detect_encoded_prompts: true,
            policies: HashMap::new(),
            patterns: LibraryExtensions::default(),
        }
    }
}

/// Untrusted content submitted for sanitization. Immutable once built.
#[derive(Debug, Clone)]
pub struct ContentPayload {
    raw: String,
    content_type: ContentType,
    tenant_id: TenantId,
}

impl ContentPayload {
    pub fn new(raw: impl Into<String>, content_type: ContentType, tenant_id: TenantId) -> Self {
        Self {
            raw: raw.into(),
            content_type,
            tenant_id,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Outcome of sanitizing one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationResult {
    pub sanitized: String,
    pub threats_detected: Vec<ThreatKind>,
    /// False when the content could not be made safe and was emptied
    pub safe: bool,
    /// Every allowed tag round-tripped unchanged
    pub structure_preserved: bool,
}

impl SanitizationResult {
    fn unsafe_empty(threats: BTreeSet<ThreatKind>) -> Self {
        Self {
            sanitized: String::new(),
            threats_detected: threats.into_iter().collect(),
            safe: false,
            structure_preserved: false,
        }
    }
}

/// One strip/decode pass
struct Pass {
    text: String,
    threats: BTreeSet<ThreatKind>,
    structure_preserved: bool,
    /// Encoding nested past the depth bound still hides markup
    aborted: bool,
}

/// Hard cap when checking whether deeply nested encoding hides markup
const BYPASS_PROBE_DEPTH: usize = 32;

/// Whether decoding past the configured depth would reveal a tag opener.
fn hides_markup(text: &str) -> bool {
    let probe = decode_layers(text, BYPASS_PROBE_DEPTH);
    probe.exhausted || probe.deepest().contains('<')
}

/// Content Sanitization Engine
pub struct SanitizationEngine {
    library: Arc<PatternLibrary>,
    policies: PolicySet,
    injection: InjectionDetector,
    max_decode_depth: usize,
    max_passes: usize,
}

impl SanitizationEngine {
    pub fn new(library: Arc<PatternLibrary>, config: &SanitizerConfig) -> Result<Self> {
        if config.max_passes == 0 {
            return Err(Error::Config("sanitizer.max_passes must be at least 1".to_string()));
        }
        let policies =
            PolicySet::with_overrides(&library, config.max_content_bytes, &config.policies)?;
        let injection = InjectionDetector::new(library.clone())
            .with_encoded_detection(config.detect_encoded_prompts);
        Ok(Self {
            library,
            policies,
            injection,
            max_decode_depth: config.max_decode_depth,
            max_passes: config.max_passes,
        })
    }

    pub fn library(&self) -> &Arc<PatternLibrary> {
        &self.library
    }

    pub fn policy(&self, content_type: ContentType) -> Result<&ContentTypePolicy> {
        self.policies.get(content_type)
    }

    /// Sanitize under the payload's content-type policy.
    pub fn sanitize(&self, payload: &ContentPayload) -> Result<SanitizationResult> {
        let policy = self.policies.get(payload.content_type())?;
        self.sanitize_with(payload, policy)
    }

    /// Sanitize under an explicit policy.
    ///
    /// Returns `Error::Rejected` for reject-only threats (prompt injection
    /// in AI-adjacent content, deferred-execution payloads, oversized
    /// content). Everything else yields a result, possibly with
    /// `safe == false` and an empty sanitized string.
    pub fn sanitize_with(
        &self,
        payload: &ContentPayload,
        policy: &ContentTypePolicy,
    ) -> Result<SanitizationResult> {
        let raw = payload.raw();
        if raw.len() > policy.max_content_bytes {
            tracing::warn!(
                tenant_id = %payload.tenant_id(),
                content_type = %payload.content_type(),
                size = raw.len(),
                limit = policy.max_content_bytes,
                "Oversized content rejected"
            );
            return Err(Error::Rejected {
                reason: RejectReason::Oversized,
                threat: None,
            });
        }

        self.check_reject_only(payload, policy)?;

        let mut current = raw.to_string();
        let mut threats = BTreeSet::new();
        let mut structure_preserved = true;
        let mut converged = false;

        for _ in 0..self.max_passes {
            let pass = self.pass(&current, policy);
            threats.extend(pass.threats);
            structure_preserved &= pass.structure_preserved;
            if pass.aborted {
                tracing::warn!(
                    tenant_id = %payload.tenant_id(),
                    content_type = %payload.content_type(),
                    "Encoding nested beyond decode depth; content emptied"
                );
                return Ok(SanitizationResult::unsafe_empty(threats));
            }
            if pass.text == current {
                converged = true;
                break;
            }
            current = pass.text;
        }

        if !converged {
            threats.insert(ThreatKind::EncodedBypass);
            tracing::warn!(
                tenant_id = %payload.tenant_id(),
                content_type = %payload.content_type(),
                passes = self.max_passes,
                "Sanitization did not converge; content emptied"
            );
            return Ok(SanitizationResult::unsafe_empty(threats));
        }

        let safe = raw.trim().is_empty() || !current.trim().is_empty();
        let result = SanitizationResult {
            sanitized: current,
            threats_detected: threats.into_iter().collect(),
            safe,
            structure_preserved,
        };

        tracing::debug!(
            tenant_id = %payload.tenant_id(),
            content_type = %payload.content_type(),
            threat_count = result.threats_detected.len(),
            safe = result.safe,
            "Content sanitized"
        );
        Ok(result)
    }

    /// Deferred-execution payloads and prompt injection have no safe form.
    fn check_reject_only(&self, payload: &ContentPayload, policy: &ContentTypePolicy) -> Result<()> {
        let layers = decode_layers(payload.raw(), self.max_decode_depth);
        let projection = text_content(layers.deepest(), &self.library);
        let views: Vec<&str> = layers
            .layers
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(projection.as_str()))
            .collect();

        if views.iter().any(|v| self.library.has_deferred_execution(v)) {
            tracing::warn!(
                tenant_id = %payload.tenant_id(),
                content_type = %payload.content_type(),
                "Deferred-execution payload rejected"
            );
            return Err(Error::Rejected {
                reason: RejectReason::DeferredExecution,
                threat: Some(ThreatKind::ObfuscatedScript),
            });
        }

        if !policy.ai_adjacent {
            return Ok(());
        }
        let scan = self.injection.scan_all(views.iter().copied());
        match scan.verdict {
            InjectionVerdict::Blocked => {
                tracing::warn!(
                    tenant_id = %payload.tenant_id(),
                    content_type = %payload.content_type(),
                    pattern_count = scan.matches.len(),
                    categories = ?scan.categories(),
                    "Prompt injection blocked"
                );
                Err(Error::Rejected {
                    reason: RejectReason::PromptInjection,
                    threat: Some(ThreatKind::PromptInjection),
                })
            }
            InjectionVerdict::Suspicious => {
                tracing::info!(
                    tenant_id = %payload.tenant_id(),
                    content_type = %payload.content_type(),
                    pattern_count = scan.matches.len(),
                    "Suspicious prompt patterns detected"
                );
                Ok(())
            }
            InjectionVerdict::Clean => Ok(()),
        }
    }

    fn pass(&self, text: &str, policy: &ContentTypePolicy) -> Pass {
        let base = strip_markup(text, policy, &self.library);
        let layers = decode_layers(&base.text, self.max_decode_depth);

        if layers.exhausted && hides_markup(layers.deepest()) {
            let mut threats = base.threats;
            threats.insert(ThreatKind::EncodedBypass);
            return Pass {
                text: String::new(),
                threats,
                structure_preserved: false,
                aborted: true,
            };
        }

        if layers.depth() > 0 {
            let probe = strip_markup(layers.deepest(), policy, &self.library);
            if !probe.threats.is_empty() {
                let mut threats = base.threats;
                threats.extend(probe.threats);
                threats.insert(ThreatKind::EncodedBypass);
                return Pass {
                    text: probe.text,
                    threats,
                    structure_preserved: base.structure_preserved && probe.structure_preserved,
                    aborted: false,
                };
            }
        }

        Pass {
            text: base.text,
            threats: base.threats,
            structure_preserved: base.structure_preserved,
            aborted: false,
        }
    }
}
