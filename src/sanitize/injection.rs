//! Prompt injection defense
//!
//! Detects instruction-override, role-spoofing and delimiter patterns in
//! content that may later be fed to an AI model (tutoring dialogue, quiz
//! generation, summarization). Matching is case-insensitive and runs on
//! every decoded layer of the content, so entity-encoded phrases are
//! caught as well.

use crate::patterns::{PatternLibrary, PromptCategory};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of injection detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionVerdict {
    /// Input appears clean
    Clean,
    /// Suspicious patterns detected (logged, allowed)
    Suspicious,
    /// Injection detected (content is rejected)
    Blocked,
}

/// A matched injection pattern
#[derive(Debug, Clone)]
pub struct InjectionMatch {
    pub category: PromptCategory,
    /// The pattern that matched
    pub pattern: String,
    pub is_blocking: bool,
    /// Byte offset in the scanned text
    pub position: usize,
}

/// Result of scanning input for injection patterns
#[derive(Debug, Clone)]
pub struct InjectionResult {
    pub verdict: InjectionVerdict,
    pub matches: Vec<InjectionMatch>,
}

impl InjectionResult {
    /// Categories of the matches, for structured logging
    pub fn categories(&self) -> Vec<PromptCategory> {
        let mut categories: Vec<PromptCategory> = Vec::new();
        for m in &self.matches {
            if !categories.contains(&m.category) {
                categories.push(m.category);
            }
        }
        categories
    }
}

/// Prompt injection detector backed by the shared pattern library.
#[derive(Debug, Clone)]
pub struct InjectionDetector {
    library: Arc<PatternLibrary>,
    /// Enable base64 payload detection
    detect_encoded: bool,
}

impl InjectionDetector {
    pub fn new(library: Arc<PatternLibrary>) -> Self {
        Self {
            library,
            detect_encoded: true,
        }
    }

    pub fn with_encoded_detection(mut self, enabled: bool) -> Self {
        self.detect_encoded = enabled;
        self
    }

    /// Scan a single text.
    pub fn scan(&self, input: &str) -> InjectionResult {
        let mut matches = Vec::new();
        let input_lower = input.to_lowercase();

        for pattern in self.library.prompt_patterns() {
            if let Some(pos) = input_lower.find(&pattern.phrase) {
                matches.push(InjectionMatch {
                    category: pattern.category,
                    pattern: pattern.phrase.clone(),
                    is_blocking: pattern.blocking,
                    position: pos,
                });
            }
        }

        if let Some(pos) = self.library.find_role_prefix(input) {
            matches.push(InjectionMatch {
                category: PromptCategory::RoleOverride,
                pattern: "role-prefix".to_string(),
                is_blocking: true,
                position: pos,
            });
        }

        if self.detect_encoded {
            if let Some(m) = self.check_encoded_payloads(input) {
                matches.push(m);
            }
        }

        let verdict = if matches.iter().any(|m| m.is_blocking) {
            InjectionVerdict::Blocked
        } else if !matches.is_empty() {
            InjectionVerdict::Suspicious
        } else {
            InjectionVerdict::Clean
        };

        InjectionResult { verdict, matches }
    }

    /// Scan several renderings of the same content (decoded layers, text
    /// projection) and merge the results.
    pub fn scan_all<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> InjectionResult {
        let mut merged = InjectionResult {
            verdict: InjectionVerdict::Clean,
            matches: Vec::new(),
        };
        for text in texts {
            let result = self.scan(text);
            merged.verdict = match (merged.verdict, result.verdict) {
                (InjectionVerdict::Blocked, _) | (_, InjectionVerdict::Blocked) => {
                    InjectionVerdict::Blocked
                }
                (InjectionVerdict::Suspicious, _) | (_, InjectionVerdict::Suspicious) => {
                    InjectionVerdict::Suspicious
                }
                _ => InjectionVerdict::Clean,
            };
            for m in result.matches {
                if !merged.matches.iter().any(|e| e.pattern == m.pattern) {
                    merged.matches.push(m);
                }
            }
        }
        merged
    }

    /// Look for base64 strings that decode to a blocking phrase.
    fn check_encoded_payloads(&self, input: &str) -> Option<InjectionMatch> {
        for (start, block) in self.library.base64_blocks(input) {
            let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(block) else {
                continue;
            };
            let Ok(text) = String::from_utf8(decoded) else {
                continue;
            };
            let text_lower = text.to_lowercase();
            if let Some(pattern) = self
                .library
                .prompt_patterns()
                .iter()
                .find(|p| p.blocking && text_lower.contains(&p.phrase))
            {
                return Some(InjectionMatch {
                    category: PromptCategory::EncodingTrick,
                    pattern: format!("base64-encoded: {}", pattern.phrase),
                    is_blocking: true,
                    position: start,
                });
            }
        }
        None
    }
}
