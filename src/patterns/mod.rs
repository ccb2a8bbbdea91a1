//! Threat pattern library
//!
//! The single versioned source of detection patterns. Both the Content
//! Sanitization Engine and the Query Guard read from one shared
//! [`PatternLibrary`], so detection behavior can never diverge between
//! components.
//!
//! ```text
//! ┌───────────────────┐      ┌───────────────────────┐
//! │  PatternLibrary   │─────▶│  SanitizationEngine   │
//! │  (Arc, versioned) │      └───────────────────────┘
//! │                   │      ┌───────────────────────┐
//! │                   │─────▶│  QueryGuard           │
//! └───────────────────┘      └───────────────────────┘
//! ```

pub mod library;
pub mod policy;

pub use library::{
    LibraryExtensions, PatternLibrary, PromptCategory, PromptPattern, ThreatKind,
    LIBRARY_VERSION,
};
pub use policy::{ContentType, ContentTypePolicy, PolicyBuilder, PolicyOverride, PolicySet};
