//! Content sanitization
//!
//! Cleans quiz text, documents, announcements, dialogue and feedback before
//! they are stored, rendered or handed to an AI model.
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │  decode  │──▶│  markup  │──▶│injection │──▶│  engine   │
//! │ (layers) │   │ (strip)  │   │ (prompt) │   │(fixpoint) │
//! └──────────┘   └──────────┘   └──────────┘   └─────┬─────┘
//!                                                    │
//!                                      ┌─────────────▼──────┐
//!                                      │ cache (per tenant) │
//!                                      └────────────────────┘
//! ```

pub mod cache;
pub mod decode;
pub mod engine;
pub mod handler;
pub mod injection;
pub mod markup;

pub use cache::{CacheKey, SanitizationCache};
pub use engine::{ContentPayload, SanitizationEngine, SanitizationResult, SanitizerConfig};
pub use handler::{sanitize_router, SanitizeState};
pub use injection::{InjectionDetector, InjectionResult, InjectionVerdict};
