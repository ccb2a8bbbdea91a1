//! Per-content-type sanitization policies

use super::library::PatternLibrary;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Kind of user-generated content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    QuizText,
    Document,
    #[serde(alias = "municipal-announcement")]
    Announcement,
    Dialogue,
    Feedback,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::QuizText,
        ContentType::Document,
        ContentType::Announcement,
        ContentType::Dialogue,
        ContentType::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuizText => "quiz-text",
            Self::Document => "document",
            Self::Announcement => "announcement",
            Self::Dialogue => "dialogue",
            Self::Feedback => "feedback",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "quiz-text" | "quiz" => Ok(Self::QuizText),
            "document" => Ok(Self::Document),
            "announcement" | "municipal-announcement" => Ok(Self::Announcement),
            "dialogue" => Ok(Self::Dialogue),
            "feedback" => Ok(Self::Feedback),
            other => Err(Error::Config(format!("Unknown content type: {}", other))),
        }
    }
}

/// Which markup a content type may carry and how strictly it is checked.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTypePolicy {
    pub content_type: ContentType,
    /// Allowed tag names mapped to their allowed attributes
    pub allowed_tags: BTreeMap<String, BTreeSet<String>>,
    /// Content that may be fed to an AI model gets prompt-injection checks
    pub ai_adjacent: bool,
    pub max_content_bytes: usize,
}

impl ContentTypePolicy {
    pub fn allows_tag(&self, tag: &str) -> bool {
        self.allowed_tags.contains_key(tag)
    }

    pub fn allows_attribute(&self, tag: &str, attr: &str) -> bool {
        self.allowed_tags
            .get(tag)
            .map(|attrs| attrs.contains(attr))
            .unwrap_or(false)
    }

    /// No markup survives at all
    pub fn is_plain(&self) -> bool {
        self.allowed_tags.is_empty()
    }
}

/// Builder for content-type policies.
///
/// `build` refuses allowlists that would let active content through, so a
/// misconfigured override can never weaken the element blocklist.
pub struct PolicyBuilder {
    policy: ContentTypePolicy,
}

impl PolicyBuilder {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            policy: ContentTypePolicy {
                content_type,
                allowed_tags: BTreeMap::new(),
                ai_adjacent: true,
                max_content_bytes: 256 * 1024,
            },
        }
    }

    /// Allow a tag without attributes
    pub fn allow_tag(mut self, tag: &str) -> Self {
        self.policy
            .allowed_tags
            .entry(tag.to_lowercase())
            .or_default();
        self
    }

    /// Allow a tag with the given attributes
    pub fn allow_tag_with(mut self, tag: &str, attrs: &[&str]) -> Self {
        let entry = self
            .policy
            .allowed_tags
            .entry(tag.to_lowercase())
            .or_default();
        entry.extend(attrs.iter().map(|a| a.to_lowercase()));
        self
    }

    pub fn ai_adjacent(mut self, ai_adjacent: bool) -> Self {
        self.policy.ai_adjacent = ai_adjacent;
        self
    }

    pub fn max_content_bytes(mut self, max: usize) -> Self {
        self.policy.max_content_bytes = max;
        self
    }

    pub fn build(self, library: &PatternLibrary) -> Result<ContentTypePolicy> {
        for (tag, attrs) in &self.policy.allowed_tags {
            if library.is_forbidden_element(tag) {
                return Err(Error::Config(format!(
                    "Policy for {} may not allow <{}>",
                    self.policy.content_type, tag
                )));
            }
            if let Some(attr) = attrs
                .iter()
                .find(|a| library.is_event_handler(a) || a.as_str() == "style" || a.as_str() == "srcdoc")
            {
                return Err(Error::Config(format!(
                    "Policy for {} may not allow attribute '{}' on <{}>",
                    self.policy.content_type, attr, tag
                )));
            }
        }
        if self.policy.max_content_bytes == 0 {
            return Err(Error::Config(format!(
                "Policy for {} needs a non-zero size ceiling",
                self.policy.content_type
            )));
        }
        Ok(self.policy)
    }
}

/// Configuration override for one content type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    /// Replaces the built-in allowlist: tag -> allowed attributes
    pub allowed_tags: Option<BTreeMap<String, Vec<String>>>,
    pub ai_adjacent: Option<bool>,
    pub max_content_bytes: Option<usize>,
}

/// Built-in policy for a content type
fn builtin_builder(content_type: ContentType) -> PolicyBuilder {
    let builder = PolicyBuilder::new(content_type);
    match content_type {
        ContentType::QuizText | ContentType::Dialogue | ContentType::Feedback => builder,
        ContentType::Document => builder
            .allow_tag("p")
            .allow_tag("strong")
            .allow_tag("em")
            .allow_tag("ul")
            .allow_tag("ol")
            .allow_tag("li")
            .allow_tag("br")
            .allow_tag("h1")
            .allow_tag("h2")
            .allow_tag("h3")
            .allow_tag("h4")
            .allow_tag("blockquote")
            .allow_tag("code")
            .allow_tag_with("a", &["href", "title"]),
        ContentType::Announcement => builder
            .allow_tag("p")
            .allow_tag("strong")
            .allow_tag("em")
            .allow_tag("br")
            .allow_tag_with("a", &["href"])
            .ai_adjacent(false),
    }
}

/// The policy for every content type
#[derive(Debug, Clone)]
pub struct PolicySet {
    policies: HashMap<ContentType, ContentTypePolicy>,
}

impl PolicySet {
    /// Built-in policies with a shared size ceiling
    pub fn builtin(library: &PatternLibrary, max_content_bytes: usize) -> Result<Self> {
        Self::with_overrides(library, max_content_bytes, &HashMap::new())
    }

    /// Built-in policies with per-type overrides applied
    pub fn with_overrides(
        library: &PatternLibrary,
        max_content_bytes: usize,
        overrides: &HashMap<ContentType, PolicyOverride>,
    ) -> Result<Self> {
        let mut policies = HashMap::new();
        for content_type in ContentType::ALL {
            let mut builder = builtin_builder(content_type).max_content_bytes(max_content_bytes);
            if let Some(ov) = overrides.get(&content_type) {
                if let Some(tags) = &ov.allowed_tags {
                    builder = PolicyBuilder::new(content_type)
                        .ai_adjacent(builder.policy.ai_adjacent)
                        .max_content_bytes(max_content_bytes);
                    for (tag, attrs) in tags {
                        let attrs: Vec<&str> = attrs.iter().map(String::as_str).collect();
                        builder = builder.allow_tag_with(tag, &attrs);
                    }
                }
                if let Some(ai) = ov.ai_adjacent {
                    builder = builder.ai_adjacent(ai);
                }
                if let Some(max) = ov.max_content_bytes {
                    builder = builder.max_content_bytes(max);
                }
            }
            policies.insert(content_type, builder.build(library)?);
        }
        Ok(Self { policies })
    }

    pub fn get(&self, content_type: ContentType) -> Result<&ContentTypePolicy> {
        self.policies
            .get(&content_type)
            .ok_or_else(|| Error::Internal(format!("No policy for {}", content_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> PatternLibrary {
        PatternLibrary::builtin().unwrap()
    }

    #[test]
    fn test_content_type_aliases() {
        let ct: ContentType = serde_json::from_str("\"municipal-announcement\"").unwrap();
        assert_eq!(ct, ContentType::Announcement);
        assert_eq!("quiz-text".parse::<ContentType>().unwrap(), ContentType::QuizText);
        assert!("spreadsheet".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_builtin_policies() {
        let set = PolicySet::builtin(&library(), 1024).unwrap();
        assert!(set.get(ContentType::QuizText).unwrap().is_plain());
        assert!(set.get(ContentType::Dialogue).unwrap().is_plain());

        let doc = set.get(ContentType::Document).unwrap();
        assert!(doc.allows_tag("h2"));
        assert!(doc.allows_attribute("a", "href"));
        assert!(!doc.allows_attribute("a", "onclick"));
        assert!(!doc.allows_tag("img"));
        assert!(doc.ai_adjacent);

        let ann = set.get(ContentType::Announcement).unwrap();
        assert!(ann.allows_tag("strong"));
        assert!(!ann.allows_tag("h1"));
        assert!(!ann.ai_adjacent);
        assert_eq!(ann.max_content_bytes, 1024);
    }

    #[test]
    fn test_builder_refuses_active_content() {
        let lib = library();
        let result = PolicyBuilder::new(ContentType::Document)
            .allow_tag("script")
            .build(&lib);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = PolicyBuilder::new(ContentType::Document)
            .allow_tag_with("p", &["onclick"])
            .build(&lib);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_override_replaces_allowlist() {
        let mut overrides = HashMap::new();
        let mut tags = BTreeMap::new();
        tags.insert("p".to_string(), vec![]);
        tags.insert("img".to_string(), vec!["src".to_string(), "alt".to_string()]);
        overrides.insert(
            ContentType::Announcement,
            PolicyOverride {
                allowed_tags: Some(tags),
                ai_adjacent: None,
                max_content_bytes: Some(2048),
            },
        );
        let set = PolicySet::with_overrides(&library(), 1024, &overrides).unwrap();
        let ann = set.get(ContentType::Announcement).unwrap();
        assert!(ann.allows_attribute("img", "alt"));
        assert!(!ann.allows_tag("strong"));
        assert!(!ann.ai_adjacent);
        assert_eq!(ann.max_content_bytes, 2048);
    }

    #[test]
    fn test_override_cannot_allow_iframe() {
        let mut overrides = HashMap::new();
        let mut tags = BTreeMap::new();
        tags.insert("iframe".to_string(), vec!["src".to_string()]);
        overrides.insert(
            ContentType::Document,
            PolicyOverride {
                allowed_tags: Some(tags),
                ..Default::default()
            },
        );
        assert!(PolicySet::with_overrides(&library(), 1024, &overrides).is_err());
    }
}
