//! Markup tokenizer that keeps allowlisted tags and strips everything else
//!
//! The tokenizer follows browser tag-open rules: `<` only starts a tag when
//! followed by a letter, `/` + letter, `!` or `?`. Anything a browser would
//! render as text stays text; anything it would parse as markup is either
//! re-emitted under the content-type allowlist or removed.

use super::decode::decode_html_entities;
use crate::patterns::{ContentTypePolicy, PatternLibrary, ThreatKind};
use std::collections::BTreeSet;

/// Result of one stripping pass
#[derive(Debug, Clone)]
pub struct MarkupOutcome {
    pub text: String,
    pub threats: BTreeSet<ThreatKind>,
    /// Every allowed tag was re-emitted byte-for-byte
    pub structure_preserved: bool,
    /// Tags, comments and declarations removed
    pub removed: usize,
}

enum OpenKind {
    Comment,
    Declaration,
    Element,
}

struct Attribute<'a> {
    name: String,
    value: Option<&'a str>,
    raw: &'a str,
}

struct Tag<'a> {
    name: String,
    closing: bool,
    self_closing: bool,
    attributes: Vec<Attribute<'a>>,
    raw: &'a str,
    end: usize,
    terminated: bool,
    nested_open: bool,
}

/// Strip markup under a content-type policy.
pub fn strip_markup(
    input: &str,
    policy: &ContentTypePolicy,
    library: &PatternLibrary,
) -> MarkupOutcome {
    strip(input, Some(policy), library)
}

/// Text content with every tag removed.
pub fn text_content(input: &str, library: &PatternLibrary) -> String {
    strip(input, None, library).text
}

fn strip(input: &str, policy: Option<&ContentTypePolicy>, library: &PatternLibrary) -> MarkupOutcome {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut out = MarkupOutcome {
        text: String::with_capacity(len),
        threats: BTreeSet::new(),
        structure_preserved: true,
        removed: 0,
    };
    let mut text_start = 0;
    let mut i = 0;

    while i < len {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some(kind) = open_kind(bytes, i) else {
            i += 1;
            continue;
        };
        out.text.push_str(&input[text_start..i]);
        let next = match kind {
            OpenKind::Comment => {
                out.removed += 1;
                find_str(input, i + 2, "-->").map(|p| p + 3).unwrap_or(len)
            }
            OpenKind::Declaration => {
                out.removed += 1;
                find_byte(bytes, i + 2, b'>').map(|p| p + 1).unwrap_or(len)
            }
            OpenKind::Element => {
                let tag = parse_tag(input, i);
                handle_tag(input, &tag, policy, library, &mut out)
            }
        };
        i = next;
        text_start = next;
    }
    out.text.push_str(&input[text_start..]);
    out
}

fn open_kind(bytes: &[u8], i: usize) -> Option<OpenKind> {
    match bytes.get(i + 1) {
        Some(b'!') => {
            if bytes.get(i + 2..).map_or(false, |r| r.starts_with(b"--")) {
                Some(OpenKind::Comment)
            } else {
                Some(OpenKind::Declaration)
            }
        }
        Some(b'?') => Some(OpenKind::Declaration),
        Some(b'/') => bytes
            .get(i + 2)
            .filter(|b| b.is_ascii_alphabetic())
            .map(|_| OpenKind::Element),
        Some(b) if b.is_ascii_alphabetic() => Some(OpenKind::Element),
        _ => None,
    }
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|b| *b == needle)
        .map(|p| p + from)
}

fn find_str(input: &str, from: usize, needle: &str) -> Option<usize> {
    input.get(from..)?.find(needle).map(|p| p + from)
}

fn is_space(b: u8) -> bool {
    b.is_ascii_whitespace()
}

fn parse_tag(input: &str, start: usize) -> Tag<'_> {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = start + 1;
    let closing = bytes.get(i) == Some(&b'/');
    if closing {
        i += 1;
    }
    let name_start = i;
    while i < len
        && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'-' | b':' | b'_'))
    {
        i += 1;
    }
    let name = input[name_start..i].to_ascii_lowercase();

    let mut attributes = Vec::new();
    let mut self_closing = false;
    let mut terminated = false;
    let mut nested_open = false;

    loop {
        while i < len && (is_space(bytes[i]) || bytes[i] == b'/') {
            self_closing = bytes[i] == b'/';
            i += 1;
        }
        if i >= len {
            break;
        }
        if bytes[i] == b'>' {
            i += 1;
            terminated = true;
            break;
        }

        // Attribute name; the first byte is always consumed so `=` or `<`
        // in name position cannot stall the loop.
        let attr_start = i;
        if bytes[i] == b'<' {
            nested_open = true;
        }
        i += 1;
        while i < len && !is_space(bytes[i]) && !matches!(bytes[i], b'/' | b'>' | b'=') {
            if bytes[i] == b'<' {
                nested_open = true;
            }
            i += 1;
        }
        let attr_name = input[attr_start..i].to_ascii_lowercase();
        self_closing = false;

        let mut j = i;
        while j < len && is_space(bytes[j]) {
            j += 1;
        }
        let mut value = None;
        if j < len && bytes[j] == b'=' {
            j += 1;
            while j < len && is_space(bytes[j]) {
                j += 1;
            }
            if j < len && matches!(bytes[j], b'"' | b'\'') {
                let quote = bytes[j];
                let value_start = j + 1;
                match find_byte(bytes, value_start, quote) {
                    Some(end) => {
                        value = Some(&input[value_start..end]);
                        j = end + 1;
                    }
                    None => {
                        value = Some(&input[value_start..]);
                        j = len;
                    }
                }
            } else {
                let value_start = j;
                while j < len && !is_space(bytes[j]) && bytes[j] != b'>' {
                    j += 1;
                }
                value = Some(&input[value_start..j]);
            }
            i = j;
        }

        attributes.push(Attribute {
            name: attr_name,
            value,
            raw: &input[attr_start..i],
        });
    }

    Tag {
        name,
        closing,
        self_closing,
        attributes,
        raw: &input[start..i],
        end: i,
        terminated,
        nested_open,
    }
}

/// Attribute value as a browser would resolve it for scheme checks.
fn normalize_value(value: &str) -> String {
    let decoded = decode_html_entities(value);
    decoded
        .as_deref()
        .unwrap_or(value)
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .flat_map(char::to_lowercase)
        .collect()
}

fn attribute_threat(attr: &Attribute<'_>, library: &PatternLibrary) -> Option<ThreatKind> {
    if library.is_event_handler(&attr.name) {
        return Some(ThreatKind::EventHandler);
    }
    if attr.name == "srcdoc" {
        return Some(ThreatKind::ScriptTag);
    }
    let value = normalize_value(attr.value?);
    if library.script_scheme(&value).is_some()
        || (library.is_uri_attribute(&attr.name) && library.is_dangerous_uri(&value))
        || (attr.name == "style" && value.contains("expression("))
    {
        return Some(ThreatKind::ObfuscatedScript);
    }
    None
}

/// Skip a raw-text element body up to and including its close tag.
fn skip_raw_text(input: &str, from: usize, name: &str) -> usize {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = from;
    while let Some(pos) = find_str(input, i, "</") {
        let name_start = pos + 2;
        let name_end = name_start + name.len();
        let matches_name = bytes
            .get(name_start..name_end)
            .map_or(false, |n| n.eq_ignore_ascii_case(name.as_bytes()));
        let boundary = bytes
            .get(name_end)
            .map_or(true, |b| !b.is_ascii_alphanumeric());
        if matches_name && boundary {
            return find_byte(bytes, name_end, b'>').map(|p| p + 1).unwrap_or(len);
        }
        i = pos + 2;
    }
    len
}

fn handle_tag(
    input: &str,
    tag: &Tag<'_>,
    policy: Option<&ContentTypePolicy>,
    library: &PatternLibrary,
    out: &mut MarkupOutcome,
) -> usize {
    let threats: Vec<Option<ThreatKind>> = tag
        .attributes
        .iter()
        .map(|a| attribute_threat(a, library))
        .collect();
    out.threats.extend(threats.iter().flatten().copied());
    if tag.nested_open {
        out.threats.insert(ThreatKind::ObfuscatedScript);
    }
    if !tag.closing && library.is_script_container(&tag.name) {
        out.threats.insert(ThreatKind::ScriptTag);
    }

    if !tag.closing && library.is_raw_text_element(&tag.name) {
        out.removed += 1;
        if !tag.terminated {
            return tag.end;
        }
        return skip_raw_text(input, tag.end, &tag.name);
    }

    let allowed = policy.filter(|p| {
        tag.terminated && !library.is_forbidden_element(&tag.name) && p.allows_tag(&tag.name)
    });
    let Some(policy) = allowed else {
        out.removed += 1;
        return tag.end;
    };

    let kept: Vec<&Attribute<'_>> = tag
        .attributes
        .iter()
        .zip(&threats)
        .filter(|(a, threat)| {
            !tag.closing && threat.is_none() && policy.allows_attribute(&tag.name, &a.name)
        })
        .map(|(a, _)| a)
        .collect();

    if !tag.nested_open && kept.len() == tag.attributes.len() {
        out.text.push_str(tag.raw);
    } else {
        out.structure_preserved = false;
        out.text.push('<');
        if tag.closing {
            out.text.push('/');
        }
        out.text.push_str(&tag.name);
        for attr in kept {
            out.text.push(' ');
            out.text.push_str(attr.raw);
        }
        if tag.self_closing && !tag.closing {
            out.text.push_str(" /");
        }
        out.text.push('>');
    }
    tag.end
}
