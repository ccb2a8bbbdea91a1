//! Layered decoding of HTML entities, percent-encoding and escape sequences
//!
//! Each layer applies all three decoders once. Layers stop when decoding
//! no longer changes the text or the depth bound is reached. Every decoder
//! returns `None` when it leaves its input untouched.

/// Result of peeling encoding layers off a text
#[derive(Debug, Clone)]
pub struct DecodedLayers {
    /// `layers[0]` is the input; each following entry is one more layer
    pub layers: Vec<String>,
    /// Decoding still changed the text at the depth bound
    pub exhausted: bool,
}

impl DecodedLayers {
    /// Number of encoding layers removed
    pub fn depth(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn deepest(&self) -> &str {
        self.layers.last().map(String::as_str).unwrap_or("")
    }
}

/// Decode up to `max_depth` layers.
pub fn decode_layers(input: &str, max_depth: usize) -> DecodedLayers {
    let mut layers = vec![input.to_string()];
    for _ in 0..max_depth {
        let next = match decode_once(layers.last().map(String::as_str).unwrap_or("")) {
            Some(next) => next,
            None => {
                return DecodedLayers {
                    layers,
                    exhausted: false,
                }
            }
        };
        layers.push(next);
    }
    let exhausted = decode_once(layers.last().map(String::as_str).unwrap_or("")).is_some();
    DecodedLayers { layers, exhausted }
}

/// One layer: entities, then percent-encoding, then escapes.
pub fn decode_once(input: &str) -> Option<String> {
    let decoders: [fn(&str) -> Option<String>; 3] =
        [decode_html_entities, decode_percent, decode_escapes];
    let mut changed: Option<String> = None;
    for decoder in decoders {
        let current = changed.as_deref().unwrap_or(input);
        if let Some(next) = decoder(current) {
            changed = Some(next);
        }
    }
    changed.filter(|s| s != input)
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "lt" => '<',
        "gt" => '>',
        "amp" => '&',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "colon" => ':',
        "sol" => '/',
        "lpar" => '(',
        "rpar" => ')',
        "semi" => ';',
        "equals" => '=',
        "tab" => '\t',
        "newline" => '\n',
        "grave" => '`',
        _ => return None,
    })
}

/// Entities legacy parsers accept without the trailing semicolon
const LEGACY_ENTITIES: [&str; 4] = ["amp", "quot", "lt", "gt"];

/// Decode named and numeric HTML character references.
pub fn decode_html_entities(input: &str) -> Option<String> {
    if !input.contains('&') {
        return None;
    }
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    let mut changed = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'&' {
            i += 1;
            continue;
        }
        if let Some((ch, len)) = parse_entity(&input[i..]) {
            out.push_str(&input[last..i]);
            out.push(ch);
            i += len;
            last = i;
            changed = true;
        } else {
            i += 1;
        }
    }
    if !changed {
        return None;
    }
    out.push_str(&input[last..]);
    Some(out)
}

/// Parse one reference at the start of `s` (which begins with '&').
fn parse_entity(s: &str) -> Option<(char, usize)> {
    let rest = &s[1..];
    if let Some(num) = rest.strip_prefix('#') {
        let hex = matches!(num.as_bytes().first(), Some(b'x') | Some(b'X'));
        let digits = if hex { &num[1..] } else { num };
        let len = digits
            .bytes()
            .take_while(|b| if hex { b.is_ascii_hexdigit() } else { b.is_ascii_digit() })
            .count();
        if len == 0 || len > 8 {
            return None;
        }
        let code = u32::from_str_radix(&digits[..len], if hex { 16 } else { 10 }).ok()?;
        let ch = char::from_u32(code).filter(|c| *c != '\0')?;
        let mut consumed = 2 + usize::from(hex) + len;
        if digits.as_bytes().get(len) == Some(&b';') {
            consumed += 1;
        }
        return Some((ch, consumed));
    }

    let len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    if len == 0 {
        return None;
    }
    let name = rest[..len].to_ascii_lowercase();
    if rest.as_bytes().get(len) == Some(&b';') {
        if let Some(c) = named_entity(&name) {
            return Some((c, len + 2));
        }
    }
    // `&ltscript` decodes as `<script` in legacy parsing
    LEGACY_ENTITIES
        .iter()
        .find(|legacy| name.starts_with(*legacy))
        .and_then(|legacy| named_entity(legacy).map(|c| (c, legacy.len() + 1)))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` sequences. Left unchanged when the result is not UTF-8.
pub fn decode_percent(input: &str) -> Option<String> {
    if !input.contains('%') {
        return None;
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut changed = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(h), Some(l)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(h << 4 | l);
                i += 3;
                changed = true;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    if !changed {
        return None;
    }
    String::from_utf8(out).ok()
}

/// Decode `\uXXXX`, `\u{X..}` and `\xHH` escapes.
pub fn decode_escapes(input: &str) -> Option<String> {
    if !input.contains('\\') {
        return None;
    }
    let mut out = String::with_capacity(input.len());
    let mut changed = false;
    let mut rest = input;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some((ch, len)) = parse_escape(tail) {
            out.push(ch);
            rest = &tail[len..];
            changed = true;
        } else {
            out.push('\\');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    changed.then_some(out)
}

fn parse_hex(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// Parse one escape at the start of `s` (which begins with '\').
fn parse_escape(s: &str) -> Option<(char, usize)> {
    let body = &s[1..];
    if let Some(hex) = body.strip_prefix('x') {
        let code = parse_hex(hex.get(..2)?)?;
        return char::from_u32(code).map(|c| (c, 4));
    }
    let u = body.strip_prefix('u')?;
    if let Some(braced) = u.strip_prefix('{') {
        let end = braced.find('}')?;
        if end > 6 {
            return None;
        }
        let code = parse_hex(&braced[..end])?;
        return char::from_u32(code).map(|c| (c, 4 + end));
    }
    let high = parse_hex(u.get(..4)?)?;
    if (0xD800..0xDC00).contains(&high) {
        // Surrogate pair: \uD83D\uDE00
        let low = parse_hex(u.get(4..10)?.strip_prefix("\\u")?)?;
        if !(0xDC00..0xE000).contains(&low) {
            return None;
        }
        let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
        return char::from_u32(code).map(|c| (c, 12));
    }
    char::from_u32(high).map(|c| (c, 6))
}
