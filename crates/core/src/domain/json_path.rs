// JSON Path - jq-style selectors over message bodies
//
// Supported forms: `.`, `.a.b`, `.a[0]`, `.a.[0]`, `.["some key"]`

use super::error::{DomainError, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed selector, e.g. `.payload.args[1]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl JsonPath {
    /// Parse a selector starting with `.`
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| DomainError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('.') {
            return Err(invalid("must start with '.'"));
        }

        let chars: Vec<char> = raw.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    if i == chars.len() {
                        // A lone trailing dot is only valid as the identity path
                        if segments.is_empty() && chars.len() == 1 {
                            break;
                        }
                        return Err(invalid("trailing '.'"));
                    }
                    if chars[i] == '[' {
                        continue;
                    }
                    let start = i;
                    while i < chars.len() && is_key_char(chars[i]) {
                        i += 1;
                    }
                    if start == i {
                        return Err(invalid("empty key"));
                    }
                    segments.push(Segment::Key(chars[start..i].iter().collect()));
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| invalid("unclosed '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(parse_bracket(&inner).ok_or_else(|| invalid("bad index"))?);
                    i = close + 1;
                }
                _ => return Err(invalid("unexpected character")),
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk the selector, `None` when any step is missing
    pub fn select<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |current, segment| match segment {
                Segment::Key(key) => current.get(key.as_str()),
                Segment::Index(idx) => current.get(*idx),
            })
    }
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    let inner = inner.trim();
    if let Some(quoted) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Some(Segment::Key(quoted.to_string()));
    }
    inner.parse::<usize>().ok().map(Segment::Index)
}

/// Characters allowed in an unquoted key
pub(crate) fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Render a selected value as a command-line string.
///
/// Strings are emitted without their JSON quotes, `null` becomes empty and
/// everything else is compact JSON.
pub fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
