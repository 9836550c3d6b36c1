// Argument Templates
//
// `$.<path>` is replaced by the selected value, `$.<path>...` (whole argument)
// expands a JSON array into several arguments, and the creation timestamp
// variables are substituted last.

use super::error::Result;
use super::json_path::{is_key_char, render, JsonPath};
use super::message::QueueMessage;
use serde_json::Value;

pub const CREATION_TIMESTAMP_MILLISECONDS: &str = "${CreationTimestampMilliseconds}";
pub const CREATION_TIMESTAMP_SECONDS: &str = "${CreationTimestampSeconds}";

const REFERENCE_PREFIX: &str = "$.";
const EXPANSION_SUFFIX: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Reference(JsonPath),
}

/// A string with embedded `$.<path>` references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTemplate {
    raw: String,
    pieces: Vec<Piece>,
}

impl TextTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(pos) = rest.find(REFERENCE_PREFIX) {
            literal.push_str(&rest[..pos]);
            // Keep the leading '.' as part of the selector
            let after_dollar = &rest[pos + 1..];
            let len = scan_reference(after_dollar);
            if len == 0 {
                literal.push_str(REFERENCE_PREFIX);
                rest = &after_dollar[1..];
                continue;
            }
            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(Piece::Reference(JsonPath::parse(&after_dollar[..len])?));
            rest = &after_dollar[len..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            pieces,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the template contains no references at all
    pub fn is_literal(&self) -> bool {
        self.pieces.iter().all(|p| matches!(p, Piece::Literal(_)))
    }

    pub fn resolve(&self, ctx: &TemplateContext) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for piece in &self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Reference(path) => out.push_str(&render(ctx.select(path))),
            }
        }
        ctx.substitute_variables(out)
    }
}

/// Length of the selector starting at `s` (which begins with '.').
///
/// Trailing dots are left to the surrounding literal so that `$.name.` at the
/// end of a sentence still resolves `.name`.
fn scan_reference(s: &str) -> usize {
    let mut in_bracket = false;
    let mut end = 0;
    for (idx, c) in s.char_indices() {
        let accepted = if in_bracket {
            if c == ']' {
                in_bracket = false;
            }
            true
        } else if c == '[' {
            in_bracket = true;
            true
        } else {
            c == '.' || is_key_char(c)
        };
        if !accepted {
            break;
        }
        end = idx + c.len_utf8();
    }
    s[..end].trim_end_matches('.').len()
}

/// One configured command argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgTemplate {
    /// Resolves to exactly one argument
    Text(TextTemplate),
    /// `$.<path>...`: resolves to one argument per array element
    Expand(JsonPath),
}

impl ArgTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(inner) = raw
            .strip_prefix('$')
            .and_then(|s| s.strip_suffix(EXPANSION_SUFFIX))
        {
            if inner.starts_with('.') && inner.len() > 1 {
                if let Ok(path) = JsonPath::parse(inner) {
                    return Ok(Self::Expand(path));
                }
            }
        }
        TextTemplate::parse(raw).map(Self::Text)
    }

    fn resolve_into(&self, ctx: &TemplateContext, out: &mut Vec<String>) {
        match self {
            Self::Text(t) => out.push(t.resolve(ctx)),
            Self::Expand(path) => {
                if let Some(Value::Array(items)) = ctx.select(path) {
                    out.extend(
                        items
                            .iter()
                            .map(|item| ctx.substitute_variables(render(Some(item)))),
                    );
                }
            }
        }
    }
}

/// Resolve a full argument list, expanding array references in place
pub fn resolve_args(templates: &[ArgTemplate], ctx: &TemplateContext) -> Vec<String> {
    let mut out = Vec::with_capacity(templates.len());
    for template in templates {
        template.resolve_into(ctx, &mut out);
    }
    out
}

/// Values a template is resolved against: the parsed body and the send time
#[derive(Debug, Clone)]
pub struct TemplateContext {
    json: Option<Value>,
    sent_timestamp_ms: i64,
}

impl TemplateContext {
    pub fn new(json: Option<Value>, sent_timestamp_ms: i64) -> Self {
        Self {
            json,
            sent_timestamp_ms,
        }
    }

    pub fn from_message(msg: &QueueMessage) -> Self {
        Self::new(msg.json(), msg.sent_timestamp())
    }

    pub fn select(&self, path: &JsonPath) -> Option<&Value> {
        self.json.as_ref().and_then(|json| path.select(json))
    }

    fn substitute_variables(&self, s: String) -> String {
        if !s.contains("${") {
            return s;
        }
        s.replace(
            CREATION_TIMESTAMP_MILLISECONDS,
            &self.sent_timestamp_ms.to_string(),
        )
        .replace(
            CREATION_TIMESTAMP_SECONDS,
            &(self.sent_timestamp_ms / 1000).to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(body: Value) -> TemplateContext {
        TemplateContext::new(Some(body), 1_591_784_694_000)
    }

    fn args(raw: &[&str], ctx: &TemplateContext) -> Vec<String> {
        let templates: Vec<ArgTemplate> =
            raw.iter().map(|r| ArgTemplate::parse(r).unwrap()).collect();
        resolve_args(&templates, ctx)
    }

    #[test]
    fn test_literal_args_untouched() {
        let c = ctx(json!({"lang": "python3"}));
        assert_eq!(
            args(&["file.php", "first_arg", "second_arg"], &c),
            vec!["file.php", "first_arg", "second_arg"]
        );
    }

    #[test]
    fn test_single_value_extraction() {
        let c = ctx(json!({"lang": "python3", "script": "script01"}));
        assert_eq!(args(&["$.lang", "$.script"], &c), vec!["python3", "script01"]);
    }

    #[test]
    fn test_reference_inside_literal() {
        let c = ctx(json!({"name": "report", "n": 3}));
        assert_eq!(
            args(&["--name=$.name", "out/$.name-$.n"], &c),
            vec!["--name=report", "out/report-3"]
        );
    }

    #[test]
    fn test_trailing_sentence_dot_kept() {
        let c = ctx(json!({"name": "report"}));
        let t = TextTemplate::parse("done with $.name.").unwrap();
        assert_eq!(t.resolve(&c), "done with report.");
    }

    #[test]
    fn test_array_expansion() {
        let c = ctx(json!({"args": ["third", "fourth"]}));
        assert_eq!(
            args(&["first", "$.args...", "last"], &c),
            vec!["first", "third", "fourth", "last"]
        );
    }

    #[test]
    fn test_array_expansion_of_missing_path_is_empty() {
        let c = ctx(json!({"other": 1}));
        assert!(args(&["$.args..."], &c).is_empty());
    }

    #[test]
    fn test_timestamp_variables() {
        let c = ctx(json!({}));
        assert_eq!(
            args(
                &[
                    CREATION_TIMESTAMP_MILLISECONDS,
                    CREATION_TIMESTAMP_SECONDS,
                    "--since=${CreationTimestampSeconds}"
                ],
                &c
            ),
            vec!["1591784694000", "1591784694", "--since=1591784694"]
        );
    }

    #[test]
    fn test_timestamp_applied_after_path_resolution() {
        let c = ctx(json!({"fmt": "ts=${CreationTimestampMilliseconds}"}));
        assert_eq!(args(&["$.fmt"], &c), vec!["ts=1591784694000"]);
    }

    #[test]
    fn test_non_json_body_resolves_empty() {
        let c = TemplateContext::new(None, 0);
        assert_eq!(args(&["x$.lang"], &c), vec!["x"]);
    }

    #[test]
    fn test_invalid_reference_rejected() {
        assert!(ArgTemplate::parse("$.list[abc").is_err());
    }

    #[test]
    fn test_bare_prefix_is_literal() {
        let t = TextTemplate::parse("costs $. only").unwrap();
        assert!(t.is_literal());
        assert_eq!(t.resolve(&TemplateContext::new(None, 0)), "costs $. only");
    }
}
