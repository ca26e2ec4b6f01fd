use std::collections::BTreeSet;

use serde_json::{Map, Value};
use thiserror::Error;

/// Substitution data for prompt placeholders.
pub type PromptData = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("missing required data keys for formatting: {missing:?}")]
    MissingDataKeys { missing: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Splits a template into literal runs and `{name}` placeholders.
///
/// `{{` and `}}` are literal braces. An opening brace without a closing one is
/// kept as literal text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let bytes = template.as_bytes();
    let mut literal_start = 0;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'{' if bytes.get(index + 1) == Some(&b'{') => {
                segments.push(Segment::Literal(&template[literal_start..=index]));
                index += 2;
                literal_start = index;
            }
            b'}' if bytes.get(index + 1) == Some(&b'}') => {
                segments.push(Segment::Literal(&template[literal_start..=index]));
                index += 2;
                literal_start = index;
            }
            b'{' => match template[index + 1..].find('}') {
                Some(offset) => {
                    let close = index + 1 + offset;
                    segments.push(Segment::Literal(&template[literal_start..index]));
                    segments.push(Segment::Placeholder(&template[index + 1..close]));
                    index = close + 1;
                    literal_start = index;
                }
                None => break,
            },
            _ => index += 1,
        }
    }

    segments.push(Segment::Literal(&template[literal_start..]));
    segments.retain(|segment| !matches!(segment, Segment::Literal("")));
    segments
}

/// Distinct placeholder names in the order they first appear.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    segments(template)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Placeholder(name) if seen.insert(name) => Some(name.to_string()),
            _ => None,
        })
        .collect()
}

/// Placeholder names with no matching key in `data`, sorted.
pub fn missing_keys(template: &str, data: &PromptData) -> Vec<String> {
    let mut missing = placeholders(template)
        .into_iter()
        .filter(|name| !data.contains_key(name))
        .collect::<Vec<_>>();
    missing.sort();
    missing
}

pub fn format_prompt(template: &str, data: &PromptData) -> Result<String, FormatError> {
    let missing = missing_keys(template, data);
    if !missing.is_empty() {
        return Err(FormatError::MissingDataKeys { missing });
    }

    let mut rendered = String::with_capacity(template.len());
    for segment in segments(template) {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Placeholder(name) => {
                if let Some(value) = data.get(name) {
                    push_value(&mut rendered, value);
                }
            }
        }
    }
    Ok(rendered)
}

/// Doubles every brace so the text survives a later `format_prompt` pass verbatim.
pub fn escape_braces(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

fn push_value(rendered: &mut String, value: &Value) {
    match value {
        Value::String(text) => rendered.push_str(text),
        Value::Null => rendered.push_str("null"),
        other => rendered.push_str(&other.to_string()),
    }
}
