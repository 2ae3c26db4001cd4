//! `{{name}}` prompt templates
//!
//! Message and end nodes render templates whose placeholders name the
//! node's declared inputs. Parsing is separated from rendering so a node
//! can stream literal text and resolved values segment by segment.

use serde_json::Value;

/// One piece of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    /// Placeholder naming an input, whitespace trimmed
    Var(String),
}

impl Segment {
    /// Source form of the segment
    pub fn raw(&self) -> String {
        match self {
            Segment::Text(text) => text.clone(),
            Segment::Var(name) => format!("{{{{{}}}}}", name),
        }
    }
}

/// Split a template into literal text and placeholders
///
/// An unterminated `{{` and an empty placeholder are kept as text.
pub fn parse(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let name = rest[open + 2..open + 2 + close].trim();
        text.push_str(&rest[..open]);
        if name.is_empty() {
            text.push_str(&rest[open..open + close + 4]);
        } else {
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Var(name.to_string()));
        }
        rest = &rest[open + close + 4..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    segments
}

/// Text form of a resolved value
///
/// Strings are inserted without quotes and `null` renders as nothing.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
