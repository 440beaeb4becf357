//! Template Engine: `{{.name}}` placeholder substitution
//!
//! Pure string processing with no I/O.
//! Templates are validated once at registry load via [`parse`] and rendered
//! per request with the merged parameter set.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::TemplateError;

/// Per-request parameter mapping
pub type ParameterSet = HashMap<String, String>;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// One piece of a parsed template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// How substituted values are escaped for the target language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escape {
    #[default]
    None,
    /// POSIX single quoting, so a value is always one shell word
    Shell,
    /// XML character data
    Xml,
}

impl Escape {
    fn apply(self, value: &str, out: &mut String) {
        match self {
            Escape::None => out.push_str(value),
            Escape::Shell => {
                out.push('\'');
                out.push_str(&value.replace('\'', r"'\''"));
                out.push('\'');
            }
            Escape::Xml => {
                for c in value.chars() {
                    match c {
                        '&' => out.push_str("&amp;"),
                        '<' => out.push_str("&lt;"),
                        '>' => out.push_str("&gt;"),
                        '"' => out.push_str("&quot;"),
                        '\'' => out.push_str("&apos;"),
                        c => out.push(c),
                    }
                }
            }
        }
    }
}

/// A scalar parameter value as written in JSON requests or TOML defaults
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    pub fn into_string(self) -> String {
        match self {
            ParamValue::Text(s) => s,
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Bool(b) => b.to_string(),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Split a template into literal and placeholder segments
pub fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let position = offset + start;
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| TemplateError::Malformed {
            position,
            reason: "unterminated placeholder".to_string(),
        })?;

        let inner = after[..end].trim();
        let name = inner
            .strip_prefix('.')
            .ok_or_else(|| TemplateError::Malformed {
                position,
                reason: format!("expected `.name`, found `{inner}`"),
            })?;
        if name.is_empty() || !name.chars().all(is_name_char) {
            return Err(TemplateError::Malformed {
                position,
                reason: format!("invalid parameter name `{name}`"),
            });
        }
        segments.push(Segment::Placeholder(name));

        let consumed = start + OPEN.len() + end + CLOSE.len();
        rest = &rest[consumed..];
        offset += consumed;
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Names referenced by a template, in first-use order, without duplicates
pub fn placeholders(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse(template)? {
        if let Segment::Placeholder(name) = segment {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Command defaults overlaid with request values; request values win
pub fn merge(defaults: &BTreeMap<String, String>, overrides: &ParameterSet) -> ParameterSet {
    let mut merged: ParameterSet = defaults
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Render a template without escaping
pub fn render(template: &str, params: &ParameterSet) -> Result<String, TemplateError> {
    render_with(template, params, Escape::None)
}

/// Render a template, escaping each substituted value
pub fn render_with(
    template: &str,
    params: &ParameterSet,
    escape: Escape,
) -> Result<String, TemplateError> {
    let segments = parse(template)?;
    let mut out = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                let value = params
                    .get(name)
                    .ok_or_else(|| TemplateError::MissingParameter(name.to_string()))?;
                escape.apply(value, &mut out);
            }
        }
    }
    Ok(out)
}

/// Rewrite placeholders as SQLite positional parameters (`?1`, `?2`, ...).
///
/// Returns the rewritten statement and the values to bind, in index order.
/// Repeated names share one index.
pub fn bind_positional(
    template: &str,
    params: &ParameterSet,
) -> Result<(String, Vec<String>), TemplateError> {
    let segments = parse(template)?;
    let mut sql = String::with_capacity(template.len());
    let mut names: Vec<&str> = Vec::new();
    let mut values = Vec::new();

    for segment in segments {
        match segment {
            Segment::Literal(text) => sql.push_str(text),
            Segment::Placeholder(name) => {
                let index = match names.iter().position(|n| *n == name) {
                    Some(i) => i + 1,
                    None => {
                        let value = params
                            .get(name)
                            .ok_or_else(|| TemplateError::MissingParameter(name.to_string()))?;
                        names.push(name);
                        values.push(value.clone());
                        names.len()
                    }
                };
                sql.push('?');
                sql.push_str(&index.to_string());
            }
        }
    }
    Ok((sql, values))
}
