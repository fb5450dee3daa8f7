use serde_json::{Map, Value as JsonValue};
use thiserror::Error as ThisError;
use tracing::{debug, warn};

use crate::models::notification::UserProfile;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum RenderError {
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("block tags are not supported, found one at byte {0}")]
    Block(usize),

    #[error("unsupported expression in template: {0}")]
    Expression(String),

    #[error("unsupported variable type for key '{0}'")]
    Unsupported(String),
}

/// Variables visible to a template: the recipient's profile first, then the
/// notification payload, whose keys win on collision.
pub fn render_context(profile: &UserProfile, message: &JsonValue) -> Map<String, JsonValue> {
    let mut context = Map::new();

    if let Some(name) = &profile.name {
        context.insert("name".to_string(), JsonValue::String(name.clone()));
    }
    if let Some(email) = &profile.email {
        context.insert("email".to_string(), JsonValue::String(email.clone()));
    }

    match message {
        JsonValue::Object(payload) => {
            for (key, value) in payload {
                context.insert(key.clone(), value.clone());
            }
        }
        JsonValue::Null => {}
        other => {
            warn!(payload_type = %json_type(other), "Notification payload is not an object, ignoring it");
        }
    }

    context
}

/// Substitutes `{{ key }}` and `{{ key.nested }}` placeholders, escaping the
/// substituted text for HTML. Undefined variables render as empty text.
///
/// Only plain variable lookups are understood: `{% ... %}` blocks and
/// filters are rejected rather than sent to the recipient verbatim.
pub fn render(template: &str, context: &Map<String, JsonValue>) -> Result<String, RenderError> {
    if let Some(block) = template.find("{%") {
        return Err(RenderError::Block(block));
    }

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;
    let mut undefined = 0;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);

        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(RenderError::Unclosed(offset + start))?;
        let key = after_open[..end].trim();

        if !is_variable_path(key) {
            return Err(RenderError::Expression(key.to_string()));
        }

        let text = match lookup(context, key) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(JsonValue::Bool(b)) => b.to_string(),
            Some(JsonValue::Null) => String::new(),
            Some(_) => return Err(RenderError::Unsupported(key.to_string())),
            None => {
                debug!(variable = key, "Template variable undefined, rendering empty");
                undefined += 1;
                String::new()
            }
        };
        escape_html(&text, &mut rendered);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    rendered.push_str(rest);

    if undefined > 0 {
        warn!(undefined, "Template rendered with undefined variables");
    }
    debug!(variable_count = context.len(), "Template rendered");

    Ok(rendered)
}

/// `name` or `user.address.city`: identifiers joined by dots.
fn is_variable_path(key: &str) -> bool {
    key.split('.').all(|segment| {
        let mut chars = segment.chars();
        chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

fn lookup<'a>(context: &'a Map<String, JsonValue>, key: &str) -> Option<&'a JsonValue> {
    let mut segments = key.split('.');
    let mut current = context.get(segments.next()?)?;

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }

    Some(current)
}

fn escape_html(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
