use std::collections::HashMap;

use serde_json::Value;

/// Interpolation scope for step bodies: the dispatch payload plus the
/// results of already-completed steps.
pub struct BodyScope<'a> {
    pub payload: &'a Value,
    pub steps: &'a HashMap<String, Value>,
}

/// Resolve `${payload.*}` and `${steps.*}` placeholders in a step body.
///
/// A string that is exactly one placeholder is replaced by the referenced
/// JSON value, preserving its type (`"${payload.week}"` stays a number).
/// Placeholders embedded in longer strings splice in the value's text
/// form. Unresolvable paths become `null` (whole-string) or empty text.
pub fn resolve_body(body: &Value, scope: &BodyScope<'_>) -> Value {
    match body {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| resolve_body(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_body(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(template: &str, scope: &BodyScope<'_>) -> Value {
    // Whole-string placeholder keeps the referenced value's JSON type.
    if template.starts_with("${")
        && template.ends_with('}')
        && template[2..template.len() - 1].find("${").is_none()
    {
        return lookup(&template[2..template.len() - 1], scope)
            .cloned()
            .unwrap_or(Value::Null);
    }

    let mut result = template.to_string();
    let mut start = 0;

    loop {
        let open = match result[start..].find("${") {
            Some(pos) => start + pos,
            None => break,
        };

        let close = match result[open..].find('}') {
            Some(pos) => open + pos,
            None => break,
        };

        let path = &result[open + 2..close];
        let text = match lookup(path, scope) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        result.replace_range(open..=close, &text);
        start = open + text.len();
    }

    Value::String(result)
}

/// Resolve a dotted path like `payload.week` or `steps.clo_begin_week.plan`.
fn lookup<'a>(path: &str, scope: &'a BodyScope<'_>) -> Option<&'a Value> {
    let mut parts = path.split('.');

    let mut current = match parts.next()? {
        "payload" => scope.payload,
        "steps" => {
            let step_id = parts.next()?;
            scope.steps.get(step_id)?
        }
        _ => return None,
    };

    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}
