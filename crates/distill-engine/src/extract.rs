//! Structured-output parsing and facet path evaluation.
//!
//! Models asked for JSON frequently wrap it in a fenced code block anyway;
//! [`strip_code_fence`] unwraps that. Facet specs map a facet type to a
//! dotted path into the parsed value, where a `[]` suffix on a segment
//! iterates an array, e.g. `people[].name` collects every person's name.

use serde_json::Value;

use crate::error::EngineError;

/// Strip a surrounding Markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", or nothing) up to the first
    // newline, then the closing fence.
    let body = match rest.split_once('\n') {
        Some((_info, body)) => body,
        None => return trimmed,
    };
    body.trim_end()
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Parse structured model output, accepting an object or an array at the
/// root.
pub fn parse_structured(text: &str) -> Result<Value, EngineError> {
    let unfenced = strip_code_fence(text);
    let value: Value = serde_json::from_str(unfenced)
        .map_err(|e| EngineError::Parse(format!("{e} in model output")))?;
    match value {
        Value::Object(_) | Value::Array(_) => Ok(value),
        other => Err(EngineError::Parse(format!(
            "expected object or array at root, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The facet mappings of a spec: (facet type, extraction path) pairs.
///
/// Non-string values in the spec are skipped; the spec shape is owned by
/// configuration, not by this crate.
pub fn facet_mappings(spec: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = spec else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(facet_type, path)| {
            path.as_str()
                .map(|p| (facet_type.clone(), p.to_string()))
        })
        .collect()
}

/// Evaluate one dotted path against a parsed output, collecting scalar
/// leaves as strings. A root array is iterated implicitly.
pub fn extract_path(root: &Value, path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut out = Vec::new();
    match root {
        Value::Array(items) => {
            for item in items {
                walk(item, &segments, &mut out);
            }
        }
        _ => walk(root, &segments, &mut out),
    }
    out
}

fn walk(value: &Value, segments: &[&str], out: &mut Vec<String>) {
    let Some((segment, rest)) = segments.split_first() else {
        if let Some(scalar) = scalar_to_string(value) {
            out.push(scalar);
        }
        return;
    };

    if let Some(field) = segment.strip_suffix("[]") {
        if let Some(Value::Array(items)) = value.get(field) {
            for item in items {
                walk(item, rest, out);
            }
        }
    } else if let Some(child) = value.get(segment) {
        walk(child, rest, out);
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_json_fence() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence() {
        let fenced = "```\n[1, 2]\n```";
        assert_eq!(strip_code_fence(fenced), "[1, 2]");
    }

    #[test]
    fn unfenced_text_passes_through() {
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn parses_object_and_array_roots() {
        assert!(parse_structured("{\"a\": 1}").is_ok());
        assert!(parse_structured("[1, 2, 3]").is_ok());
        assert!(parse_structured("```json\n{}\n```").is_ok());
    }

    #[test]
    fn rejects_scalar_roots_and_garbage() {
        assert!(matches!(
            parse_structured("42"),
            Err(EngineError::Parse(_))
        ));
        assert!(matches!(
            parse_structured("not json at all"),
            Err(EngineError::Parse(_))
        ));
    }

    #[test]
    fn simple_dotted_path() {
        let value = json!({"summary": {"mood": "tense"}});
        assert_eq!(extract_path(&value, "summary.mood"), vec!["tense"]);
    }

    #[test]
    fn array_iteration_with_suffix() {
        let value = json!({
            "people": [
                {"name": "Ada", "role": "engineer"},
                {"name": "Grace", "role": "admiral"}
            ]
        });
        assert_eq!(extract_path(&value, "people[].name"), vec!["Ada", "Grace"]);
        assert_eq!(
            extract_path(&value, "people[].role"),
            vec!["engineer", "admiral"]
        );
    }

    #[test]
    fn nested_array_paths() {
        let value = json!({
            "threads": [
                {"tags": [{"label": "work"}, {"label": "urgent"}]},
                {"tags": [{"label": "family"}]}
            ]
        });
        assert_eq!(
            extract_path(&value, "threads[].tags[].label"),
            vec!["work", "urgent", "family"]
        );
    }

    #[test]
    fn root_array_is_iterated() {
        let value = json!([{"name": "a"}, {"name": "b"}]);
        assert_eq!(extract_path(&value, "name"), vec!["a", "b"]);
    }

    #[test]
    fn numbers_and_bools_stringify() {
        let value = json!({"scores": [{"v": 3}, {"v": 4.5}, {"v": true}]});
        assert_eq!(extract_path(&value, "scores[].v"), vec!["3", "4.5", "true"]);
    }

    #[test]
    fn missing_paths_yield_nothing() {
        let value = json!({"a": {"b": 1}});
        assert!(extract_path(&value, "a.c").is_empty());
        assert!(extract_path(&value, "x[].y").is_empty());
        // Non-array field with [] suffix is not iterated.
        assert!(extract_path(&value, "a[].b").is_empty());
    }

    #[test]
    fn mappings_from_spec() {
        let spec = json!({
            "person": "people[].name",
            "mood": "summary.mood",
            "ignored": 42
        });
        let mut mappings = facet_mappings(&spec);
        mappings.sort();
        assert_eq!(
            mappings,
            vec![
                ("mood".to_string(), "summary.mood".to_string()),
                ("person".to_string(), "people[].name".to_string()),
            ]
        );
    }
}
