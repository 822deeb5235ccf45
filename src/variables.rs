//! `${name}` substitution over a parsed workflow document, applied before
//! the document is converted into the typed model.

use crate::error::{LoadError, LoadReason};
use serde_json::{Map, Value};

/// Walks `value`, replacing every `${name}` occurrence in string leaves with
/// the corresponding entry of `variables`. Recurses into objects and arrays;
/// other scalar types pass through unchanged.
///
/// Malformed patterns (`${`, `${}`, nested `${${x}}`) are left verbatim, not
/// treated as a match — mirroring the reference implementation's
/// `_expand_variables`, which only recognizes well-formed `${...}` spans via
/// `\$\{([^}]+)\}`.
pub fn expand_variables(value: &Value, variables: &Map<String, Value>) -> Result<Value, LoadError> {
    match value {
        Value::String(s) => expand_string(s, variables).map(Value::String),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_variables(item, variables)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_variables(v, variables)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_string(input: &str, variables: &Map<String, Value>) -> Result<String, LoadError> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(close_offset) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + close_offset];
                // Skip empty or malformed names (e.g. nested `${${x}}`)
                // rather than treating them as a variable reference.
                if name.is_empty() || name.contains('$') || name.contains('{') {
                    out.push_str(&input[i..i + 3 + close_offset]);
                } else {
                    match variables.get(name) {
                        Some(v) => out.push_str(&stringify(v)),
                        None => {
                            let available: Vec<&str> =
                                variables.keys().map(String::as_str).collect();
                            return Err(LoadError::new(
                                "<variables>",
                                LoadReason::VariableUndefined,
                                format!(
                                    "undefined variable '{name}'; available: [{}]",
                                    available.join(", ")
                                ),
                            ));
                        }
                    }
                }
                i += 3 + close_offset;
                continue;
            }
        }
        let ch_len = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }
    Ok(out)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn substitutes_known_variable() {
        let vars = vars(&[("host", json!("bmc01"))]);
        let result = expand_variables(&json!("ip=${host}"), &vars).unwrap();
        assert_eq!(result, json!("ip=bmc01"));
    }

    #[test]
    fn recurses_into_nested_structures() {
        let vars = vars(&[("retries", json!(3))]);
        let input = json!({"a": ["x", "${retries}"], "b": {"c": "${retries}"}});
        let result = expand_variables(&input, &vars).unwrap();
        assert_eq!(result, json!({"a": ["x", "3"], "b": {"c": "3"}}));
    }

    #[test]
    fn passes_through_malformed_patterns() {
        let vars = Map::new();
        for input in ["${", "${}", "${${x}}", "name}"] {
            let result = expand_variables(&json!(input), &vars).unwrap();
            assert_eq!(result, json!(input), "input {input:?} should pass through unchanged");
        }
    }

    #[test]
    fn undefined_variable_fails_with_available_names_listed() {
        let vars = vars(&[("known", json!("x"))]);
        let err = expand_variables(&json!("${missing}"), &vars).unwrap_err();
        assert_eq!(err.reason, LoadReason::VariableUndefined);
        assert!(err.details.contains("missing"));
        assert!(err.details.contains("known"));
    }

    #[test]
    fn null_expands_to_empty_string() {
        let vars = vars(&[("x", Value::Null)]);
        let result = expand_variables(&json!("[${x}]"), &vars).unwrap();
        assert_eq!(result, json!("[]"));
    }
}
