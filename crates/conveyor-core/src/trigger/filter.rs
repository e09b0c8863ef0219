//! Event filter matching: dotted-path resolution and match rules.
//!
//! A filter is an AND over `path -> rule` entries resolved against the JSON
//! projection of the event. Pattern rules run on the `regex` crate's
//! linear-time engine with explicit length caps, so no input can blow the
//! matching budget.

use conveyor_types::trigger::FilterRule;
use regex::RegexBuilder;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest accepted pattern.
pub const MAX_PATTERN_LEN: usize = 1_000;

/// Longest input a pattern is matched against.
pub const MAX_PATTERN_INPUT_LEN: usize = 10_000;

/// Compiled-pattern memory cap.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Dotted-path resolution
// ---------------------------------------------------------------------------

/// Resolve a dotted path against a JSON value.
///
/// Any non-object intermediate yields `None` (the field is treated as
/// missing, not an error).
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Apply a full filter (AND over fields) to an event's JSON projection.
pub fn match_filter(
    filter: &std::collections::HashMap<String, FilterRule>,
    event_json: &Value,
) -> bool {
    filter
        .iter()
        .all(|(path, rule)| match_rule(rule, resolve_path(event_json, path)))
}

/// Apply one rule to a resolved field (missing field never matches).
pub fn match_rule(rule: &FilterRule, actual: Option<&Value>) -> bool {
    let Some(actual) = actual else {
        return false;
    };

    match rule {
        FilterRule::Equals(expected) => coerce(actual) == coerce(expected),
        FilterRule::In { any_of } => any_of.iter().any(|candidate| candidate == actual),
        FilterRule::Pattern { pattern } => match_pattern(pattern, actual),
    }
}

/// String coercion for primitive equality (`"7"` matches `7`).
fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn match_pattern(pattern: &str, actual: &Value) -> bool {
    let Value::String(input) = actual else {
        return false;
    };
    if pattern.len() > MAX_PATTERN_LEN || input.len() > MAX_PATTERN_INPUT_LEN {
        return false;
    }
    match RegexBuilder::new(pattern).size_limit(REGEX_SIZE_LIMIT).build() {
        Ok(re) => re.is_match(input),
        // Invalid regex never matches.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn event_json() -> Value {
        json!({
            "source_id": "hooks",
            "payload": {
                "type": "webhook",
                "body": { "branch": "main", "build": 7, "ok": true }
            }
        })
    }

    // -------------------------------------------------------------------
    // Path resolution
    // -------------------------------------------------------------------

    #[test]
    fn test_resolve_nested_path() {
        let v = event_json();
        assert_eq!(resolve_path(&v, "payload.body.branch"), Some(&json!("main")));
        assert_eq!(resolve_path(&v, "source_id"), Some(&json!("hooks")));
    }

    #[test]
    fn test_resolve_missing_and_non_object_intermediate() {
        let v = event_json();
        assert!(resolve_path(&v, "payload.body.missing").is_none());
        // "branch" is a string, so descending through it is "missing".
        assert!(resolve_path(&v, "payload.body.branch.deeper").is_none());
    }

    // -------------------------------------------------------------------
    // Primitive equality
    // -------------------------------------------------------------------

    #[test]
    fn test_primitive_string_coercion() {
        assert!(match_rule(&FilterRule::Equals(json!("7")), Some(&json!(7))));
        assert!(match_rule(&FilterRule::Equals(json!(7)), Some(&json!("7"))));
        assert!(match_rule(&FilterRule::Equals(json!(true)), Some(&json!("true"))));
        assert!(!match_rule(&FilterRule::Equals(json!("8")), Some(&json!(7))));
    }

    #[test]
    fn test_missing_field_never_matches() {
        assert!(!match_rule(&FilterRule::Equals(json!("x")), None));
        assert!(!match_rule(&FilterRule::Pattern { pattern: ".*".to_string() }, None));
    }

    // -------------------------------------------------------------------
    // In rule
    // -------------------------------------------------------------------

    #[test]
    fn test_in_rule_exact_equality() {
        let rule = FilterRule::In { any_of: vec![json!("main"), json!("develop")] };
        assert!(match_rule(&rule, Some(&json!("main"))));
        assert!(!match_rule(&rule, Some(&json!("feature"))));
        // Exact, not coerced: 7 is not in ["7"].
        let rule = FilterRule::In { any_of: vec![json!("7")] };
        assert!(!match_rule(&rule, Some(&json!(7))));
    }

    // -------------------------------------------------------------------
    // Pattern rule
    // -------------------------------------------------------------------

    #[test]
    fn test_pattern_matching() {
        let rule = FilterRule::Pattern { pattern: "^v[0-9]+\\.".to_string() };
        assert!(match_rule(&rule, Some(&json!("v2.1.0"))));
        assert!(!match_rule(&rule, Some(&json!("release-2"))));
    }

    #[test]
    fn test_pattern_rejects_non_strings() {
        let rule = FilterRule::Pattern { pattern: "7".to_string() };
        assert!(!match_rule(&rule, Some(&json!(7))));
    }

    #[test]
    fn test_pattern_length_caps() {
        let rule = FilterRule::Pattern { pattern: "a".repeat(MAX_PATTERN_LEN + 1) };
        assert!(!match_rule(&rule, Some(&json!("aaa"))));

        let rule = FilterRule::Pattern { pattern: "a".to_string() };
        let long_input = "a".repeat(MAX_PATTERN_INPUT_LEN + 1);
        assert!(!match_rule(&rule, Some(&json!(long_input))));
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        let rule = FilterRule::Pattern { pattern: "([unclosed".to_string() };
        assert!(!match_rule(&rule, Some(&json!("anything"))));
    }

    // -------------------------------------------------------------------
    // Full filter
    // -------------------------------------------------------------------

    #[test]
    fn test_filter_is_conjunction() {
        let v = event_json();
        let mut filter = HashMap::new();
        filter.insert(
            "payload.body.branch".to_string(),
            FilterRule::Equals(json!("main")),
        );
        filter.insert("payload.body.build".to_string(), FilterRule::Equals(json!("7")));
        assert!(match_filter(&filter, &v));

        filter.insert("payload.body.ok".to_string(), FilterRule::Equals(json!(false)));
        assert!(!match_filter(&filter, &v));
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(match_filter(&HashMap::new(), &event_json()));
    }
}
