use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Down-convert a JSON Schema to Gemini's OpenAPI-3 subset.
///
/// Local `$ref`s are resolved (cycle-guarded) and `allOf` branches merged
/// before conversion; unsupported keywords are dropped rather than passed
/// through, since Gemini rejects schemas with unknown fields.
pub fn to_gemini_schema(schema: &Value) -> Value {
    let mut visited = HashSet::new();
    convert(schema, schema, &mut visited)
}

fn convert(node: &Value, root: &Value, visited: &mut HashSet<String>) -> Value {
    let obj = match node.as_object() {
        Some(obj) => obj,
        None => return json!({}),
    };

    let merged = expand(obj, root, visited);

    // two-branch anyOf/oneOf with a null side collapses to nullable
    for union_key in ["anyOf", "oneOf"] {
        if let Some(branches) = merged.get(union_key).and_then(|v| v.as_array()) {
            if branches.len() == 2 {
                if let Some(non_null) = sole_non_null(branches) {
                    let mut out = convert(non_null, root, visited);
                    if let Some(out_obj) = out.as_object_mut() {
                        out_obj.insert("nullable".to_string(), Value::Bool(true));
                    }
                    return out;
                }
            }
        }
    }

    let mut out = Map::new();
    let mut nullable = merged
        .get("nullable")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    // type handling, including the ["string","null"] union form
    match merged.get("type") {
        Some(Value::String(t)) => {
            if t == "null" {
                nullable = true;
            } else {
                out.insert("type".to_string(), Value::String(t.to_uppercase()));
            }
        }
        Some(Value::Array(types)) => {
            let non_null: Vec<&str> = types
                .iter()
                .filter_map(|t| t.as_str())
                .filter(|t| {
                    if *t == "null" {
                        nullable = true;
                        false
                    } else {
                        true
                    }
                })
                .collect();
            if let Some(first) = non_null.first() {
                out.insert("type".to_string(), Value::String(first.to_uppercase()));
            }
        }
        _ => {}
    }

    if !out.contains_key("type") && merged.contains_key("properties") {
        out.insert("type".to_string(), Value::String("OBJECT".to_string()));
    }

    // exclusive bounds become inclusive ones
    let (minimum, maximum) = inclusive_bounds(&merged);
    if let Some(min) = minimum {
        out.insert("minimum".to_string(), min);
    }
    if let Some(max) = maximum {
        out.insert("maximum".to_string(), max);
    }

    for key in ["description", "format", "pattern", "title"] {
        if let Some(v) = merged.get(key) {
            if v.is_string() {
                out.insert(key.to_string(), v.clone());
            }
        }
    }
    if let Some(e) = merged.get("enum") {
        out.insert("enum".to_string(), e.clone());
    }
    if let Some(req) = merged.get("required") {
        out.insert("required".to_string(), req.clone());
    }

    // Gemini's int64 convention: size bounds travel as strings
    for key in [
        "minItems",
        "maxItems",
        "minLength",
        "maxLength",
        "minProperties",
        "maxProperties",
    ] {
        if let Some(n) = merged.get(key).and_then(|v| v.as_u64()) {
            out.insert(key.to_string(), Value::String(n.to_string()));
        }
    }

    if let Some(props) = merged.get("properties").and_then(|v| v.as_object()) {
        let converted: Map<String, Value> = props
            .iter()
            .map(|(name, sub)| (name.clone(), convert(sub, root, visited)))
            .collect();
        out.insert("properties".to_string(), Value::Object(converted));
    }

    if let Some(items) = merged.get("items") {
        out.insert("items".to_string(), convert(items, root, visited));
    }

    for union_key in ["anyOf", "oneOf"] {
        if let Some(branches) = merged.get(union_key).and_then(|v| v.as_array()) {
            let kept: Vec<Value> = branches
                .iter()
                .filter(|b| {
                    if b.get("type").and_then(|t| t.as_str()) == Some("null") {
                        nullable = true;
                        false
                    } else {
                        true
                    }
                })
                .map(|b| convert(b, root, visited))
                .collect();
            if kept.len() == 1 {
                if let Value::Object(inner) = &kept[0] {
                    for (k, v) in inner {
                        out.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            } else if !kept.is_empty() {
                out.insert("anyOf".to_string(), Value::Array(kept));
            }
        }
    }

    if nullable {
        out.insert("nullable".to_string(), Value::Bool(true));
    }

    Value::Object(out)
}

/// Resolve a local `$ref` and fold `allOf` branches into one object.
/// Local fields win over referenced ones; `properties`, `required` and
/// definition maps union instead of replacing.
fn expand(obj: &Map<String, Value>, root: &Value, visited: &mut HashSet<String>) -> Map<String, Value> {
    let mut merged = Map::new();

    if let Some(reference) = obj.get("$ref").and_then(|v| v.as_str()) {
        if visited.insert(reference.to_string()) {
            let pointer = reference.trim_start_matches('#');
            if let Some(target) = root.pointer(pointer).and_then(|v| v.as_object()) {
                let target = expand(target, root, visited);
                merge_into(&mut merged, &target);
            }
            visited.remove(reference);
        }
    }

    if let Some(branches) = obj.get("allOf").and_then(|v| v.as_array()) {
        for branch in branches {
            if let Some(branch_obj) = branch.as_object() {
                let expanded = expand(branch_obj, root, visited);
                merge_into(&mut merged, &expanded);
            }
        }
    }

    merge_into(&mut merged, obj);
    merged.remove("$ref");
    merged.remove("allOf");
    merged
}

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match key.as_str() {
            "properties" | "$defs" | "definitions" => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let (Some(entry_obj), Some(value_obj)) = (entry.as_object_mut(), value.as_object())
                {
                    for (k, v) in value_obj {
                        entry_obj.insert(k.clone(), v.clone());
                    }
                }
            }
            "required" => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let (Some(entry_arr), Some(value_arr)) = (entry.as_array_mut(), value.as_array())
                {
                    for v in value_arr {
                        if !entry_arr.contains(v) {
                            entry_arr.push(v.clone());
                        }
                    }
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn sole_non_null(branches: &[Value]) -> Option<&Value> {
    let is_null = |b: &Value| b.get("type").and_then(|t| t.as_str()) == Some("null");
    match (is_null(&branches[0]), is_null(&branches[1])) {
        (true, false) => Some(&branches[1]),
        (false, true) => Some(&branches[0]),
        _ => None,
    }
}

/// Convert exclusive bounds (numeric or boolean form) into inclusive ones.
fn inclusive_bounds(obj: &Map<String, Value>) -> (Option<Value>, Option<Value>) {
    let minimum = obj.get("minimum").and_then(|v| v.as_f64());
    let maximum = obj.get("maximum").and_then(|v| v.as_f64());

    let min = match obj.get("exclusiveMinimum") {
        Some(Value::Number(n)) => n.as_f64().map(|x| bump(x, 1.0)),
        Some(Value::Bool(true)) => minimum.map(|x| bump(x, 1.0)),
        _ => minimum,
    };
    let max = match obj.get("exclusiveMaximum") {
        Some(Value::Number(n)) => n.as_f64().map(|x| bump(x, -1.0)),
        Some(Value::Bool(true)) => maximum.map(|x| bump(x, -1.0)),
        _ => maximum,
    };

    (min.map(number_value), max.map(number_value))
}

fn bump(x: f64, direction: f64) -> f64 {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        x + direction
    } else {
        x + direction * f64::EPSILON * x.abs().max(1.0)
    }
}

fn number_value(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        json!(x as i64)
    } else {
        json!(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_uppercase_and_bounds_stringified() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 1, "maxLength": 64},
                "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 5}
            },
            "required": ["name"],
            "additionalProperties": false
        });
        let out = to_gemini_schema(&schema);
        assert_eq!(out["type"], "OBJECT");
        assert_eq!(out["properties"]["name"]["type"], "STRING");
        assert_eq!(out["properties"]["name"]["minLength"], "1");
        assert_eq!(out["properties"]["tags"]["maxItems"], "5");
        assert!(out.get("additionalProperties").is_none());
    }

    #[test]
    fn test_exclusive_minimum_becomes_inclusive() {
        let schema = json!({"type": "integer", "exclusiveMinimum": 3});
        let out = to_gemini_schema(&schema);
        assert_eq!(out["minimum"], 4);
        assert!(out.get("exclusiveMinimum").is_none());

        let schema = json!({"type": "number", "exclusiveMaximum": 1.5});
        let out = to_gemini_schema(&schema);
        let max = out["maximum"].as_f64().unwrap();
        assert!(max < 1.5);
        assert!(1.5 - max < 1e-9);
    }

    #[test]
    fn test_boolean_exclusive_form() {
        let schema = json!({"type": "integer", "minimum": 0, "exclusiveMinimum": true});
        let out = to_gemini_schema(&schema);
        assert_eq!(out["minimum"], 1);
    }

    #[test]
    fn test_nullable_two_branch_union() {
        let schema = json!({"anyOf": [{"type": "null"}, {"type": "string"}]});
        let out = to_gemini_schema(&schema);
        assert_eq!(out["type"], "STRING");
        assert_eq!(out["nullable"], true);
    }

    #[test]
    fn test_null_in_type_array() {
        let schema = json!({"type": ["string", "null"]});
        let out = to_gemini_schema(&schema);
        assert_eq!(out["type"], "STRING");
        assert_eq!(out["nullable"], true);
    }

    #[test]
    fn test_ref_resolution_with_cycle_guard() {
        let schema = json!({
            "$defs": {
                "node": {
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "next": {"$ref": "#/$defs/node"}
                    }
                }
            },
            "$ref": "#/$defs/node"
        });
        let out = to_gemini_schema(&schema);
        assert_eq!(out["type"], "OBJECT");
        assert_eq!(out["properties"]["label"]["type"], "STRING");
        // the cyclic branch terminates instead of recursing forever
        assert!(out["properties"]["next"].is_object());
    }

    #[test]
    fn test_all_of_shallow_merge() {
        let schema = json!({
            "allOf": [
                {"type": "object", "properties": {"a": {"type": "string"}}, "required": ["a"]},
                {"properties": {"b": {"type": "integer"}}, "required": ["b"]}
            ]
        });
        let out = to_gemini_schema(&schema);
        assert_eq!(out["type"], "OBJECT");
        assert_eq!(out["properties"]["a"]["type"], "STRING");
        assert_eq!(out["properties"]["b"]["type"], "INTEGER");
        let required = out["required"].as_array().unwrap();
        assert!(required.contains(&json!("a")) && required.contains(&json!("b")));
    }

    #[test]
    fn test_implied_object_type() {
        let schema = json!({"properties": {"x": {"type": "string"}}});
        let out = to_gemini_schema(&schema);
        assert_eq!(out["type"], "OBJECT");
    }
}
