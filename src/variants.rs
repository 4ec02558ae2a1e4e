use serde_json::{json, Map, Value};

/// Generate alternative request bodies that tolerate upstream quirks.
///
/// The base body comes first; every other variant applies exactly one axis
/// transformation to it. Duplicates (by stable JSON form) are suppressed,
/// preserving first occurrence order.
pub fn build_variants(base: &Value) -> Vec<Value> {
    let mut candidates = vec![base.clone()];

    if let Some(v) = toggle_max_tokens_name(base) {
        candidates.push(v);
    }
    if let Some(v) = toggle_instructions(base) {
        candidates.push(v);
    }
    if let Some(v) = flatten_input_content(base) {
        candidates.push(v);
    }
    if let Some(v) = single_prompt(base) {
        candidates.push(v);
    }
    if let Some(v) = toggle_image_url_shape(base) {
        candidates.push(v);
    }
    candidates.extend(reasoning_variants(base));
    if let Some(v) = strip_optional_fields(base) {
        candidates.push(v);
    }

    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|v| seen.insert(stable_json(v)))
        .collect()
}

/// Canonical string form with object keys sorted recursively.
pub fn stable_json(value: &Value) -> String {
    fn normalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), normalize(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
            other => other.clone(),
        }
    }
    normalize(value).to_string()
}

fn toggle_max_tokens_name(base: &Value) -> Option<Value> {
    let obj = base.as_object()?;
    let mut out = obj.clone();
    if let Some(v) = out.remove("max_output_tokens") {
        out.insert("max_tokens".to_string(), v);
    } else if let Some(v) = out.remove("max_tokens") {
        out.insert("max_output_tokens".to_string(), v);
    } else {
        return None;
    }
    Some(Value::Object(out))
}

/// Inline `instructions` <-> a leading system message in `input`.
fn toggle_instructions(base: &Value) -> Option<Value> {
    let obj = base.as_object()?;
    let mut out = obj.clone();

    if let Some(instructions) = obj.get("instructions").and_then(|v| v.as_str()) {
        let system_item = json!({
            "role": "system",
            "content": [{"type": "input_text", "text": instructions}]
        });
        out.remove("instructions");
        let input = out.entry("input".to_string()).or_insert_with(|| json!([]));
        if let Some(items) = input.as_array_mut() {
            items.insert(0, system_item);
        } else if input.is_string() {
            let user = json!({
                "role": "user",
                "content": [{"type": "input_text", "text": input.as_str().unwrap_or_default()}]
            });
            *input = json!([system_item, user]);
        }
        return Some(Value::Object(out));
    }

    // reverse direction: a leading system item becomes instructions
    let items = obj.get("input")?.as_array()?;
    let first = items.first()?;
    if first.get("role").and_then(|r| r.as_str()) != Some("system") {
        return None;
    }
    let text = crate::converters::content::text_from_value(
        first.get("content").unwrap_or(&Value::Null),
    );
    if text.is_empty() {
        return None;
    }
    out.insert("instructions".to_string(), json!(text));
    out.insert(
        "input".to_string(),
        Value::Array(items[1..].to_vec()),
    );
    Some(Value::Object(out))
}

fn has_images_or_tool_items(items: &[Value]) -> bool {
    items.iter().any(|item| {
        let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if matches!(item_type, "function_call" | "function_call_output") {
            return true;
        }
        item.get("content")
            .and_then(|c| c.as_array())
            .map(|parts| {
                parts.iter().any(|p| {
                    matches!(
                        p.get("type").and_then(|t| t.as_str()),
                        Some("input_image") | Some("image_url") | Some("image")
                    )
                })
            })
            .unwrap_or(false)
    })
}

/// Structured part arrays -> plain strings, when nothing but text is present.
fn flatten_input_content(base: &Value) -> Option<Value> {
    let obj = base.as_object()?;
    let items = obj.get("input")?.as_array()?;
    if has_images_or_tool_items(items) {
        return None;
    }

    let mut changed = false;
    let flattened: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut item_obj = item.as_object().cloned().unwrap_or_default();
            if let Some(content) = item_obj.get("content") {
                if content.is_array() {
                    let text = crate::converters::content::text_from_value(content);
                    item_obj.insert("content".to_string(), json!(text));
                    changed = true;
                }
            }
            Value::Object(item_obj)
        })
        .collect();
    if !changed {
        return None;
    }

    let mut out = obj.clone();
    out.insert("input".to_string(), Value::Array(flattened));
    Some(Value::Object(out))
}

/// Fold the whole input into one prompt string of "role: content" lines.
fn single_prompt(base: &Value) -> Option<Value> {
    let obj = base.as_object()?;
    let items = obj.get("input")?.as_array()?;
    if items.is_empty() || has_images_or_tool_items(items) {
        return None;
    }

    let lines: Vec<String> = items
        .iter()
        .map(|item| {
            let role = item.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let text = crate::converters::content::text_from_value(
                item.get("content").unwrap_or(&Value::Null),
            );
            format!("{}: {}", role, text)
        })
        .collect();

    let mut out = obj.clone();
    out.insert("input".to_string(), json!(lines.join("\n")));
    Some(Value::Object(out))
}

/// input_image.image_url as string <-> `{url}` object.
fn toggle_image_url_shape(base: &Value) -> Option<Value> {
    let obj = base.as_object()?;
    let items = obj.get("input")?.as_array()?;

    let mut changed = false;
    let rewritten: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut item_obj = item.as_object().cloned().unwrap_or_default();
            if let Some(parts) = item_obj.get_mut("content").and_then(|c| c.as_array_mut()) {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) != Some("input_image") {
                        continue;
                    }
                    let Some(part_obj) = part.as_object_mut() else {
                        continue;
                    };
                    match part_obj.get("image_url") {
                        Some(Value::String(url)) => {
                            let url = url.clone();
                            part_obj.insert("image_url".to_string(), json!({"url": url}));
                            changed = true;
                        }
                        Some(Value::Object(inner)) => {
                            if let Some(url) = inner.get("url").and_then(|u| u.as_str()) {
                                let url = url.to_string();
                                part_obj.insert("image_url".to_string(), json!(url));
                                changed = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Value::Object(item_obj)
        })
        .collect();
    if !changed {
        return None;
    }

    let mut out = obj.clone();
    out.insert("input".to_string(), Value::Array(rewritten));
    Some(Value::Object(out))
}

/// `reasoning: {effort}` -> `reasoning_effort: "..."` -> neither.
fn reasoning_variants(base: &Value) -> Vec<Value> {
    let Some(obj) = base.as_object() else {
        return Vec::new();
    };
    let mut out = Vec::new();

    if let Some(effort) = obj
        .get("reasoning")
        .and_then(|r| r.get("effort"))
        .and_then(|e| e.as_str())
    {
        let mut renamed = obj.clone();
        renamed.remove("reasoning");
        renamed.insert("reasoning_effort".to_string(), json!(effort));
        out.push(Value::Object(renamed));
    }
    if obj.contains_key("reasoning") || obj.contains_key("reasoning_effort") {
        let mut stripped = obj.clone();
        stripped.remove("reasoning");
        stripped.remove("reasoning_effort");
        out.push(Value::Object(stripped));
    }
    out
}

fn strip_optional_fields(base: &Value) -> Option<Value> {
    let obj = base.as_object()?;
    if !obj.contains_key("prompt_cache_retention") && !obj.contains_key("safety_identifier") {
        return None;
    }
    let mut out = obj.clone();
    out.remove("prompt_cache_retention");
    out.remove("safety_identifier");
    Some(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_comes_first_and_dedup() {
        let base = json!({"model": "m", "input": "hi"});
        let variants = build_variants(&base);
        assert_eq!(variants[0], base);
        let forms: Vec<String> = variants.iter().map(stable_json).collect();
        let unique: std::collections::HashSet<&String> = forms.iter().collect();
        assert_eq!(forms.len(), unique.len());
    }

    #[test]
    fn test_max_tokens_rename() {
        let base = json!({"model": "m", "max_output_tokens": 100});
        let variants = build_variants(&base);
        assert!(variants
            .iter()
            .any(|v| v.get("max_tokens") == Some(&json!(100))));
    }

    #[test]
    fn test_instructions_hoist() {
        let base = json!({
            "model": "m",
            "instructions": "be brief",
            "input": [{"role": "user", "content": [{"type": "input_text", "text": "hi"}]}]
        });
        let variants = build_variants(&base);
        let hoisted = variants
            .iter()
            .find(|v| v.get("instructions").is_none())
            .expect("hoisted variant");
        assert_eq!(hoisted["input"][0]["role"], "system");
        assert_eq!(
            hoisted["input"][0]["content"][0]["text"],
            "be brief"
        );
    }

    #[test]
    fn test_flatten_skipped_with_tool_items() {
        let base = json!({
            "model": "m",
            "input": [
                {"role": "user", "content": [{"type": "input_text", "text": "hi"}]},
                {"type": "function_call", "call_id": "c", "name": "f", "arguments": "{}"}
            ]
        });
        assert!(flatten_input_content(&base).is_none());
        assert!(single_prompt(&base).is_none());
    }

    #[test]
    fn test_single_prompt_lines() {
        let base = json!({
            "model": "m",
            "input": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": [{"type": "input_text", "text": "hi"}]}
            ]
        });
        let prompt = single_prompt(&base).unwrap();
        assert_eq!(prompt["input"], "system: s\nuser: hi");
    }

    #[test]
    fn test_image_url_toggle() {
        let base = json!({
            "model": "m",
            "input": [{"role": "user", "content": [
                {"type": "input_image", "image_url": "data:image/png;base64,aGk="}
            ]}]
        });
        let toggled = toggle_image_url_shape(&base).unwrap();
        assert_eq!(
            toggled["input"][0]["content"][0]["image_url"]["url"],
            "data:image/png;base64,aGk="
        );
    }

    #[test]
    fn test_reasoning_axis() {
        let base = json!({"model": "m", "reasoning": {"effort": "high"}});
        let variants = build_variants(&base);
        assert!(variants
            .iter()
            .any(|v| v.get("reasoning_effort") == Some(&json!("high"))));
        assert!(variants
            .iter()
            .any(|v| v.get("reasoning").is_none() && v.get("reasoning_effort").is_none()));
    }

    #[test]
    fn test_strip_optional_fields() {
        let base = json!({"model": "m", "safety_identifier": "x", "prompt_cache_retention": "24h"});
        let variants = build_variants(&base);
        assert!(variants
            .iter()
            .any(|v| v.get("safety_identifier").is_none()
                && v.get("prompt_cache_retention").is_none()));
    }
}
