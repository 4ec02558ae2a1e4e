use crate::{
    image_utils,
    models::canonical::ContentPart,
    models::openai::{ContentBlock, MessageContent},
};
use serde_json::Value;

/// Coerce OpenAI-style message content into canonical parts.
///
/// Remote images are inlined here; parts whose fetch fails are dropped
/// rather than failing the request.
pub async fn normalize_openai_content(
    client: &reqwest::Client,
    content: &MessageContent,
) -> Vec<ContentPart> {
    match content {
        MessageContent::Text(text) => vec![ContentPart::Text(text.clone())],
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::with_capacity(blocks.len());
            for block in blocks {
                match block {
                    ContentBlock::Text { text }
                    | ContentBlock::InputText { text }
                    | ContentBlock::OutputText { text } => {
                        parts.push(ContentPart::Text(text.clone()));
                    }
                    ContentBlock::ImageUrl { image_url } | ContentBlock::InputImage { image_url } => {
                        if let Some(part) = image_part(client, image_url.url()).await {
                            parts.push(part);
                        }
                    }
                }
            }
            parts
        }
    }
}

/// Resolve one image reference (data URL or remote URL) into an inline part.
pub async fn image_part(client: &reqwest::Client, url: &str) -> Option<ContentPart> {
    if url.starts_with("data:") {
        let (mime_type, data) = image_utils::parse_data_url(url).ok()?;
        return Some(ContentPart::Image { mime_type, data });
    }
    match image_utils::fetch_image_as_base64(client, url).await {
        Ok((mime_type, data)) => Some(ContentPart::Image { mime_type, data }),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Dropping image part after failed fetch");
            None
        }
    }
}

/// Extract all text from a loose content value: a plain string,
/// a `{type: text|input_text|output_text, text}` object, or an array mixing
/// any of the above. Other shapes contribute nothing.
pub fn text_from_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str()) {
            Some("text") | Some("input_text") | Some("output_text") | Some("summary_text") => obj
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        },
        Value::Array(items) => items.iter().map(text_from_value).collect(),
        _ => String::new(),
    }
}

/// Pull an image reference out of a loose part value.
///
/// Accepts `image_url` as a string or `{url}` object, and raw base64 under
/// any of the usual key spellings.
pub fn image_url_from_value(part: &Value) -> Option<String> {
    let obj = part.as_object()?;
    if let Some(image_url) = obj.get("image_url") {
        match image_url {
            Value::String(s) => return Some(s.clone()),
            Value::Object(inner) => {
                if let Some(url) = inner.get("url").and_then(|u| u.as_str()) {
                    return Some(url.to_string());
                }
            }
            _ => {}
        }
    }
    for key in ["base64", "b64", "b64_json", "data", "image_base64"] {
        if let Some(data) = obj.get(key).and_then(|v| v.as_str()) {
            let mime = obj
                .get("mime_type")
                .or_else(|| obj.get("media_type"))
                .and_then(|v| v.as_str())
                .unwrap_or("image/png");
            return Some(format!("data:{};base64,{}", mime, data));
        }
    }
    None
}

/// Normalize loose Responses-style content parts into canonical parts.
pub async fn normalize_value_parts(client: &reqwest::Client, value: &Value) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    match value {
        Value::String(s) => parts.push(ContentPart::Text(s.clone())),
        Value::Array(items) => {
            for item in items {
                let part_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
                if matches!(part_type, "input_image" | "image_url" | "image") {
                    if let Some(url) = image_url_from_value(item) {
                        if let Some(part) = image_part(client, &url).await {
                            parts.push(part);
                        }
                    }
                    continue;
                }
                let text = text_from_value(item);
                if !text.is_empty() {
                    parts.push(ContentPart::Text(text));
                }
            }
        }
        other => {
            let text = text_from_value(other);
            if !text.is_empty() {
                parts.push(ContentPart::Text(text));
            }
        }
    }
    parts
}

/// Render a tool-call arguments value as the JSON string upstreams expect.
/// Non-strings are stringified; `{}` is the fallback for anything unprintable.
pub fn arguments_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "{}".to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
    }
}
