use crate::error::AppError;
use base64::{engine::general_purpose, Engine as _};

/// Inline image fetch cap
pub const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

/// Parse a data URL ("data:image/jpeg;base64,<data>") into
/// (mime_type, base64_data).
pub fn parse_data_url(data_url: &str) -> Result<(String, String), AppError> {
    let body = data_url
        .strip_prefix("data:")
        .ok_or_else(|| AppError::InvalidRequest("Invalid data URL: missing 'data:' prefix".to_string()))?;

    let (header, data) = body.split_once(',').ok_or_else(|| {
        AppError::InvalidRequest("Invalid data URL: missing comma separator".to_string())
    })?;

    let mut header_parts = header.split(';');
    let mime_type = header_parts.next().unwrap_or("").to_string();
    let is_base64 = header.split(';').any(|part| part == "base64");

    if !is_base64 {
        return Err(AppError::InvalidRequest(
            "Only base64-encoded data URLs are supported".to_string(),
        ));
    }

    let mime_type = if mime_type.is_empty() {
        "image/jpeg".to_string()
    } else {
        mime_type
    };

    Ok((mime_type, data.to_string()))
}

/// Fetch a remote image and return (mime_type, base64_data).
///
/// Callers drop the content part when this fails; an unreachable image must
/// not fail the whole request.
pub async fn fetch_image_as_base64(
    client: &reqwest::Client,
    url: &str,
) -> Result<(String, String), AppError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::InvalidRequest(
            "Only HTTP(S) URLs are supported for image fetching".to_string(),
        ));
    }

    tracing::debug!(url = %url, "Inlining remote image");

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(AppError::InvalidRequest(format!(
            "Image fetch failed with status: {}",
            response.status()
        )));
    }

    let mime_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "image/jpeg".to_string());

    if let Some(length) = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_IMAGE_BYTES {
            return Err(AppError::InvalidRequest(format!(
                "Image too large: {} bytes (max: {})",
                length, MAX_IMAGE_BYTES
            )));
        }
    }

    let bytes = response.bytes().await?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(AppError::InvalidRequest(format!(
            "Image too large: {} bytes (max: {})",
            bytes.len(),
            MAX_IMAGE_BYTES
        )));
    }

    Ok((mime_type, general_purpose::STANDARD.encode(&bytes)))
}
