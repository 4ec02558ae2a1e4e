use crate::{config::RuntimeOptions, error::AppError};
use axum::http::{HeaderMap, Uri};
use subtle::ConstantTimeEq;

/// Authentication information attached to each authenticated request
#[derive(Debug, Clone)]
pub struct AuthInfo {
    /// The inbound token that authenticated this request
    pub token: String,
}

/// Header names checked for credentials, in priority order
const TOKEN_HEADERS: [&str; 4] = [
    "x-api-key",
    "x-goog-api-key",
    "anthropic-api-key",
    "x-anthropic-api-key",
];

/// Pull the bearer token out of a request.
///
/// Order: `Authorization: Bearer`, a lone `Authorization` value, the API-key
/// header spellings of each dialect, and - for `/gemini/*` routes only - the
/// `key` query parameter.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let token = match auth.strip_prefix("Bearer ") {
            Some(token) => token,
            None => auth,
        };
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    for name in TOKEN_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    if uri.path().starts_with("/gemini/") {
        if let Some(query) = uri.query() {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("key=") {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }

    None
}

/// Validate a request against the configured inbound key set.
pub fn authenticate(
    options: &RuntimeOptions,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<AuthInfo, AppError> {
    if options.inbound_keys.is_empty() {
        return Err(AppError::ConfigError(
            "no inbound auth keys configured (WORKER_AUTH_KEY / WORKER_AUTH_KEYS)".to_string(),
        ));
    }

    let token = extract_token(headers, uri).ok_or(AppError::MissingAuth)?;

    let valid = options
        .inbound_keys
        .iter()
        .any(|key| key.as_bytes().ct_eq(token.as_bytes()).into());
    if !valid {
        return Err(AppError::Unauthorized("Invalid API key".to_string()));
    }

    Ok(AuthInfo { token })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            inbound_keys: vec!["k1".to_string(), "k2".to_string()],
            ..Default::default()
        }
    }

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let header_name: axum::http::HeaderName = name.parse().unwrap();
        headers.insert(header_name, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_bearer_preferred() {
        let uri: Uri = "/v1/chat/completions".parse().unwrap();
        let mut headers = headers_with("authorization", "Bearer k1");
        headers.insert("x-api-key", "other".parse().unwrap());
        assert_eq!(extract_token(&headers, &uri).as_deref(), Some("k1"));
    }

    #[test]
    fn test_lone_authorization_value() {
        let uri: Uri = "/v1/responses".parse().unwrap();
        let headers = headers_with("authorization", "k2");
        assert_eq!(extract_token(&headers, &uri).as_deref(), Some("k2"));
    }

    #[test]
    fn test_dialect_headers() {
        let uri: Uri = "/claude/v1/messages".parse().unwrap();
        for name in TOKEN_HEADERS {
            let headers = headers_with(name, "tok");
            assert_eq!(extract_token(&headers, &uri).as_deref(), Some("tok"));
        }
    }

    #[test]
    fn test_key_query_only_for_gemini_routes() {
        let headers = HeaderMap::new();
        let gemini: Uri = "/gemini/v1beta/models/echo:generateContent?key=g1"
            .parse()
            .unwrap();
        assert_eq!(extract_token(&headers, &gemini).as_deref(), Some("g1"));

        let chat: Uri = "/v1/chat/completions?key=g1".parse().unwrap();
        assert_eq!(extract_token(&headers, &chat), None);
    }

    #[test]
    fn test_authenticate_outcomes() {
        let uri: Uri = "/v1/chat/completions".parse().unwrap();

        let ok = authenticate(&options(), &headers_with("authorization", "Bearer k2"), &uri);
        assert_eq!(ok.unwrap().token, "k2");

        let missing = authenticate(&options(), &HeaderMap::new(), &uri).unwrap_err();
        assert!(matches!(missing, AppError::MissingAuth));

        let wrong =
            authenticate(&options(), &headers_with("authorization", "Bearer bad"), &uri)
                .unwrap_err();
        assert!(matches!(wrong, AppError::Unauthorized(_)));

        let unconfigured = authenticate(
            &RuntimeOptions::default(),
            &headers_with("authorization", "Bearer k1"),
            &uri,
        )
        .unwrap_err();
        assert!(matches!(unconfigured, AppError::ConfigError(_)));
    }
}
