use crate::config::{ApiMode, EndpointOverrides};
use url::Url;

/// Build the ordered list of candidate upstream URLs for one request.
///
/// Candidates from the first base URL come first; order within a base is the
/// per-dialect preference order. The list is intentionally not deduplicated.
pub fn synthesize(
    api_mode: ApiMode,
    base_urls: &[String],
    endpoints: &EndpointOverrides,
    model: &str,
    stream: bool,
) -> Vec<String> {
    base_urls
        .iter()
        .filter_map(|base| strip_query_and_fragment(base))
        .flat_map(|base| candidates_for_base(api_mode, &base, endpoints, model, stream))
        .collect()
}

fn strip_query_and_fragment(base: &str) -> Option<Url> {
    let mut url = Url::parse(base).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url)
}

fn candidates_for_base(
    api_mode: ApiMode,
    base: &Url,
    endpoints: &EndpointOverrides,
    model: &str,
    stream: bool,
) -> Vec<String> {
    match api_mode {
        ApiMode::OpenAiResponses => {
            openai_candidates(base, endpoints.responses_path.as_deref(), "responses")
        }
        ApiMode::OpenAiChatCompletions => openai_candidates(
            base,
            endpoints.chat_completions_path.as_deref(),
            "chat/completions",
        ),
        ApiMode::Claude => claude_candidates(base, endpoints.messages_path.as_deref()),
        ApiMode::Gemini => gemini_candidates(base, model, stream),
    }
}

/// Shared rules for the two OpenAI-style endpoints (`responses` and
/// `chat/completions`): accept complete endpoints as-is, honor a configured
/// path exactly, otherwise try the inferred spelling first and the
/// alternatives after, never emitting a `/v1/v1/` path.
fn openai_candidates(base: &Url, configured: Option<&str>, endpoint: &str) -> Vec<String> {
    let path = base.path().trim_end_matches('/');

    if path.ends_with(&format!("/{}", endpoint)) {
        return vec![with_path(base, path)];
    }

    if let Some(configured) = configured {
        let suffix = if configured.starts_with('/') {
            configured.to_string()
        } else {
            format!("/{}", configured)
        };
        let joined = format!("{}{}", path, suffix).replace("/v1/v1/", "/v1/");
        return vec![with_path(base, &joined)];
    }

    let inferred = if path.ends_with("/v1") {
        format!("{}/{}", path, endpoint)
    } else {
        format!("{}/v1/{}", path, endpoint)
    };

    let mut out: Vec<String> = Vec::new();
    for candidate in [
        inferred,
        format!("{}/{}", path, endpoint),
        format!("{}/v1/{}", path, endpoint),
    ] {
        if candidate.contains("/v1/v1/") {
            continue;
        }
        let full = with_path(base, &candidate);
        if !out.contains(&full) {
            out.push(full);
        }
    }
    out
}

fn claude_candidates(base: &Url, configured: Option<&str>) -> Vec<String> {
    let path = base.path().trim_end_matches('/');

    if path.ends_with("/messages") {
        return vec![with_path(base, path)];
    }

    if let Some(configured) = configured {
        let suffix = if configured.starts_with('/') {
            configured.to_string()
        } else {
            format!("/{}", configured)
        };
        return vec![with_path(base, &format!("{}{}", path, suffix))];
    }

    let path = if path.ends_with("/v1") {
        format!("{}/messages", path)
    } else {
        format!("{}/v1/messages", path)
    };
    vec![with_path(base, &path)]
}

fn gemini_candidates(base: &Url, model: &str, stream: bool) -> Vec<String> {
    let method = if stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    let path = base.path().trim_end_matches('/');

    let path = if let Some(prefix) = path
        .strip_suffix(":generateContent")
        .or_else(|| path.strip_suffix(":streamGenerateContent"))
    {
        // complete endpoint - just align the method with the stream flag
        format!("{}:{}", prefix, method)
    } else {
        let prefix = if path.contains("/v1beta") {
            path.to_string()
        } else {
            format!("{}/v1beta", path)
        };
        format!("{}/models/{}:{}", prefix, model, method)
    };

    let mut url = base.clone();
    url.set_path(&path);
    if stream {
        url.set_query(Some("alt=sse"));
    }
    vec![url.to_string()]
}

fn with_path(base: &Url, path: &str) -> String {
    let mut url = base.clone();
    url.set_path(path);
    url.to_string()
}
