use anyhow::{anyhow, bail};
use serde_json::Value;

/// Which wire protocol an upstream speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMode {
    OpenAiResponses,
    OpenAiChatCompletions,
    Claude,
    Gemini,
}

impl ApiMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai-responses" | "openai_responses" | "responses" => Some(Self::OpenAiResponses),
            "openai-chat-completions" | "openai" | "chat-completions" => {
                Some(Self::OpenAiChatCompletions)
            }
            "claude" | "anthropic" => Some(Self::Claude),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAiResponses => "openai-responses",
            Self::OpenAiChatCompletions => "openai-chat-completions",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    /// Default `owned_by` when the config does not set one
    pub fn default_owned_by(&self) -> &'static str {
        match self {
            Self::OpenAiResponses | Self::OpenAiChatCompletions => "openai",
            Self::Claude => "anthropic",
            Self::Gemini => "google",
        }
    }
}

/// Per-path overrides for upstream endpoint synthesis
#[derive(Debug, Clone, Default)]
pub struct EndpointOverrides {
    pub responses_path: Option<String>,
    pub chat_completions_path: Option<String>,
    pub messages_path: Option<String>,
}

/// Upstream behavior toggles
#[derive(Debug, Clone, Default)]
pub struct Quirks {
    pub no_instructions: bool,
    pub no_previous_response_id: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    pub reasoning_effort: Option<String>,
    pub max_instructions_chars: Option<usize>,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    /// Model string the upstream actually expects; defaults to `name`
    pub upstream_model: String,
    pub options: ModelOptions,
    pub quirks: Quirks,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub api_mode: ApiMode,
    pub owned_by: String,
    /// Normalized absolute base URLs, tried in order
    pub base_urls: Vec<String>,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub endpoints: EndpointOverrides,
    pub quirks: Quirks,
    pub models: Vec<ModelConfig>,
}

impl ProviderConfig {
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Resolve the upstream API key: inline value first, then the named env var
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }
}

/// Circuit breaker tuning (optional top-level config)
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown_secs: u64,
}

/// Parsed provider/model registry
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub providers: Vec<ProviderConfig>,
    pub breaker: Option<BreakerConfig>,
}

impl GatewayConfig {
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

/// Strip JSONC syntax (comments, trailing commas) while preserving newlines,
/// so parse errors downstream keep their line positions.
pub fn strip_jsonc(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Str,
        StrEscape,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    state = State::Str;
                    out.push(c);
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(c),
            },
            State::Str => {
                out.push(c);
                match c {
                    '\\' => state = State::StrEscape,
                    '"' => state = State::Code,
                    _ => {}
                }
            }
            State::StrEscape => {
                out.push(c);
                state = State::Str;
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                    out.push_str("  ");
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
        }
    }

    strip_trailing_commas(&out)
}

fn strip_trailing_commas(input: &str) -> String {
    let bytes: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_str = false;
    let mut escape = false;

    for (i, &c) in bytes.iter().enumerate() {
        if in_str {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_str = true;
                out.push(c);
            }
            ',' => {
                let next = bytes[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Normalize a base URL so it starts with an explicit scheme.
/// Returns None for strings that normalize to nothing usable.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // A lone scheme fragment is a typo, not a URL
    if matches!(trimmed, "http" | "https" | "http:" | "https:") {
        return None;
    }
    let normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    Some(normalized)
}

/// Parse the provider registry from a JSONC blob.
///
/// All failures produce a single human-readable message; no partial config
/// is ever returned.
pub fn parse_config(jsonc: &str) -> anyhow::Result<GatewayConfig> {
    if jsonc.trim().is_empty() {
        bail!("config is empty");
    }

    let stripped = strip_jsonc(jsonc);
    let root: Value =
        serde_json::from_str(&stripped).map_err(|e| anyhow!("config is not valid JSON: {}", e))?;

    let obj = root
        .as_object()
        .ok_or_else(|| anyhow!("config must be a JSON object"))?;

    if let Some(version) = obj.get("version") {
        if version.as_u64() != Some(1) {
            bail!("unsupported config version: {}", version);
        }
    }

    let providers_obj = obj
        .get("providers")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow!("config has no providers"))?;

    if providers_obj.is_empty() {
        bail!("config has no providers");
    }

    let mut providers = Vec::with_capacity(providers_obj.len());
    for (id, raw) in providers_obj {
        providers.push(parse_provider(id, raw)?);
    }

    let breaker = match (
        obj.get("breakerThreshold").and_then(|v| v.as_u64()),
        obj.get("breakerCooldownSecs").and_then(|v| v.as_u64()),
    ) {
        (Some(threshold), cooldown) => Some(BreakerConfig {
            threshold: threshold as u32,
            cooldown_secs: cooldown.unwrap_or(30),
        }),
        _ => None,
    };

    Ok(GatewayConfig { providers, breaker })
}

fn parse_provider(id: &str, raw: &Value) -> anyhow::Result<ProviderConfig> {
    if id.contains('.') {
        bail!("provider id '{}' must not contain '.'", id);
    }
    let raw = raw
        .as_object()
        .ok_or_else(|| anyhow!("provider '{}' must be an object", id))?;

    let mode_str = raw
        .get("apiMode")
        .or_else(|| raw.get("type"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("provider '{}' has no type", id))?;
    let api_mode = ApiMode::parse(mode_str)
        .ok_or_else(|| anyhow!("provider '{}' has unknown type '{}'", id, mode_str))?;

    let mut base_urls = Vec::new();
    if let Some(url) = raw.get("baseURL").and_then(|v| v.as_str()) {
        base_urls.extend(url.split(',').map(|s| s.to_string()));
    }
    if let Some(urls) = raw.get("baseURLs").and_then(|v| v.as_array()) {
        base_urls.extend(urls.iter().filter_map(|v| v.as_str()).map(String::from));
    }
    let base_urls: Vec<String> = base_urls
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|raw| {
            normalize_base_url(raw)
                .ok_or_else(|| anyhow!("provider '{}' has invalid baseURL '{}'", id, raw.trim()))
        })
        .collect::<anyhow::Result<_>>()?;
    if base_urls.is_empty() {
        bail!("provider '{}' has no baseURL", id);
    }
    for url in &base_urls {
        url::Url::parse(url)
            .map_err(|_| anyhow!("provider '{}' has invalid baseURL '{}'", id, url))?;
    }

    let api_key = raw
        .get("apiKey")
        .and_then(|v| v.as_str())
        .map(String::from);
    let api_key_env = raw
        .get("apiKeyEnv")
        .and_then(|v| v.as_str())
        .map(String::from);
    if api_key.as_deref().unwrap_or("").is_empty() && api_key_env.as_deref().unwrap_or("").is_empty()
    {
        bail!("provider '{}' has no apiKey or apiKeyEnv", id);
    }

    let owned_by = raw
        .get("ownedBy")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| api_mode.default_owned_by().to_string());

    let endpoints = raw
        .get("endpoints")
        .and_then(|v| v.as_object())
        .map(|e| EndpointOverrides {
            responses_path: e
                .get("responsesPath")
                .and_then(|v| v.as_str())
                .map(String::from),
            chat_completions_path: e
                .get("chatCompletionsPath")
                .and_then(|v| v.as_str())
                .map(String::from),
            messages_path: e
                .get("messagesPath")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
        .unwrap_or_default();

    let quirks = parse_quirks(raw.get("quirks"));

    let models_val = raw
        .get("models")
        .ok_or_else(|| anyhow!("provider '{}' has no models", id))?;
    let models = parse_models(id, models_val)?;
    if models.is_empty() {
        bail!("provider '{}' has no models", id);
    }

    Ok(ProviderConfig {
        id: id.to_string(),
        api_mode,
        owned_by,
        base_urls,
        api_key,
        api_key_env,
        endpoints,
        quirks,
        models,
    })
}

fn parse_quirks(value: Option<&Value>) -> Quirks {
    let obj = match value.and_then(|v| v.as_object()) {
        Some(o) => o,
        None => return Quirks::default(),
    };
    Quirks {
        no_instructions: obj
            .get("noInstructions")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        no_previous_response_id: obj
            .get("noPreviousResponseId")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

fn parse_models(provider_id: &str, value: &Value) -> anyhow::Result<Vec<ModelConfig>> {
    let mut models = Vec::new();
    match value {
        // { "model-name": { ... } } or { "model-name": "upstream-name" }
        Value::Object(map) => {
            for (name, raw) in map {
                models.push(parse_model(provider_id, name, raw)?);
            }
        }
        // [ "model-name", { "name": ..., ... } ]
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(name) => {
                        models.push(parse_model(provider_id, name, &Value::Null)?)
                    }
                    Value::Object(obj) => {
                        let name = obj.get("name").and_then(|v| v.as_str()).ok_or_else(|| {
                            anyhow!("provider '{}' has a model without a name", provider_id)
                        })?;
                        models.push(parse_model(provider_id, name, item)?);
                    }
                    _ => bail!("provider '{}' has an invalid model entry", provider_id),
                }
            }
        }
        _ => bail!("provider '{}' models must be an object or array", provider_id),
    }
    Ok(models)
}

fn parse_model(provider_id: &str, name: &str, raw: &Value) -> anyhow::Result<ModelConfig> {
    if name.is_empty() {
        bail!("provider '{}' has a model with an empty name", provider_id);
    }

    let (upstream_model, options, quirks) = match raw {
        Value::String(upstream) => (upstream.clone(), ModelOptions::default(), Quirks::default()),
        Value::Object(obj) => {
            let upstream = obj
                .get("upstreamModel")
                .and_then(|v| v.as_str())
                .unwrap_or(name)
                .to_string();
            let opts = obj
                .get("options")
                .and_then(|v| v.as_object())
                .map(|o| ModelOptions {
                    reasoning_effort: o
                        .get("reasoningEffort")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    max_instructions_chars: o
                        .get("maxInstructionsChars")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as usize),
                    max_tokens: o.get("maxTokens").and_then(|v| v.as_u64()),
                })
                .unwrap_or_default();
            (upstream, opts, parse_quirks(obj.get("quirks")))
        }
        _ => (name.to_string(), ModelOptions::default(), Quirks::default()),
    };

    Ok(ModelConfig {
        name: name.to_string(),
        upstream_model,
        options,
        quirks,
    })
}

/// Trimmer caps, overridable via environment
#[derive(Debug, Clone, Copy)]
pub struct TrimLimits {
    pub max_turns: usize,
    pub max_messages: usize,
    pub max_input_chars: usize,
}

impl Default for TrimLimits {
    fn default() -> Self {
        Self {
            max_turns: 40,
            max_messages: 200,
            max_input_chars: 300_000,
        }
    }
}

/// Runtime options read from the environment: WORKER_AUTH_KEY(S),
/// RSP4COPILOT_DEBUG, RSP4COPILOT_MAX_TURNS / MAX_MESSAGES / MAX_INPUT_CHARS,
/// RESP_REASONING_EFFORT, the GEMINI_* output-token defaults, and the
/// CLAUDE/GEMINI default model aliases.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub inbound_keys: Vec<String>,
    pub debug: bool,
    pub trim: TrimLimitsOpt,
    /// Default reasoning effort; `None` when disabled via off/false/0
    pub reasoning_effort: Option<String>,
    pub gemini_max_output_tokens: Option<u64>,
    pub claude_default_model: Option<String>,
    pub gemini_default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrimLimitsOpt {
    pub max_turns: Option<usize>,
    pub max_messages: Option<usize>,
    pub max_input_chars: Option<usize>,
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Self {
        let mut inbound_keys = Vec::new();
        if let Some(key) = get("WORKER_AUTH_KEY") {
            if !key.trim().is_empty() {
                inbound_keys.push(key.trim().to_string());
            }
        }
        if let Some(keys) = get("WORKER_AUTH_KEYS") {
            inbound_keys.extend(
                keys.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from),
            );
        }

        let reasoning_effort = get("RESP_REASONING_EFFORT").and_then(|v| {
            let v = v.trim().to_string();
            match v.to_ascii_lowercase().as_str() {
                "" | "off" | "false" | "0" => None,
                _ => Some(v),
            }
        });

        let gemini_max_output_tokens = ["GEMINI_DEFAULT_MAX_OUTPUT_TOKENS", "GEMINI_MAX_OUTPUT_TOKENS", "GEMINI_MAX_TOKENS"]
            .iter()
            .find_map(|name| get(name).and_then(|v| v.trim().parse().ok()));

        Self {
            inbound_keys,
            debug: get("RSP4COPILOT_DEBUG")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
            trim: TrimLimitsOpt {
                max_turns: get("RSP4COPILOT_MAX_TURNS").and_then(|v| v.trim().parse().ok()),
                max_messages: get("RSP4COPILOT_MAX_MESSAGES").and_then(|v| v.trim().parse().ok()),
                max_input_chars: get("RSP4COPILOT_MAX_INPUT_CHARS")
                    .and_then(|v| v.trim().parse().ok()),
            },
            reasoning_effort,
            gemini_max_output_tokens,
            claude_default_model: get("CLAUDE_DEFAULT_MODEL").filter(|v| !v.trim().is_empty()),
            gemini_default_model: get("GEMINI_DEFAULT_MODEL").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn trim_limits(&self) -> TrimLimits {
        let defaults = TrimLimits::default();
        TrimLimits {
            max_turns: self.trim.max_turns.unwrap_or(defaults.max_turns),
            max_messages: self.trim.max_messages.unwrap_or(defaults.max_messages),
            max_input_chars: self.trim.max_input_chars.unwrap_or(defaults.max_input_chars),
        }
    }
}
