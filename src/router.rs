use crate::{
    config::{GatewayConfig, ModelConfig, ProviderConfig},
    error::AppError,
};

/// A routing decision: which provider serves the request, and as which model
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub provider: &'a ProviderConfig,
    pub model: &'a ModelConfig,
}

impl Resolved<'_> {
    pub fn upstream_model(&self) -> &str {
        &self.model.upstream_model
    }
}

/// Map `(model_id, optional provider hint)` to a provider and model.
///
/// Order of decisions:
/// 1. reject empty ids and ids containing ':'
/// 2. try a `provider.model` prefix split at the FIRST '.'; fall through when
///    the prefix is not a provider (model names like `gemini-1.5-pro` contain
///    dots legitimately)
/// 3. apply the provider hint (id first, then owned_by)
/// 4. scan all providers; the match must be unique
pub fn resolve<'a>(
    config: &'a GatewayConfig,
    model_id: &str,
    provider_hint: Option<&str>,
) -> Result<Resolved<'a>, AppError> {
    if model_id.is_empty() {
        return Err(AppError::InvalidRequest("Missing model".to_string()));
    }
    if model_id.contains(':') {
        return Err(AppError::InvalidRequest(format!(
            "Invalid model id: {}",
            model_id
        )));
    }

    if let Some((prefix, rest)) = model_id.split_once('.') {
        if let Some(provider) = match_provider(config, prefix) {
            let model = provider.model(rest).ok_or_else(|| {
                AppError::InvalidRequest(format!("Unknown model: {}", model_id))
            })?;
            return Ok(Resolved { provider, model });
        }
        // not a provider prefix - treat the whole id as a model name
    }

    if let Some(hint) = provider_hint {
        let provider = match_provider(config, hint).ok_or_else(|| {
            AppError::InvalidRequest(format!("Unknown provider: {}", hint))
        })?;
        let model = provider
            .model(model_id)
            .ok_or_else(|| AppError::InvalidRequest(format!("Unknown model: {}", model_id)))?;
        return Ok(Resolved { provider, model });
    }

    let mut matches = config
        .providers
        .iter()
        .filter_map(|p| p.model(model_id).map(|m| Resolved { provider: p, model: m }));

    match (matches.next(), matches.next()) {
        (Some(found), None) => Ok(found),
        (Some(_), Some(_)) => Err(AppError::InvalidRequest(format!(
            "Ambiguous model: {}",
            model_id
        ))),
        (None, _) => Err(AppError::InvalidRequest(format!(
            "Unknown model: {}",
            model_id
        ))),
    }
}

/// Match a provider by exact id, else by unique case-insensitive owned_by.
/// Ambiguous owned_by matches resolve to nothing.
fn match_provider<'a>(config: &'a GatewayConfig, name: &str) -> Option<&'a ProviderConfig> {
    if let Some(p) = config.provider(name) {
        return Some(p);
    }
    let mut owned = config
        .providers
        .iter()
        .filter(|p| p.owned_by.eq_ignore_ascii_case(name));
    match (owned.next(), owned.next()) {
        (Some(p), None) => Some(p),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn two_provider_config() -> GatewayConfig {
        parse_config(
            r#"{
            "providers": {
                "p1": {
                    "type": "openai-responses",
                    "baseURL": "https://up1.example.com",
                    "apiKey": "k1",
                    "models": {"echo": {"upstreamModel": "echo-upstream"}, "shared": {}}
                },
                "g": {
                    "type": "gemini",
                    "ownedBy": "google",
                    "baseURL": "https://up2.example.com",
                    "apiKey": "k2",
                    "models": {"gemini-1.5-pro": {}, "shared": {}}
                }
            }
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_unique_model_resolves() {
        let cfg = two_provider_config();
        let resolved = resolve(&cfg, "echo", None).unwrap();
        assert_eq!(resolved.provider.id, "p1");
        assert_eq!(resolved.upstream_model(), "echo-upstream");
    }

    #[test]
    fn test_dotted_model_without_provider_prefix() {
        // "gemini-1.5-pro" splits into prefix "gemini-1", which is no
        // provider - the full name must still resolve
        let cfg = two_provider_config();
        let resolved = resolve(&cfg, "gemini-1.5-pro", None).unwrap();
        assert_eq!(resolved.provider.id, "g");
    }

    #[test]
    fn test_provider_prefix() {
        let cfg = two_provider_config();
        let resolved = resolve(&cfg, "p1.shared", None).unwrap();
        assert_eq!(resolved.provider.id, "p1");

        // owned_by prefix, case-insensitive
        let resolved = resolve(&cfg, "Google.shared", None).unwrap();
        assert_eq!(resolved.provider.id, "g");
    }

    #[test]
    fn test_prefix_with_unknown_model_fails() {
        let cfg = two_provider_config();
        let err = resolve(&cfg, "p1.nope", None).unwrap_err();
        assert!(err.to_string().contains("Unknown model"));
    }

    #[test]
    fn test_ambiguous_model() {
        let cfg = two_provider_config();
        let err = resolve(&cfg, "shared", None).unwrap_err();
        assert_eq!(err.to_string(), "Ambiguous model: shared");
    }

    #[test]
    fn test_hint_disambiguates() {
        let cfg = two_provider_config();
        let resolved = resolve(&cfg, "shared", Some("g")).unwrap();
        assert_eq!(resolved.provider.id, "g");
        let resolved = resolve(&cfg, "shared", Some("google")).unwrap();
        assert_eq!(resolved.provider.id, "g");
    }

    #[test]
    fn test_rejects_empty_and_colon() {
        let cfg = two_provider_config();
        assert!(resolve(&cfg, "", None).is_err());
        assert!(resolve(&cfg, "a:b", None).is_err());
    }

    #[test]
    fn test_unknown_model() {
        let cfg = two_provider_config();
        let err = resolve(&cfg, "missing", None).unwrap_err();
        assert_eq!(err.to_string(), "Unknown model: missing");
    }
}
