use crate::{
    config::GatewayConfig,
    handlers::common::AppState,
    models::{gemini, openai},
};
use axum::{extract::State, response::IntoResponse, Json};
use std::collections::HashMap;

/// Deduplicated model ids: the bare model name when it is unique across
/// providers, `providerId.modelName` otherwise. Sorted lexicographically.
fn listed_ids(config: &GatewayConfig) -> Vec<(String, String)> {
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for provider in &config.providers {
        for model in &provider.models {
            *name_counts.entry(model.name.as_str()).or_default() += 1;
        }
    }

    let mut ids: Vec<(String, String)> = config
        .providers
        .iter()
        .flat_map(|provider| {
            let name_counts = &name_counts;
            provider.models.iter().map(move |model| {
                let id = if name_counts[model.name.as_str()] == 1 {
                    model.name.clone()
                } else {
                    format!("{}.{}", provider.id, model.name)
                };
                (id, provider.owned_by.clone())
            })
        })
        .collect();
    ids.sort();
    ids
}

/// GET /v1/models (and aliases) - OpenAI format
pub async fn openai_list(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.load();
    let created = crate::converters::unix_now();
    let data = listed_ids(&config)
        .into_iter()
        .map(|(id, owned_by)| openai::ModelEntry {
            id,
            object: "model".to_string(),
            created,
            owned_by,
        })
        .collect();
    Json(openai::ModelList {
        object: "list".to_string(),
        data,
    })
}

/// GET /gemini/v1beta/models - Gemini format
pub async fn gemini_list(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.load();
    let models = listed_ids(&config)
        .into_iter()
        .map(|(id, _)| gemini::ModelEntry {
            name: format!("models/{}", id),
            display_name: None,
            supported_generation_methods: vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
            ],
        })
        .collect();
    Json(gemini::ModelList { models })
}
