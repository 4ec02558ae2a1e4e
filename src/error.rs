use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application error types
///
/// Variants are grouped by observable behavior: how they map onto the
/// `{error:{message, type, code}}` envelope and which HTTP status they carry.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed client request (missing model, empty body, bad JSON)
    #[error("{0}")]
    InvalidRequest(String),
    /// Missing credentials entirely
    #[error("Missing API key")]
    MissingAuth,
    /// Credentials present but not in the inbound key set
    #[error("{0}")]
    Unauthorized(String),
    /// Misconfiguration (no config, no bearer key, missing upstream key)
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Operation the resolved provider cannot serve
    #[error("{0}")]
    Unsupported(String),
    /// Route or resource that does not exist
    #[error("{0}")]
    NotFound(String),
    /// Upstream failure after exhausting variants/URLs
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: StatusCode, message: String },
    /// A provider base URL points back at this gateway
    #[error("infinite routing loop: provider '{0}' targets this gateway")]
    RoutingLoop(String),
    /// Anything unexpected
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::Unsupported(_) => StatusCode::BAD_REQUEST,
            Self::MissingAuth | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream { status, .. } => *status,
            Self::ConfigError(_) | Self::RoutingLoop(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::Unsupported(_) => "invalid_request_error",
            Self::MissingAuth | Self::Unauthorized(_) => "authentication_error",
            Self::NotFound(_) => "not_found_error",
            _ => "server_error",
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::Unsupported(_) => "bad_request",
            Self::MissingAuth | Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Upstream { status, .. } if *status == StatusCode::BAD_GATEWAY => "bad_gateway",
            Self::Upstream { status, .. } if status.is_client_error() => "invalid_request_error",
            _ => "server_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.error_code(),
            }
        }));

        let mut response = (self.status(), body).into_response();
        if matches!(self, Self::MissingAuth) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, "Bearer".parse().unwrap());
        }
        response
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
