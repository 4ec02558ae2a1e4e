pub mod auth;
pub mod config;
pub mod converters;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod image_utils;
pub mod models;
pub mod router;
pub mod server;
pub mod session;
pub mod streaming;
pub mod trimmer;
pub mod urls;
pub mod variants;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: this can only be called once per process. `debug` raises the
/// default filter when RUST_LOG is not set.
pub fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
