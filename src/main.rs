use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use llm_relay::{
    config::{parse_config, RuntimeOptions},
    dispatch::Dispatcher,
    handlers::common::AppState,
    server,
    session::SessionCache,
};
use std::sync::Arc;

/// Multi-protocol LLM API gateway
#[derive(Parser, Debug)]
#[command(name = "llm-relay", version, about)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8787, env = "PORT")]
    port: u16,

    /// Read the provider registry from this file when RSP4COPILOT_CONFIG is
    /// not set
    #[arg(long)]
    config_file: Option<std::path::PathBuf>,

    /// Verbose logging (same as RSP4COPILOT_DEBUG=1)
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = RuntimeOptions::from_env();
    llm_relay::init_tracing(cli.debug || options.debug);

    let raw_config = match std::env::var("RSP4COPILOT_CONFIG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => match &cli.config_file {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?,
            None => anyhow::bail!(
                "no provider config: set RSP4COPILOT_CONFIG or pass --config-file"
            ),
        },
    };
    let config = parse_config(&raw_config).context("parsing provider config")?;
    tracing::info!(
        providers = config.providers.len(),
        "Loaded provider registry"
    );

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    let breaker = config.breaker;
    let state = AppState {
        config: Arc::new(ArcSwap::from_pointee(config)),
        options: Arc::new(options),
        dispatcher: Arc::new(Dispatcher::new(client, breaker)),
        session_cache: SessionCache::in_memory(),
    };

    server::serve(state, &cli.host, cli.port).await
}
