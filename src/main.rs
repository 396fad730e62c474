use std::{net::SocketAddr, str::FromStr, sync::Arc};

use clap::Parser;
use compliance_rule_engine::{AppState, config::Config, http::build_router, prelude::*};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

/// Run the batch compliance-checking service.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - LLM_API_KEY or OPENAI_API_KEY: credentials for the LLM backend.
  - LLM_API_BASE (optional): override the LLM backend's base URL.
  - PROMPT_REGISTRY_BASE: base URL of the remote prompt registry.

  See Config (config.rs) for the full list of tunable knobs, all of
  which may also be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Address to bind the HTTP server to.
    #[clap(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let config = Config::from_env();
    config
        .check_required_secrets()
        .context("startup configuration is incomplete")?;

    let registry_base_url =
        std::env::var("PROMPT_REGISTRY_BASE").unwrap_or_else(|_| "http://localhost:9090".to_string());
    let llm_api_base = std::env::var("LLM_API_BASE")
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

    let state = Arc::new(AppState::new(config, registry_base_url, llm_api_base)?);
    let app = build_router(state);

    let addr: SocketAddr = opts.bind.parse().context("invalid --bind address")?;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with an error")?;

    Ok(())
}

/// Wait for a Ctrl-C (or SIGTERM on Unix) so in-flight requests can drain
/// before the process exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
