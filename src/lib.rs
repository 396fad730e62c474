//! Batch compliance-checking service: evaluate real-estate listing
//! records against LLM-backed rules, at scale.

use std::sync::Arc;

use reqwest::Client;

use crate::{
    config::Config, llm_client::LlmBackend, prompt_resolver::PromptResolver,
    rate_limiter::RateLimiter, registry_client::PromptRegistryClient,
};

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod llm_client;
pub mod model;
pub mod parser;
pub mod prelude;
pub mod prompt_resolver;
pub mod rate_limiter;
pub mod registry_client;
pub mod retry;
pub mod rule_executor;
pub mod scheduler;
pub mod tracing_ctx;
pub mod wire;

/// Process-wide shared state, handed to every request handler.
pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn LlmBackend>,
    pub rate_limiter: RateLimiter,
    pub prompt_resolver: PromptResolver,
}

impl AppState {
    /// Build the production [`AppState`]: a real `reqwest`-backed LLM
    /// client and prompt registry client, sharing one HTTP connection
    /// pool sized from `config`.
    pub fn new(config: Config, registry_base_url: String, llm_api_base: String) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .pool_max_idle_per_host(config.max_keepalive_connections)
            .timeout(config.api_timeout)
            .build()?;

        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .unwrap_or_default();

        let backend: Arc<dyn LlmBackend> = Arc::new(crate::llm_client::HttpLlmBackend::new(
            http_client.clone(),
            llm_api_base,
            api_key,
            config.max_connections,
        ));
        let registry_client: Arc<dyn PromptRegistryClient> = Arc::new(
            crate::registry_client::HttpPromptRegistryClient::new(http_client, registry_base_url),
        );

        let rate_limiter = RateLimiter::new(&config);
        let prompt_resolver = PromptResolver::new(registry_client, config.prompt_cache_ttl);

        Ok(Self {
            config,
            backend,
            rate_limiter,
            prompt_resolver,
        })
    }
}
