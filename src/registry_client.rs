//! A thin client trait over the external prompt registry, mirroring the
//! `Driver` trait pattern in `drivers/mod.rs`: one trait, one production
//! implementation backed by `reqwest`, and test doubles that don't touch
//! the network.

use std::sync::Arc;

use reqwest::Client;

use crate::{model::PromptEntry, prelude::*};

/// Fetches a single named prompt from wherever prompts are stored.
#[async_trait]
pub trait PromptRegistryClient: Send + Sync {
    /// Fetch the prompt named `name` for `rule_id`/`mls_id`, optionally
    /// pinned to a specific historical `version` rather than the latest.
    /// Returns `Ok(None)` (not an error) when the registry has no such
    /// prompt.
    async fn fetch_prompt(
        &self,
        rule_id: &str,
        mls_id: &str,
        name: &str,
        version: Option<i64>,
    ) -> Result<Option<PromptEntry>>;
}

/// Talks to an HTTP prompt registry that serves `GET {base_url}/prompts/{name}`.
pub struct HttpPromptRegistryClient {
    client: Client,
    base_url: String,
}

impl HttpPromptRegistryClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

/// The registry's own response shape: `get_prompt(name, version?)` returns
/// `{prompt, config, version}` or a not-found error (§6's registry
/// contract). We only consume `prompt`; `config`/`version` are accepted but
/// not yet mapped onto [`crate::model::LlmConfig`].
#[derive(Deserialize)]
struct RegistryPromptResponse {
    prompt: String,
}

#[async_trait]
impl PromptRegistryClient for HttpPromptRegistryClient {
    #[instrument(skip(self), fields(rule_id, mls_id, name))]
    async fn fetch_prompt(
        &self,
        rule_id: &str,
        mls_id: &str,
        name: &str,
        version: Option<i64>,
    ) -> Result<Option<PromptEntry>> {
        let url = match version {
            Some(version) => format!("{}/prompts/{name}?version={version}", self.base_url),
            None => format!("{}/prompts/{name}", self.base_url),
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach prompt registry at {url}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("prompt registry returned an error for {url}"))?;

        let body: RegistryPromptResponse = response
            .json()
            .await
            .with_context(|| format!("prompt registry response for {url} was not valid JSON"))?;

        Ok(Some(PromptEntry {
            rule_id: rule_id.to_string(),
            mls_id: mls_id.to_string(),
            template: body.prompt,
            llm_config: Default::default(),
        }))
    }
}

/// An in-memory registry for tests and local development, keyed by the
/// fully-qualified prompt name (e.g. `FH1_violation`).
pub struct StaticPromptRegistryClient {
    prompts: std::collections::HashMap<String, String>,
}

impl StaticPromptRegistryClient {
    pub fn new(prompts: std::collections::HashMap<String, String>) -> Self {
        Self { prompts }
    }

    /// Wrap this client in an `Arc<dyn PromptRegistryClient>` for injection
    /// into [`crate::prompt_resolver::PromptResolver`].
    pub fn arc(self) -> Arc<dyn PromptRegistryClient> {
        Arc::new(self)
    }
}

#[async_trait]
impl PromptRegistryClient for StaticPromptRegistryClient {
    async fn fetch_prompt(
        &self,
        rule_id: &str,
        mls_id: &str,
        name: &str,
        _version: Option<i64>,
    ) -> Result<Option<PromptEntry>> {
        Ok(self.prompts.get(name).map(|template| PromptEntry {
            rule_id: rule_id.to_string(),
            mls_id: mls_id.to_string(),
            template: template.clone(),
            llm_config: Default::default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_client_returns_none_for_unknown_name() {
        let client = StaticPromptRegistryClient::new(Default::default());
        let result = client.fetch_prompt("fh1", "default", "FH1_violation", None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_static_client_returns_known_prompt() {
        let mut prompts = std::collections::HashMap::new();
        prompts.insert("FH1_violation".to_string(), "Check {{public_remarks}}".to_string());
        let client = StaticPromptRegistryClient::new(prompts);
        let result = client
            .fetch_prompt("fh1", "default", "FH1_violation", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.template, "Check {{public_remarks}}");
    }
}
