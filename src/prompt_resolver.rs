//! Component D: resolving a rule+tenant pair to a rendered prompt, with a
//! TTL cache and a negative-sentinel entry to avoid hammering the registry
//! for prompts that don't exist.
//!
//! Naming helpers (`custom_prompt_name`, `default_prompt_name`) are ported
//! verbatim from `original_source/app/core/prompt_cache.py`'s
//! `PromptManager`. The cache-with-TTL-and-negative-sentinel shape itself
//! is this spec's explicit choice (see `SPEC_FULL.md`'s Open Questions):
//! the original's `PromptManager` has no TTL or negative caching, so this
//! component has no 1:1 original counterpart beyond its naming scheme.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

use crate::{model::PromptEntry, prelude::*, registry_client::PromptRegistryClient};

/// A cache slot: either a resolved prompt, or a sentinel recording that a
/// lookup recently came back empty (so we don't retry it immediately).
#[derive(Clone)]
enum Slot {
    Found(Arc<PromptEntry>),
    NegativeSentinel,
}

struct CacheEntry {
    slot: Slot,
    inserted_at: Instant,
}

/// Resolves `(rule_id, mls_id)` pairs to prompts, with custom-then-default
/// fallback and an in-memory TTL cache in front of the registry client.
pub struct PromptResolver {
    client: Arc<dyn PromptRegistryClient>,
    ttl: Duration,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
}

/// The constant tenant id meaning "no custom override, use the shared
/// default prompt".
pub const DEFAULT_MLS_ID: &str = "default";

impl PromptResolver {
    pub fn new(client: Arc<dyn PromptRegistryClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a prompt for `rule_id`, preferring an MLS-specific
    /// customization over the shared default, exactly as the original
    /// `PromptManager._load_prompt` does.
    ///
    /// When `version` is `Some`, fetches that specific historical version
    /// directly from the registry rather than the latest — the
    /// prompt-validation variant endpoint's knob. Versioned lookups bypass
    /// the TTL cache and the custom-then-default fallback, since they're a
    /// one-off regression check, not a live-traffic resolution.
    pub async fn resolve(
        &self,
        rule_id: &str,
        mls_id: &str,
        version: Option<i64>,
    ) -> Result<Option<Arc<PromptEntry>>> {
        if let Some(version) = version {
            return self.resolve_versioned(rule_id, mls_id, version).await;
        }

        let is_default_request = mls_id == DEFAULT_MLS_ID;
        if !is_default_request {
            if let Some(found) = self.resolve_one(rule_id, mls_id, true).await? {
                return Ok(Some(found));
            }
        }
        self.resolve_one(rule_id, DEFAULT_MLS_ID, false).await
    }

    async fn resolve_versioned(
        &self,
        rule_id: &str,
        mls_id: &str,
        version: i64,
    ) -> Result<Option<Arc<PromptEntry>>> {
        let is_default_request = mls_id == DEFAULT_MLS_ID;
        let name = if is_default_request {
            default_prompt_name(rule_id)
        } else {
            custom_prompt_name(rule_id, mls_id)
        };
        let fetched = self
            .client
            .fetch_prompt(rule_id, mls_id, &name, Some(version))
            .await?;
        Ok(fetched.map(Arc::new))
    }

    async fn resolve_one(
        &self,
        rule_id: &str,
        mls_id: &str,
        custom: bool,
    ) -> Result<Option<Arc<PromptEntry>>> {
        let key = (rule_id.to_string(), mls_id.to_string());

        if let Some(entry) = self.cache.read().await.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(match &entry.slot {
                    Slot::Found(prompt) => Some(prompt.clone()),
                    Slot::NegativeSentinel => None,
                });
            }
        }

        let name = if custom {
            custom_prompt_name(rule_id, mls_id)
        } else {
            default_prompt_name(rule_id)
        };
        let fetched = self.client.fetch_prompt(rule_id, mls_id, &name, None).await?;

        let slot = match fetched {
            Some(prompt) => Slot::Found(Arc::new(prompt)),
            None => Slot::NegativeSentinel,
        };
        let result = match &slot {
            Slot::Found(prompt) => Some(prompt.clone()),
            Slot::NegativeSentinel => None,
        };
        self.cache.write().await.insert(
            key,
            CacheEntry {
                slot,
                inserted_at: Instant::now(),
            },
        );
        Ok(result)
    }

    /// Drop one cached `(rule_id, mls_id)` pair, both specific entries
    /// matching `rule_id`/`mls_id` and (if `mls_id` is `None`) the rule's
    /// default entry.
    pub async fn refresh(&self, rule_id: Option<&str>, mls_id: Option<&str>) {
        let mut cache = self.cache.write().await;
        cache.retain(|(cached_rule, cached_mls), _| {
            let rule_matches = rule_id.is_none_or(|r| r == cached_rule);
            let mls_matches = mls_id.is_none_or(|m| m == cached_mls);
            !(rule_matches && mls_matches)
        });
    }

    /// Drop everything cached.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    /// Number of entries currently cached.
    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Snapshot for `GET /cache/stats`: per-rule breakdown of which
    /// tenants resolved to a real prompt (`loaded`) versus fell through to
    /// the default (`uses_default`, backed by a negative sentinel).
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let mut total_sentinel_entries = 0;
        let mut cache_by_rule: BTreeMap<String, RuleCacheStats> = BTreeMap::new();
        for ((rule_id, mls_id), entry) in cache.iter() {
            let per_rule = cache_by_rule.entry(rule_id.clone()).or_default();
            match &entry.slot {
                Slot::Found(_) => per_rule.loaded.push(mls_id.clone()),
                Slot::NegativeSentinel => {
                    total_sentinel_entries += 1;
                    per_rule.uses_default.push(mls_id.clone());
                }
            }
        }
        CacheStats {
            total_prompts_cached: cache.len() - total_sentinel_entries,
            total_sentinel_entries,
            cache: cache_by_rule,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RuleCacheStats {
    pub loaded: Vec<String>,
    pub uses_default: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub total_prompts_cached: usize,
    pub total_sentinel_entries: usize,
    pub cache: BTreeMap<String, RuleCacheStats>,
}

/// `{RULE_ID}_{MLS_ID}_violation`, uppercased rule id — the tenant-specific
/// prompt name.
pub fn custom_prompt_name(rule_id: &str, mls_id: &str) -> String {
    format!("{}_{}_violation", rule_id.to_uppercase(), mls_id)
}

/// `{RULE_ID}_violation` — the shared default prompt name.
pub fn default_prompt_name(rule_id: &str) -> String {
    format!("{}_violation", rule_id.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        response: Option<PromptEntry>,
    }

    #[async_trait]
    impl PromptRegistryClient for CountingClient {
        async fn fetch_prompt(
            &self,
            _rule_id: &str,
            _mls_id: &str,
            _name: &str,
            _version: Option<i64>,
        ) -> Result<Option<PromptEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn prompt(rule_id: &str, mls_id: &str) -> PromptEntry {
        PromptEntry {
            rule_id: rule_id.to_string(),
            mls_id: mls_id.to_string(),
            template: "Check: {{public_remarks}}".to_string(),
            llm_config: Default::default(),
        }
    }

    #[test]
    fn test_naming_helpers() {
        assert_eq!(custom_prompt_name("fh1", "board123"), "FH1_board123_violation");
        assert_eq!(default_prompt_name("fh1"), "FH1_violation");
    }

    #[tokio::test]
    async fn test_resolve_default_when_no_custom_requested() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response: Some(prompt("fh1", "default")),
        });
        let resolver = PromptResolver::new(client.clone(), Duration::from_secs(60));
        let result = resolver.resolve("fh1", "default", None).await.unwrap();
        assert!(result.is_some());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_default_when_custom_missing() {
        struct FallbackClient {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl PromptRegistryClient for FallbackClient {
            async fn fetch_prompt(
                &self,
                rule_id: &str,
                mls_id: &str,
                _name: &str,
                _version: Option<i64>,
            ) -> Result<Option<PromptEntry>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if mls_id == "default" {
                    Ok(Some(prompt(rule_id, "default")))
                } else {
                    Ok(None)
                }
            }
        }
        let client = Arc::new(FallbackClient {
            calls: AtomicUsize::new(0),
        });
        let resolver = PromptResolver::new(client.clone(), Duration::from_secs(60));
        let result = resolver.resolve("fh1", "board123", None).await.unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().mls_id, "default");
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_hits_do_not_call_client_again() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response: Some(prompt("fh1", "default")),
        });
        let resolver = PromptResolver::new(client.clone(), Duration::from_secs(60));
        resolver.resolve("fh1", "default", None).await.unwrap();
        resolver.resolve("fh1", "default", None).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_sentinel_avoids_repeated_lookups() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response: None,
        });
        let resolver = PromptResolver::new(client.clone(), Duration::from_secs(60));
        let first = resolver.resolve("missing", "default", None).await.unwrap();
        let second = resolver.resolve("missing", "default", None).await.unwrap();
        assert!(first.is_none());
        assert!(second.is_none());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_clears_matching_entries() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response: Some(prompt("fh1", "default")),
        });
        let resolver = PromptResolver::new(client.clone(), Duration::from_secs(60));
        resolver.resolve("fh1", "default", None).await.unwrap();
        assert_eq!(resolver.cache_size().await, 1);
        resolver.refresh(Some("fh1"), None).await;
        assert_eq!(resolver.cache_size().await, 0);
    }

    #[tokio::test]
    async fn test_stats_reports_loaded_and_uses_default_per_rule() {
        struct FallbackClient {}
        #[async_trait]
        impl PromptRegistryClient for FallbackClient {
            async fn fetch_prompt(
                &self,
                rule_id: &str,
                mls_id: &str,
                _name: &str,
                _version: Option<i64>,
            ) -> Result<Option<PromptEntry>> {
                if mls_id == "default" {
                    Ok(Some(prompt(rule_id, "default")))
                } else {
                    Ok(None)
                }
            }
        }
        let resolver = PromptResolver::new(Arc::new(FallbackClient {}), Duration::from_secs(60));
        resolver.resolve("FAIR", "T2", None).await.unwrap();

        let stats = resolver.stats().await;
        assert_eq!(stats.total_prompts_cached, 1);
        assert_eq!(stats.total_sentinel_entries, 1);
        let fair = &stats.cache["FAIR"];
        assert_eq!(fair.loaded, vec!["default".to_string()]);
        assert_eq!(fair.uses_default, vec!["T2".to_string()]);
    }

    #[tokio::test]
    async fn test_ttl_expiry_triggers_refetch() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            response: Some(prompt("fh1", "default")),
        });
        let resolver = PromptResolver::new(client.clone(), Duration::from_millis(1));
        resolver.resolve("fh1", "default", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.resolve("fh1", "default", None).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }
}
