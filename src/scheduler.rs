//! Component F: dispatches a batch of records across rules with
//! dynamically-adjusted concurrency.
//!
//! A direct port of `original_source/app/api/routes.py`'s
//! `process_all_records`: records are split into fixed-size chunks, and
//! before each chunk we re-check `RateLimiter::get_safe_concurrency` and
//! swap in a freshly-sized semaphore if it changed. Tasks already in
//! flight from an earlier chunk keep whatever semaphore they acquired a
//! permit from — we only ever *replace* the semaphore reference used by
//! chunks that haven't started yet, we never mutate permits on one in
//! use. This mirrors the original's behavior (including its acknowledged
//! quirk that in-flight tasks are unaffected by a mid-run resize) rather
//! than "fixing" it into something the original never actually did.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::{
    model::{Record, RecordResult, RuleFinding, RuleSelector},
    prelude::*,
    prompt_resolver::PromptResolver,
    rate_limiter::RateLimiter,
    rule_executor::RuleExecutor,
    llm_client::LlmBackend,
    config::Config,
};

/// Records are dispatched in chunks of this size, re-checking concurrency
/// between chunks.
const CHUNK_SIZE: usize = 100;

/// Runs a whole batch of records against a shared set of rule selectors.
pub struct Scheduler<'a> {
    pub backend: &'a dyn LlmBackend,
    pub rate_limiter: &'a RateLimiter,
    pub prompt_resolver: &'a PromptResolver,
    pub config: &'a Config,
    /// When set, resolve this specific historical prompt version instead
    /// of the latest — the prompt-validation variant endpoint's knob.
    pub prompt_version: Option<i64>,
}

/// Merge selectors sharing a `(rule_id, mls_id)` key, union-ing their
/// columns, per the job invariant in the data model.
pub fn merge_selectors(selectors: Vec<RuleSelector>) -> Vec<RuleSelector> {
    let mut merged: Vec<RuleSelector> = Vec::new();
    for selector in selectors {
        if let Some(existing) = merged
            .iter_mut()
            .find(|s| s.rule_id == selector.rule_id && s.mls_id == selector.mls_id)
        {
            for column in selector.columns {
                if !existing.columns.contains(&column) {
                    existing.columns.push(column);
                }
            }
        } else {
            merged.push(selector);
        }
    }
    merged
}

/// Validate job-level invariants that must hold before any LLM call is
/// made. Returns every violation found (not just the first), so a caller
/// can report all of them in a single 400 response.
pub fn validate_job(records: &[Record], rules: &[RuleSelector]) -> Vec<String> {
    let mut problems = Vec::new();

    if records.is_empty() {
        problems.push("record list must not be empty".to_string());
    }
    for rule in rules {
        if rule.mls_id.is_empty() {
            problems.push(format!("selector for rule {} has an empty mls_id", rule.rule_id));
        }
        if rule.columns.is_empty() {
            problems.push(format!("selector for rule {} names no columns", rule.rule_id));
        }
    }
    for record in records {
        let applicable: Vec<&RuleSelector> =
            rules.iter().filter(|r| r.mls_id == record.mls_id).collect();
        if applicable.is_empty() {
            problems.push(format!(
                "record {} (mls {}) is not claimed by any selector",
                record.listing_id, record.mls_id
            ));
            continue;
        }
        for rule in applicable {
            for column in &rule.columns {
                if record.fields.get(column.api_name()).is_none() {
                    problems.push(format!(
                        "record {} is missing column {:?} required by rule {}",
                        record.listing_id, column, rule.rule_id
                    ));
                }
            }
        }
    }
    problems
}

impl<'a> Scheduler<'a> {
    /// Batch-resolve every `(rule_id, mls_id)` pair named by `rules`,
    /// returning the pairs that had no prompt at all (neither custom nor
    /// default) — a fatal, job-level condition.
    pub async fn prefetch_prompts(&self, rules: &[RuleSelector]) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for rule in rules {
            let resolved = self
                .prompt_resolver
                .resolve(&rule.rule_id, &rule.mls_id, self.prompt_version)
                .await
                .unwrap_or(None);
            if resolved.is_none() {
                missing.push((rule.rule_id.clone(), rule.mls_id.clone()));
            }
        }
        missing
    }

    /// Process every record in `records` against every selector in `rules`,
    /// returning one [`RecordResult`] per record in the original order.
    #[instrument(skip(self, records, rules))]
    pub async fn dispatch(
        &self,
        records: &[Record],
        rules: &[RuleSelector],
    ) -> Vec<RecordResult> {
        let initial_concurrency = self.rate_limiter.get_safe_concurrency().await;
        info!(initial_concurrency, "starting batch dispatch");
        let mut semaphore = Arc::new(Semaphore::new(initial_concurrency));

        let mut results = Vec::with_capacity(records.len());
        let total_chunks = records.len().div_ceil(CHUNK_SIZE).max(1);

        for (chunk_index, chunk) in records.chunks(CHUNK_SIZE).enumerate() {
            let new_concurrency = self.rate_limiter.get_safe_concurrency().await;
            if new_concurrency != semaphore.available_permits() {
                info!(
                    chunk = chunk_index + 1,
                    total_chunks,
                    from = semaphore.available_permits(),
                    to = new_concurrency,
                    "adjusting concurrency for upcoming chunk"
                );
                semaphore = Arc::new(Semaphore::new(new_concurrency));
            }

            let futures = chunk
                .iter()
                .map(|record| self.process_record(record, rules, semaphore.clone()));
            results.extend(join_all(futures).await);

            info!(
                chunk = chunk_index + 1,
                total_chunks,
                processed = results.len(),
                total = records.len(),
                "chunk complete"
            );
        }

        results
    }

    async fn process_record(
        &self,
        record: &Record,
        rules: &[RuleSelector],
        semaphore: Arc<Semaphore>,
    ) -> RecordResult {
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let started_at = std::time::Instant::now();
        let mut findings = Vec::new();
        let mut rule_errors = std::collections::BTreeMap::new();
        let mut evaluated_rule_ids = Vec::new();
        let mut total_tokens = 0u32;

        let applicable: Vec<&RuleSelector> =
            rules.iter().filter(|rule| rule.mls_id == record.mls_id).collect();

        let rule_futures = applicable.iter().map(|rule| self.run_rule(record, rule));
        for (rule, outcome) in applicable.iter().zip(join_all(rule_futures).await) {
            match outcome {
                Ok((rule_findings, tokens)) => {
                    findings.extend(rule_findings);
                    total_tokens += tokens;
                    evaluated_rule_ids.push(rule.rule_id.clone());
                }
                Err(err) => {
                    rule_errors.insert(rule.rule_id.clone(), err.to_string());
                }
            }
        }

        RecordResult {
            listing_id: record.listing_id.clone(),
            mls_id: record.mls_id.clone(),
            findings,
            rule_errors,
            evaluated_rule_ids,
            total_tokens,
            latency_seconds: started_at.elapsed().as_secs_f64(),
        }
    }

    async fn run_rule(
        &self,
        record: &Record,
        rule: &RuleSelector,
    ) -> Result<(Vec<RuleFinding>, u32)> {
        let prompt = self
            .prompt_resolver
            .resolve(&rule.rule_id, &record.mls_id, self.prompt_version)
            .await?
            .ok_or_else(|| anyhow!("no prompt found for rule {}", rule.rule_id))?;

        let executor = RuleExecutor {
            backend: self.backend,
            rate_limiter: self.rate_limiter,
            config: self.config,
        };
        executor.execute_rule(&prompt, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        llm_client::EchoLlmBackend,
        registry_client::StaticPromptRegistryClient,
    };
    use std::{collections::BTreeMap, time::Duration};

    fn test_config() -> Config {
        Config {
            max_retries: 0,
            default_concurrency: 4,
            ..Config::default()
        }
    }

    fn test_record(id: &str) -> Record {
        let mut fields = BTreeMap::new();
        fields.insert("Remarks".to_string(), "clean listing text".to_string());
        Record {
            listing_id: id.to_string(),
            mls_id: "default".to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn test_dispatch_processes_every_record() {
        let config = test_config();
        let backend = EchoLlmBackend::with_tokens(r#"{"result": {}}"#, 1);
        let rate_limiter = RateLimiter::new(&config);
        let mut prompts = std::collections::HashMap::new();
        prompts.insert("FH1_violation".to_string(), "Check: {{public_remarks}}".to_string());
        let resolver_client = StaticPromptRegistryClient::new(prompts).arc();
        let resolver = PromptResolver::new(resolver_client, Duration::from_secs(60));

        let scheduler = Scheduler {
            backend: &backend,
            rate_limiter: &rate_limiter,
            prompt_resolver: &resolver,
            config: &config,
            prompt_version: None,
        };

        let records = vec![test_record("L1"), test_record("L2"), test_record("L3")];
        let rules = vec![RuleSelector {
            rule_id: "fh1".to_string(),
            mls_id: "default".to_string(),
            columns: vec![],
        }];

        let results = scheduler.dispatch(&records, &rules).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.rule_errors.is_empty()));
    }

    #[tokio::test]
    async fn test_dispatch_records_error_for_missing_prompt() {
        let config = test_config();
        let backend = EchoLlmBackend::new(r#"{"result": {}}"#);
        let rate_limiter = RateLimiter::new(&config);
        let resolver_client = StaticPromptRegistryClient::new(Default::default()).arc();
        let resolver = PromptResolver::new(resolver_client, Duration::from_secs(60));

        let scheduler = Scheduler {
            backend: &backend,
            rate_limiter: &rate_limiter,
            prompt_resolver: &resolver,
            config: &config,
            prompt_version: None,
        };

        let records = vec![test_record("L1")];
        let rules = vec![RuleSelector {
            rule_id: "missing".to_string(),
            mls_id: "default".to_string(),
            columns: vec![],
        }];

        let results = scheduler.dispatch(&records, &rules).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_errors.len(), 1);
    }
}
