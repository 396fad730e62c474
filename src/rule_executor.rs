//! Component E: runs a single rule against a single record.
//!
//! A direct port of `original_source/app/rules/base.py`'s
//! `execute_rule_with_prompt`: render the resolved prompt's template,
//! cooperate with the rate limiter, call the LLM, parse its output, and
//! map result fields back onto only the columns that had input text.

use handlebars::Handlebars;

use crate::{
    model::{Column, LlmConfig, PromptEntry, Record, RuleFinding},
    parser::parse_llm_response,
    prelude::*,
    rate_limiter::RateLimiter,
    retry::{IntoRetryResult as _, retry_with_backoff},
    llm_client::{LlmBackend, LlmCallError},
    config::Config,
};

/// Everything [`execute_rule`] needs that isn't specific to one call.
pub struct RuleExecutor<'a> {
    pub backend: &'a dyn LlmBackend,
    pub rate_limiter: &'a RateLimiter,
    pub config: &'a Config,
}

impl<'a> RuleExecutor<'a> {
    /// Run `prompt` against `record`, returning the findings produced (which
    /// may be empty) plus the total tokens the call reported using.
    #[instrument(skip(self, prompt, record), fields(rule_id = %prompt.rule_id, listing_id = %record.listing_id))]
    pub async fn execute_rule(
        &self,
        prompt: &PromptEntry,
        record: &Record,
    ) -> Result<(Vec<RuleFinding>, u32)> {
        let rendered = render_prompt(&prompt.template, record)?;

        let combined_text: String = Column::ALL
            .iter()
            .map(|c| record.field(*c))
            .collect::<Vec<_>>()
            .join(" ");
        let estimated_tokens = self.rate_limiter.estimate_tokens(&combined_text);
        self.rate_limiter.wait_if_needed(estimated_tokens).await;

        let config = &prompt.llm_config;
        let outcome = retry_with_backoff(self.config, || async {
            let result = self.backend.complete(&rendered, config).await;
            // Every attempt counts against the limiter, whether or not a
            // retry later discards it — one update per attempt, not one
            // per rule call, so a call that fails twice before succeeding
            // reports three requests, not one. A connection-level failure
            // (no response at all) still updates with an empty header map
            // so it isn't silently excluded from the request count.
            match &result {
                Ok(response) => {
                    self.rate_limiter
                        .update_from_headers(&response.headers, response.total_tokens)
                        .await;
                }
                Err(err) => {
                    let empty;
                    let headers = match &err.headers {
                        Some(headers) => headers,
                        None => {
                            empty = reqwest::header::HeaderMap::new();
                            &empty
                        }
                    };
                    self.rate_limiter.update_from_headers(headers, 0).await;
                }
            }
            result.into_retry_result(is_retryable)
        })
        .await;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => return Err(anyhow!("LLM call failed: {}", err.error)),
        };

        let parsed = parse_llm_response(&response.output_text)
            .ok_or_else(|| anyhow!("could not parse LLM response as JSON"))?;
        let result = parsed
            .get("result")
            .ok_or_else(|| anyhow!("LLM response JSON had no 'result' field"))?;

        let findings = map_result_fields(result, record, &prompt.rule_id);

        Ok((findings, response.total_tokens))
    }
}

/// `reqwest::Error`s (timeouts, connection failures, HTTP status errors)
/// get the full classification table in `retry.rs`; anything else — a 200
/// response missing its expected fields, say — is "any other exception",
/// which the spec's retry table marks non-retryable: retrying would just
/// replay the same malformed body.
fn is_retryable(err: &LlmCallError) -> bool {
    err.error
        .downcast_ref::<reqwest::Error>()
        .map(crate::retry::IsKnownTransient::is_known_transient)
        .unwrap_or(false)
}

/// Render `template` against `record`'s eight text fields, using the same
/// template variable names the original Jinja2 template expects.
fn render_prompt(template: &str, record: &Record) -> Result<String> {
    let handlebars = Handlebars::new();
    let mut bindings = serde_json::Map::new();
    for column in Column::ALL {
        bindings.insert(
            column.template_var().to_string(),
            Value::String(record.field(column).to_string()),
        );
    }
    handlebars
        .render_template(template, &Value::Object(bindings))
        .context("failed to render prompt template")
}

/// Map the model's per-column violation arrays back onto [`RuleFinding`]s,
/// silently dropping violations reported against columns whose input text
/// was empty (the original logs a warning and excludes them; we do the
/// same via `warn!`).
fn map_result_fields(result: &Value, record: &Record, rule_id: &str) -> Vec<RuleFinding> {
    let mut findings = Vec::new();
    for column in Column::ALL {
        let Some(violations) = result.get(column.template_var()).and_then(Value::as_array) else {
            continue;
        };
        if violations.is_empty() {
            continue;
        }
        let input_value = record.field(column);
        if input_value.is_empty() {
            warn!(
                rule_id,
                column = column.template_var(),
                "violations found but input was empty, excluding from result"
            );
            continue;
        }
        for violation in violations {
            let violation_text = violation.as_str().unwrap_or_default().to_string();
            findings.push(RuleFinding {
                rule_id: rule_id.to_string(),
                column,
                violation: violation_text,
                explanation: None,
            });
        }
    }
    findings
}
