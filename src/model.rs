//! Core domain types shared across components: the shape of a listing
//! record, rule selection, prompts, findings and results.

use std::collections::BTreeMap;

use crate::prelude::*;

/// The eight real-estate listing fields we run compliance rules against.
///
/// This mirrors the API column names used by the upstream MLS feed, mapped
/// to the internal template variable names our prompts expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Column {
    Remarks,
    PrivateRemarks,
    Directions,
    ShowingInstructions,
    ConfidentialRemarks,
    SupplementRemarks,
    Concessions,
    SaleFactors,
}

impl Column {
    /// All columns, in a stable order.
    pub const ALL: [Column; 8] = [
        Column::Remarks,
        Column::PrivateRemarks,
        Column::Directions,
        Column::ShowingInstructions,
        Column::ConfidentialRemarks,
        Column::SupplementRemarks,
        Column::Concessions,
        Column::SaleFactors,
    ];

    /// The template variable name a prompt uses to reference this column.
    pub fn template_var(self) -> &'static str {
        match self {
            Column::Remarks => "public_remarks",
            Column::PrivateRemarks => "private_agent_remarks",
            Column::Directions => "directions",
            Column::ShowingInstructions => "showing_instructions",
            Column::ConfidentialRemarks => "confidential_remarks",
            Column::SupplementRemarks => "supplement_remarks",
            Column::Concessions => "concessions",
            Column::SaleFactors => "sale_factors",
        }
    }

    /// The upstream MLS API's field name for this column, the inverse of
    /// the template-variable mapping — used to key the wire response back
    /// onto the columns the caller sent, not our internal prompt variables.
    pub fn api_name(self) -> &'static str {
        match self {
            Column::Remarks => "Remarks",
            Column::PrivateRemarks => "PrivateRemarks",
            Column::Directions => "Directions",
            Column::ShowingInstructions => "ShowingInstructions",
            Column::ConfidentialRemarks => "ConfidentialRemarks",
            Column::SupplementRemarks => "SupplementRemarks",
            Column::Concessions => "Concessions",
            Column::SaleFactors => "SaleFactors",
        }
    }
}

/// A single listing record to be checked for compliance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Record {
    /// The listing's MLS-assigned identifier.
    pub listing_id: String,

    /// The MLS (tenant) this record belongs to, used to resolve
    /// custom-vs-default prompts.
    pub mls_id: String,

    /// Raw field values, keyed by their upstream API column name. Missing or
    /// falsy values are treated as empty strings downstream.
    pub fields: BTreeMap<String, String>,
}

impl Record {
    /// Look up a field's value by [`Column`], defaulting to `""` when the
    /// record doesn't include it.
    pub fn field(&self, column: Column) -> &str {
        self.fields
            .get(column.api_name())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Selects which rules apply to which records.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleSelector {
    /// The rule's identifier, e.g. `"fh1"`.
    pub rule_id: String,

    /// The tenant (MLS) this selector applies to.
    pub mls_id: String,

    /// The columns this rule inspects.
    pub columns: Vec<Column>,
}

/// A resolved prompt, ready to be rendered and sent to the LLM.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptEntry {
    /// The rule this prompt implements.
    pub rule_id: String,

    /// The MLS this prompt is customized for, or `"default"`.
    pub mls_id: String,

    /// The Handlebars template text.
    pub template: String,

    /// Per-rule model overrides (temperature, max tokens, etc).
    #[serde(default)]
    pub llm_config: LlmConfig,
}

/// Per-rule LLM call parameters, with defaults matching the original rule
/// executor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            max_output_tokens: 6_095,
            top_p: 1.0,
        }
    }
}

/// A single compliance violation found by a rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleFinding {
    pub rule_id: String,
    pub column: Column,
    pub violation: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// The outcome of checking one record against all of its selected rules.
#[derive(Debug, Clone, Serialize)]
pub struct RecordResult {
    pub listing_id: String,
    pub mls_id: String,
    pub findings: Vec<RuleFinding>,
    /// Per-rule fatal errors (rule id -> message), for rules that ran but
    /// failed outright rather than producing findings.
    pub rule_errors: BTreeMap<String, String>,
    /// Every rule id that actually ran against this record (its selector
    /// matched and the call did not error), whether or not it found any
    /// violations — distinct from `findings`, which omits rules that ran
    /// clean. The wire layer uses this to emit `null` for a clean rule
    /// rather than dropping its key entirely.
    pub evaluated_rule_ids: Vec<String>,
    pub total_tokens: u32,
    pub latency_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_template_vars_are_unique() {
        let mut vars: Vec<_> = Column::ALL.iter().map(|c| c.template_var()).collect();
        vars.sort_unstable();
        vars.dedup();
        assert_eq!(vars.len(), Column::ALL.len());
    }

    #[test]
    fn test_record_field_defaults_to_empty() {
        let record = Record {
            listing_id: "L1".to_string(),
            mls_id: "default".to_string(),
            fields: BTreeMap::new(),
        };
        assert_eq!(record.field(Column::Remarks), "");
    }

    #[test]
    fn test_llm_config_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.max_output_tokens, 6_095);
        assert_eq!(config.temperature, 0.0);
    }
}
