//! HTTP wire types: the external JSON shapes from `original_source/app/api/routes.py`
//! and `admin_routes.py`, and their conversion into/out of our internal
//! domain model (`model.rs`).

use std::collections::BTreeMap;

use crate::{
    model::{Column, Record, RecordResult, RuleSelector},
    prelude::*,
};

/// `{AIViolationID: [...], Data: [...]}` — the primary job request body.
#[derive(Debug, Deserialize)]
pub struct ComplianceRequest {
    #[serde(rename = "AIViolationID")]
    pub ai_violation_id: Vec<WireRuleSelector>,

    #[serde(rename = "Data")]
    pub data: Vec<WireRecord>,

    /// When present, ask the resolver for this specific prompt version
    /// rather than the latest — the prompt-validation variant endpoint's
    /// knob, threaded through to [`crate::prompt_resolver::PromptResolver::resolve`].
    #[serde(default)]
    pub prompt_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WireRuleSelector {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "mlsId")]
    pub mls_id: String,

    #[serde(rename = "CheckColumns")]
    pub check_columns: String,
}

#[derive(Debug, Deserialize)]
pub struct WireRecord {
    pub mlsnum: String,

    #[serde(rename = "mlsId")]
    pub mls_id: String,

    #[serde(default, rename = "Remarks")]
    pub remarks: Option<String>,
    #[serde(default, rename = "PrivateRemarks")]
    pub private_remarks: Option<String>,
    #[serde(default, rename = "Directions")]
    pub directions: Option<String>,
    #[serde(default, rename = "ShowingInstructions")]
    pub showing_instructions: Option<String>,
    #[serde(default, rename = "ConfidentialRemarks")]
    pub confidential_remarks: Option<String>,
    #[serde(default, rename = "SupplementRemarks")]
    pub supplement_remarks: Option<String>,
    #[serde(default, rename = "Concessions")]
    pub concessions: Option<String>,
    #[serde(default, rename = "SaleFactors")]
    pub sale_factors: Option<String>,
}

/// Known column names, for validating `CheckColumns` against the eight
/// recognized fields.
fn parse_column(name: &str) -> Option<Column> {
    match name {
        "Remarks" => Some(Column::Remarks),
        "PrivateRemarks" => Some(Column::PrivateRemarks),
        "Directions" => Some(Column::Directions),
        "ShowingInstructions" => Some(Column::ShowingInstructions),
        "ConfidentialRemarks" => Some(Column::ConfidentialRemarks),
        "SupplementRemarks" => Some(Column::SupplementRemarks),
        "Concessions" => Some(Column::Concessions),
        "SaleFactors" => Some(Column::SaleFactors),
        _ => None,
    }
}

impl WireRuleSelector {
    /// Parse `CheckColumns` (a comma-separated list) into [`Column`]s,
    /// returning every unrecognized name so the caller can report all of
    /// them at once.
    pub fn into_selector(self) -> std::result::Result<RuleSelector, Vec<String>> {
        let mut columns = Vec::new();
        let mut unknown = Vec::new();
        for name in self.check_columns.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_column(name) {
                Some(column) => columns.push(column),
                None => unknown.push(name.to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(unknown);
        }
        Ok(RuleSelector {
            rule_id: self.id,
            mls_id: self.mls_id,
            columns,
        })
    }
}

impl WireRecord {
    pub fn into_record(self) -> Record {
        let mut fields = BTreeMap::new();
        insert_if_some(&mut fields, "Remarks", self.remarks);
        insert_if_some(&mut fields, "PrivateRemarks", self.private_remarks);
        insert_if_some(&mut fields, "Directions", self.directions);
        insert_if_some(&mut fields, "ShowingInstructions", self.showing_instructions);
        insert_if_some(&mut fields, "ConfidentialRemarks", self.confidential_remarks);
        insert_if_some(&mut fields, "SupplementRemarks", self.supplement_remarks);
        insert_if_some(&mut fields, "Concessions", self.concessions);
        insert_if_some(&mut fields, "SaleFactors", self.sale_factors);
        Record {
            listing_id: self.mlsnum,
            mls_id: self.mls_id,
            fields,
        }
    }
}

fn insert_if_some(fields: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    fields.insert(key.to_string(), value.unwrap_or_default());
}

/// `{ok, results, request_id, error_message, total_tokens, elapsed_time}`
/// — the primary job response body.
#[derive(Debug, Serialize)]
pub struct ComplianceResponse {
    pub ok: bool,
    pub results: Vec<Value>,
    pub request_id: String,
    pub error_message: Option<String>,
    pub total_tokens: u32,
    pub elapsed_time: f64,
}

impl ComplianceResponse {
    pub fn success(request_id: String, record_results: &[RecordResult], elapsed_time: f64) -> Self {
        let total_tokens = record_results.iter().map(|r| r.total_tokens).sum();
        let results = record_results.iter().map(record_result_to_wire).collect();
        Self {
            ok: true,
            results,
            request_id,
            error_message: None,
            total_tokens,
            elapsed_time,
        }
    }

    pub fn failure(request_id: String, error_message: String) -> Self {
        Self {
            ok: false,
            results: Vec::new(),
            request_id,
            error_message: Some(error_message),
            total_tokens: 0,
            elapsed_time: 0.0,
        }
    }
}

/// Render one [`RecordResult`] as `{record_id, tenant_id, latency_seconds,
/// tokens_used, <RULE_ID>: RuleFinding|null, …}`, collapsing any rule whose
/// finding had no violations in any column to `null`. Findings are keyed
/// back onto the upstream API column names (`Remarks`, `PrivateRemarks`,
/// …), the inverse of the template-variable mapping used to render prompts.
fn record_result_to_wire(result: &RecordResult) -> Value {
    let mut by_rule: BTreeMap<String, serde_json::Map<String, Value>> = BTreeMap::new();
    for finding in &result.findings {
        let entry = by_rule.entry(finding.rule_id.clone()).or_default();
        let column_key = finding.column.api_name();
        entry
            .entry(column_key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("always inserted as an array")
            .push(Value::String(finding.violation.clone()));
    }

    let mut body = serde_json::Map::new();
    body.insert("record_id".to_string(), Value::String(result.listing_id.clone()));
    body.insert("tenant_id".to_string(), Value::String(result.mls_id.clone()));
    body.insert(
        "latency_seconds".to_string(),
        json!(result.latency_seconds),
    );
    body.insert("tokens_used".to_string(), json!(result.total_tokens));

    for (rule_id, finding) in by_rule {
        let has_violations = finding.values().any(|v| {
            v.as_array().map(|arr| !arr.is_empty()).unwrap_or(false)
        });
        let value = if has_violations {
            Value::Object(finding)
        } else {
            Value::Null
        };
        body.insert(rule_id, value);
    }
    for (rule_id, error) in &result.rule_errors {
        body.insert(rule_id.clone(), json!({ "error": error }));
    }
    // Every rule that actually ran gets a key, even a clean one — the set
    // of present <RULE_ID> keys must equal the set of rules whose
    // selector matched, not just the ones that happened to find or error.
    for rule_id in &result.evaluated_rule_ids {
        body.entry(rule_id.clone()).or_insert(Value::Null);
    }

    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleFinding;

    #[test]
    fn test_parse_check_columns() {
        let selector = WireRuleSelector {
            id: "fh1".to_string(),
            mls_id: "t1".to_string(),
            check_columns: "Remarks, PrivateRemarks".to_string(),
        }
        .into_selector()
        .unwrap();
        assert_eq!(selector.columns, vec![Column::Remarks, Column::PrivateRemarks]);
    }

    #[test]
    fn test_parse_check_columns_rejects_unknown() {
        let err = WireRuleSelector {
            id: "fh1".to_string(),
            mls_id: "t1".to_string(),
            check_columns: "Remarks,Bogus".to_string(),
        }
        .into_selector()
        .unwrap_err();
        assert_eq!(err, vec!["Bogus".to_string()]);
    }

    #[test]
    fn test_clean_rule_is_present_as_null_not_omitted() {
        let result = RecordResult {
            listing_id: "L1".to_string(),
            mls_id: "default".to_string(),
            findings: vec![],
            rule_errors: BTreeMap::new(),
            evaluated_rule_ids: vec!["FAIR".to_string()],
            total_tokens: 42,
            latency_seconds: 0.1,
        };
        let wire = record_result_to_wire(&result);
        assert_eq!(wire["record_id"], "L1");
        assert_eq!(wire["tokens_used"], 42);
        assert!(wire["FAIR"].is_null());
        assert!(wire.get("FAIR").is_some(), "key must be present, not omitted");
    }

    #[test]
    fn test_violations_prevent_null_collapse() {
        let result = RecordResult {
            listing_id: "L1".to_string(),
            mls_id: "default".to_string(),
            findings: vec![RuleFinding {
                rule_id: "FAIR".to_string(),
                column: Column::Remarks,
                violation: "discriminatory phrase".to_string(),
                explanation: None,
            }],
            rule_errors: BTreeMap::new(),
            evaluated_rule_ids: vec!["FAIR".to_string()],
            total_tokens: 10,
            latency_seconds: 0.2,
        };
        let wire = record_result_to_wire(&result);
        assert!(wire["FAIR"].is_object());
        assert_eq!(wire["FAIR"]["Remarks"][0], "discriminatory phrase");
    }

    #[test]
    fn test_rule_error_is_surfaced_on_the_rule_key() {
        let mut rule_errors = BTreeMap::new();
        rule_errors.insert("FAIR".to_string(), "boom".to_string());
        let result = RecordResult {
            listing_id: "L1".to_string(),
            mls_id: "default".to_string(),
            findings: vec![],
            rule_errors,
            evaluated_rule_ids: vec![],
            total_tokens: 0,
            latency_seconds: 0.0,
        };
        let wire = record_result_to_wire(&result);
        assert_eq!(wire["FAIR"]["error"], "boom");
    }
}
