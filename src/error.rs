//! Our top-level application error type.
//!
//! Following the driver errors in `drivers/mod.rs`, we hand-write `Display`
//! and `std::error::Error` rather than pulling in `thiserror`, since the
//! variant list here is small and stable.
//!
//! This covers only the job-terminating kinds from the error taxonomy in
//! `SPEC_FULL.md` §7 (`ValidationError`, `PromptNotFound`, `JobTimeout`,
//! `StartupConfigError`); the per-call kinds (`LLMTransient`,
//! `LLMPermanent`, `ParseError`, `RateLimiterPause`) are absorbed locally by
//! the Retry Governor and Rule Executor and never reach here, per that
//! section's propagation policy.

use std::{error, fmt};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::prelude::*;

/// Everything that can go wrong while handling a compliance-check request,
/// terminally enough that the job as a whole fails.
#[derive(Debug)]
pub enum AppError {
    /// The request body failed validation (empty records, unknown rule IDs,
    /// malformed selectors, etc).
    InvalidRequest(String),

    /// At least one `(rule_id, mls_id)` pair had no prompt at all, even
    /// after the custom-then-default fallback. Still a 400: no LLM calls
    /// were made for this job.
    PromptNotFound { missing: Vec<(String, String)> },

    /// The job exceeded its total deadline (`Config::request_timeout`);
    /// partial results are discarded.
    JobTimeout,

    /// Anything else, wrapped from [`anyhow::Error`] via `?`.
    Internal(anyhow::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            AppError::PromptNotFound { missing } => {
                let pairs = missing
                    .iter()
                    .map(|(rule, mls)| format!("{rule}/{mls}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "no prompt found for: {pairs}")
            }
            AppError::JobTimeout => write!(f, "job exceeded its total deadline"),
            AppError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl error::Error for AppError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            AppError::Internal(err) => Some(err.as_ref()),
            AppError::InvalidRequest(_) | AppError::PromptNotFound { .. } | AppError::JobTimeout => None,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) | AppError::PromptNotFound { .. } => StatusCode::BAD_REQUEST,
            AppError::JobTimeout | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine-readable error code for the JSON body, distinct from
    /// the human-readable `Display` message.
    fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::PromptNotFound { .. } => "prompt_not_found",
            AppError::JobTimeout => "job_timeout",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        let message = self.to_string();
        let body = json!({
            "error": self.code(),
            "detail": message,
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::InvalidRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::PromptNotFound {
                missing: vec![("FAIR".into(), "T2".into())]
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::JobTimeout.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_prompt_not_found_lists_every_pair() {
        let err = AppError::PromptNotFound {
            missing: vec![("FAIR".into(), "T2".into()), ("HOA".into(), "default".into())],
        };
        assert_eq!(err.to_string(), "no prompt found for: FAIR/T2, HOA/default");
    }
}
