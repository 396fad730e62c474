//! Component J: the HTTP surface. Not itself part of the original scope
//! (per spec §1, transport/auth are external collaborators), but every
//! concrete service needs one, so it's built the way
//! `examples/ayushmaanbhav-product-farm`'s API crate wires up axum: a
//! `Router` built from a shared `AppState`, `tower-http`'s `TraceLayer`
//! for request logging, and our own middleware for request-id propagation
//! and the admin auth stub.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    error::AppError,
    model::RecordResult,
    prelude::*,
    scheduler::{self, Scheduler},
    tracing_ctx::{current_request_id, request_id_middleware},
    wire::{ComplianceRequest, ComplianceResponse},
    AppState,
};

/// Build the full axum [`Router`] for this service.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route("/cache/refresh", post(cache_refresh))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/stats", get(cache_stats))
        .route_layer(middleware::from_fn(crate::auth::require_admin));

    Router::new()
        .route("/check_compliance", post(check_compliance))
        .route("/check_compliance/validate", post(check_compliance))
        .route("/healthz", get(healthz))
        .merge(admin_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[instrument(skip(state, request))]
async fn check_compliance(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ComplianceRequest>,
) -> Result<Json<ComplianceResponse>, AppError> {
    let request_id = current_request_id().unwrap_or_default();
    let started_at = Instant::now();
    let prompt_version = request.prompt_version;

    let mut selector_errors = Vec::new();
    let mut selectors = Vec::new();
    for wire_selector in request.ai_violation_id {
        match wire_selector.into_selector() {
            Ok(selector) => selectors.push(selector),
            Err(unknown) => selector_errors.push(format!(
                "unknown columns in CheckColumns: {}",
                unknown.join(", ")
            )),
        }
    }
    if !selector_errors.is_empty() {
        return Err(AppError::InvalidRequest(selector_errors.join("; ")));
    }
    let selectors = scheduler::merge_selectors(selectors);

    let records: Vec<_> = request.data.into_iter().map(|r| r.into_record()).collect();

    let problems = scheduler::validate_job(&records, &selectors);
    if !problems.is_empty() {
        return Err(AppError::InvalidRequest(problems.join("; ")));
    }

    let sched = Scheduler {
        backend: state.backend.as_ref(),
        rate_limiter: &state.rate_limiter,
        prompt_resolver: &state.prompt_resolver,
        config: &state.config,
        prompt_version,
    };

    let missing = sched.prefetch_prompts(&selectors).await;
    if !missing.is_empty() {
        return Err(AppError::PromptNotFound { missing });
    }

    let record_results: Vec<RecordResult> =
        tokio::time::timeout(state.config.request_timeout, sched.dispatch(&records, &selectors))
            .await
            .map_err(|_| AppError::JobTimeout)?;

    let elapsed = started_at.elapsed().as_secs_f64();
    Ok(Json(ComplianceResponse::success(
        request_id,
        &record_results,
        elapsed,
    )))
}

#[derive(Deserialize, Default)]
struct CacheRefreshRequest {
    rule_id: Option<String>,
    mls_id: Option<String>,
}

async fn cache_refresh(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CacheRefreshRequest>>,
) -> StatusCode {
    let CacheRefreshRequest { rule_id, mls_id } = body.map(|Json(b)| b).unwrap_or_default();
    state
        .prompt_resolver
        .refresh(rule_id.as_deref(), mls_id.as_deref())
        .await;
    StatusCode::OK
}

async fn cache_clear(State(state): State<Arc<AppState>>) -> StatusCode {
    state.prompt_resolver.clear().await;
    StatusCode::OK
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.prompt_resolver.stats().await;
    Json(json!({
        "total_prompts_cached": stats.total_prompts_cached,
        "total_sentinel_entries": stats.total_sentinel_entries,
        "ttl_seconds": state.config.prompt_cache_ttl.as_secs(),
        "cache": stats.cache,
    }))
}
