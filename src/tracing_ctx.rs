//! Component G: request tracing.
//!
//! Grounded on `original_source/app/core/middleware.py`'s
//! `RequestIDMiddleware`: generate a v4 UUID per incoming request, make it
//! available to every task spawned while handling that request, and echo
//! it back as an `X-Request-ID` response header. We use
//! `tokio::task_local!` in place of Python's `ContextVar`, and attach the
//! id to a [`tracing::Span`] the way the teacher's code uses
//! `#[instrument]` throughout `queues/chat.rs`.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tokio::task_local;
use uuid::Uuid;

use crate::prelude::*;

task_local! {
    static REQUEST_ID: String;
}

/// The name of the response header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The current request's id, if called from within [`with_request_id`].
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Axum middleware: generate a request id, bind it for the duration of the
/// handler (and anything it spawns via the task-local scope), attach it to
/// a tracing span, and echo it back in the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", request_id = %request_id);

    let response = REQUEST_ID
        .scope(request_id.clone(), async move {
            tracing::Instrument::instrument(next.run(request), span).await
        })
        .await;

    let mut response = response;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_id_visible_inside_scope() {
        REQUEST_ID
            .scope("abc-123".to_string(), async {
                assert_eq!(current_request_id(), Some("abc-123".to_string()));
            })
            .await;
    }

    #[test]
    fn test_request_id_absent_outside_scope() {
        assert_eq!(current_request_id(), None);
    }
}
