//! Component K: authentication — interface only.
//!
//! The original's `verify_authentication` dependency (`original_source/app/api/admin_routes.py`)
//! gates every cache-admin route. Real credential validation is out of
//! scope for this spec (see Non-goals), but the shape of the gate is
//! carried so a real implementation can be dropped in later without
//! touching route wiring.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::prelude::*;

/// Placeholder authorization check for the cache-admin routes.
///
/// Currently accepts every request; replace with real credential
/// verification before exposing this service outside a trusted network.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, StatusCode> {
    trace!("admin auth check (stub, always allows)");
    Ok(next.run(request).await)
}
