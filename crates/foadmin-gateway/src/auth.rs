//! Bearer-token guard for the admin routes.
//!
//! Auth: `Authorization: Bearer <token>` header, compared against
//! `gateway.auth.token` when the mode is `token`.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use foadmin_core::config::AuthMode;
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;
use crate::http::ApiError;

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if check_auth(&state, req.headers()) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "rejected unauthenticated admin request");
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError {
            error: "Unauthorized. Set 'Authorization: Bearer <your-token>' header.".to_string(),
            code: "UNAUTHORIZED",
        }),
    )
        .into_response()
}

/// Returns true if the request is authorised.
fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.gateway.auth.mode {
        AuthMode::None => true,
        AuthMode::Token => {
            let expected = match &state.config.gateway.auth.token {
                Some(t) => t.as_str(),
                // Token mode configured but no token value: deny.
                None => return false,
            };
            extract_bearer(headers)
                .map(|t| t == expected)
                .unwrap_or(false)
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
