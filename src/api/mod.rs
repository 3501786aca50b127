use axum::extract::State;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::TallyError;
use crate::AppState;

mod admin;

use admin::*;

/// Auth middleware: checks Bearer token if TALLY_API_KEY is configured.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, TallyError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(TallyError::Unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(TallyError::Unauthorized)
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/consolidate", post(do_consolidate))
        .route("/runs/last", get(last_run))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(16 * 1024))
        .with_state(state)
}

/// GET /health: liveness plus what this instance is pointed at.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let c = &state.consolidator;
    let last = c.last_outcome().map(|o| {
        serde_json::json!({
            "started_at": o.started_at,
            "groups_merged": o.groups_merged,
            "records_deleted": o.records_deleted,
            "errors": o.errors.total(),
        })
    });
    Json(serde_json::json!({
        "name": "tally",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "store": c.store().kind(),
        "provider": c.provider(),
        "running": c.is_running(),
        "last_run": last,
    }))
}
