//! Consolidation trigger and run reporting.

use axum::extract::State;
use axum::Json;
use tracing::debug;

use crate::consolidate::{ConsolidateRequest, RunOutcome};
use crate::error::TallyError;
use crate::AppState;

/// POST /consolidate runs now. Empty body means "use configured defaults".
pub(super) async fn do_consolidate(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<RunOutcome>, TallyError> {
    let req: ConsolidateRequest = if body.is_empty() {
        ConsolidateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| TallyError::Validation(format!("bad request body: {e}")))?
    };
    debug!(?req, "on-demand consolidation");

    // Detached so a client hanging up can't cut a group between its deletes
    // and the winner update.
    let consolidator = state.consolidator.clone();
    let outcome = tokio::spawn(async move { consolidator.run(req).await })
        .await
        .map_err(|e| TallyError::Internal(format!("consolidation task: {e}")))??;
    Ok(Json(outcome))
}

/// GET /runs/last
pub(super) async fn last_run(State(state): State<AppState>) -> Result<Json<RunOutcome>, TallyError> {
    state
        .consolidator
        .last_outcome()
        .map(Json)
        .ok_or(TallyError::NotFound)
}
