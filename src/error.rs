use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid uses value {value:?} on record {id}")]
    InvalidUses { id: String, value: String },

    #[error("uses total overflows for key {0:?}")]
    UsesOverflow(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("a consolidation run is already in progress")]
    AlreadyRunning,

    #[error("shutting down, no new runs are accepted")]
    ShuttingDown,

    #[error("duplicate group changed during merge: {0}")]
    StaleGroup(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("store returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("unsupported by this store: {0}")]
    Unsupported(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TallyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyRunning | Self::StaleGroup(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Remote { .. } | Self::Http(_) | Self::InvalidRecord(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Malformed row data, as opposed to a failed round trip.
    pub fn is_parse_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecord(_) | Self::InvalidUses { .. } | Self::UsesOverflow(_)
        )
    }
}

impl axum::response::IntoResponse for TallyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
