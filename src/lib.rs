pub mod api;
pub mod consolidate;
pub mod error;
pub mod schedule;
pub mod store;
pub mod util;

use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub consolidator: Arc<consolidate::Consolidator>,
    pub api_key: Option<String>,
    pub started_at: std::time::Instant,
}
