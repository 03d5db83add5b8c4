//! HTTP API surface: submit, poll, cancel, health.

mod routes;

pub use routes::router;

use std::sync::Arc;

use crate::jobs::{JobService, ResultCache};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub cache: Arc<ResultCache>,
}
