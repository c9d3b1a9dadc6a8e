//! HTTP surface: routing, shared state and request handlers.

mod form;
mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::ConfigManager;
use crate::pipeline::TranscriptionPipeline;
use crate::staging::UploadStaging;

pub use form::{parse_options, FormFields};

/// Room for the non-file form fields on top of the upload limit.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigManager,
    pub pipeline: Arc<TranscriptionPipeline>,
    pub staging: Arc<UploadStaging>,
}

impl AppState {
    pub fn new(
        config: ConfigManager,
        pipeline: TranscriptionPipeline,
        staging: UploadStaging,
    ) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            staging: Arc::new(staging),
        }
    }
}

/// Build the axum router with all routes.
///
/// The body limit is fixed when the router is built; the per-upload limit
/// in the form reader follows config reloads.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .config
        .get()
        .max_upload_bytes()
        .saturating_add(FORM_OVERHEAD_BYTES);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/transcribe", post(handlers::transcribe))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
