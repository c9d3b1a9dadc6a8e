use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use super::form::read_form;
use super::AppState;
use crate::error::GatewayError;
use crate::models::{catalog, ModelCatalog};
use crate::transcript::TranscriptionResult;

pub(super) async fn root(State(state): State<AppState>) -> Json<Value> {
    let config = state.config.get();
    // The engine keeps its startup settings across config reloads.
    let engine = state.pipeline.engine_settings();
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "device": engine.device.as_str(),
        "compute_type": engine.compute_type.as_str(),
        "default_model": config.default_model.name(),
        "engine": state.pipeline.engine_name(),
        "diarization": state.pipeline.diarization_available(),
    }))
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub(super) async fn models(State(state): State<AppState>) -> Json<ModelCatalog> {
    Json(catalog(state.config.get().default_model))
}

pub(super) async fn transcribe(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<TranscriptionResult>, GatewayError> {
    let multipart =
        multipart.map_err(|rejection| GatewayError::invalid("content-type", rejection.body_text()))?;
    let config = state.config.get();

    let staged = state
        .staging
        .begin()
        .map_err(|err| GatewayError::Internal(format!("failed to create request directory: {err}")))?;

    let outcome = async {
        let form = read_form(
            multipart,
            &staged,
            config.max_upload_bytes(),
            config.default_model,
        )
        .await?;
        state.pipeline.run(&staged, &form.upload, form.options).await
    }
    .await;

    let dir = staged.dir().to_path_buf();
    if let Err(err) = staged.close() {
        warn!("Failed to remove request directory {:?}: {}", dir, err);
    }

    outcome.map(Json)
}
