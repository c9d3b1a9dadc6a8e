use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::audio::AudioError;
use crate::diarize::DiarizationError;
use crate::engine::EngineError;
use crate::models::{ModelStoreError, WhisperModel};

/// Errors surfaced to HTTP clients. Each variant maps to one status and a
/// stable `error` code in the response body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No file provided")]
    MissingFile,
    #[error("invalid value for '{field}': {message}")]
    InvalidField { field: String, message: String },
    #[error("unsupported model '{requested}'")]
    UnsupportedModel { requested: String },
    #[error("diarization requires the 'hf_token' credential")]
    MissingCredential,
    #[error("upload exceeds the configured size limit")]
    PayloadTooLarge,
    #[error("could not decode audio: {0}")]
    UnsupportedAudio(#[from] AudioError),
    #[error("diarization is not configured on this server")]
    DiarizationUnavailable,
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("out of memory running model '{model}'; try a smaller model or shorter audio")]
    OutOfMemory { model: WhisperModel },
    #[error("transcription engine failed: {0}")]
    Engine(String),
    #[error("diarization failed: {0}")]
    Diarization(#[from] DiarizationError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingFile
            | GatewayError::InvalidField { .. }
            | GatewayError::UnsupportedModel { .. }
            | GatewayError::MissingCredential => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UnsupportedAudio(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            GatewayError::DiarizationUnavailable => StatusCode::NOT_IMPLEMENTED,
            GatewayError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::OutOfMemory { .. } => StatusCode::INSUFFICIENT_STORAGE,
            GatewayError::Engine(_)
            | GatewayError::Diarization(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingFile => "missing_file",
            GatewayError::InvalidField { .. } => "invalid_field",
            GatewayError::UnsupportedModel { .. } => "unsupported_model",
            GatewayError::MissingCredential => "missing_credential",
            GatewayError::PayloadTooLarge => "payload_too_large",
            GatewayError::UnsupportedAudio(_) => "unsupported_audio",
            GatewayError::DiarizationUnavailable => "diarization_unavailable",
            GatewayError::ModelUnavailable(_) => "model_unavailable",
            GatewayError::OutOfMemory { .. } => "out_of_memory",
            GatewayError::Engine(_) => "engine_error",
            GatewayError::Diarization(_) => "diarization_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OutOfMemory { model } => GatewayError::OutOfMemory { model },
            EngineError::Model(ModelStoreError::Io(io)) => GatewayError::Internal(io.to_string()),
            EngineError::Model(other) => GatewayError::ModelUnavailable(other.to_string()),
            other => GatewayError::Engine(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_options: Option<Vec<&'static str>>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), "{}", self);
        } else {
            warn!(code = self.code(), "{}", self);
        }

        let valid_options = match &self {
            GatewayError::UnsupportedModel { .. } => Some(WhisperModel::valid_names()),
            _ => None,
        };

        let detail = match &self {
            GatewayError::UnsupportedModel { requested } => format!(
                "unsupported model '{}'; valid options: {}",
                requested,
                WhisperModel::valid_names().join(", ")
            ),
            other => other.to_string(),
        };

        let body = ErrorBody {
            success: false,
            error: self.code(),
            detail,
            valid_options,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_4xx() {
        for err in [
            GatewayError::MissingFile,
            GatewayError::invalid("align", "not a boolean"),
            GatewayError::UnsupportedModel {
                requested: "huge".into(),
            },
            GatewayError::MissingCredential,
        ] {
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{err}");
        }
        assert_eq!(
            GatewayError::UnsupportedAudio(AudioError::Empty).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn engine_errors_map_to_distinct_statuses() {
        let oom: GatewayError = EngineError::OutOfMemory {
            model: WhisperModel::LargeV3,
        }
        .into();
        assert_eq!(oom.status(), StatusCode::INSUFFICIENT_STORAGE);

        let missing: GatewayError =
            EngineError::Model(ModelStoreError::Missing("/models/ggml-base.bin".into())).into();
        assert_eq!(missing.status(), StatusCode::SERVICE_UNAVAILABLE);

        let failed: GatewayError = EngineError::Failed("boom".into()).into();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.code(), "engine_error");
    }

    #[tokio::test]
    async fn unsupported_model_body_lists_options() {
        let response = GatewayError::UnsupportedModel {
            requested: "huge".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), 10_000)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "unsupported_model");
        assert_eq!(parsed["valid_options"].as_array().unwrap().len(), 6);
        assert!(parsed["detail"].as_str().unwrap().contains("large-v3"));
    }
}
