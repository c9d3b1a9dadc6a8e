use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;
use whisper_gateway::audio::pcm_f32_to_wav_bytes;
use whisper_gateway::diarize::{DiarizationError, DiarizationRequest, Diarizer, SpeakerTurn};
use whisper_gateway::config::Device;
use whisper_gateway::engine::{
    EngineError, InferenceSettings, RawSegment, RawToken, RawTranscript, Transcriber,
    TranscriptionJob,
};
use whisper_gateway::models::ComputeType;
use whisper_gateway::models::WhisperModel;
use whisper_gateway::staging::UploadStaging;
use whisper_gateway::{build_router, AppState, Config, ConfigManager, TranscriptionPipeline};

const BOUNDARY: &str = "gateway-test-boundary";

/// Engine double that echoes a fixed transcript, with one segment out of order.
struct FakeEngine;

#[async_trait]
impl Transcriber for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn settings(&self) -> InferenceSettings {
        Config::default().inference_settings()
    }

    async fn transcribe(&self, job: TranscriptionJob) -> Result<RawTranscript, EngineError> {
        assert!(job.wav_path.exists(), "wav must be staged before inference");
        let token = |text: &str, start: f64, end: f64| RawToken {
            text: text.to_string(),
            start,
            end,
            probability: 0.9,
        };
        Ok(RawTranscript {
            language: Some(job.language.unwrap_or_else(|| "en".to_string())),
            language_probability: Some(0.97),
            segments: vec![
                RawSegment {
                    start: 0.0,
                    end: 0.5,
                    text: " First part.".into(),
                    tokens: vec![token(" First", 0.0, 0.2), token(" part.", 0.2, 0.5)],
                },
                RawSegment {
                    start: 0.4,
                    end: 0.9,
                    text: " Second part.".into(),
                    tokens: vec![token(" Second", 0.4, 0.6), token(" part.", 0.6, 0.9)],
                },
                RawSegment {
                    start: 0.3,
                    end: 1.0,
                    text: " Third.".into(),
                    tokens: vec![token(" Third.", 0.3, 1.0)],
                },
            ],
        })
    }
}

struct OomEngine;

#[async_trait]
impl Transcriber for OomEngine {
    fn name(&self) -> &'static str {
        "oom"
    }

    fn settings(&self) -> InferenceSettings {
        Config::default().inference_settings()
    }

    async fn transcribe(&self, job: TranscriptionJob) -> Result<RawTranscript, EngineError> {
        Err(EngineError::OutOfMemory { model: job.model })
    }
}

struct TwoSpeakers;

#[async_trait]
impl Diarizer for TwoSpeakers {
    async fn diarize(
        &self,
        request: DiarizationRequest,
    ) -> Result<Vec<SpeakerTurn>, DiarizationError> {
        assert_eq!(request.credential, "hf_token_value");
        Ok(vec![
            SpeakerTurn {
                start: 0.0,
                end: 0.45,
                speaker: "SPEAKER_00".into(),
            },
            SpeakerTurn {
                start: 0.45,
                end: 1.0,
                speaker: "SPEAKER_01".into(),
            },
        ])
    }
}

struct Harness {
    _root: tempfile::TempDir,
    uploads: PathBuf,
    router: Router,
}

impl Harness {
    fn new(transcriber: Arc<dyn Transcriber>, diarizer: Option<Arc<dyn Diarizer>>) -> Self {
        Self::with_config(transcriber, diarizer, |_| {})
    }

    fn with_config(
        transcriber: Arc<dyn Transcriber>,
        diarizer: Option<Arc<dyn Diarizer>>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let uploads = root.path().join("uploads");

        let mut config = Config {
            upload_dir: Some(uploads.clone()),
            models_dir: Some(root.path().join("models")),
            auto_download_models: false,
            ..Config::default()
        };
        tweak(&mut config);

        let staging = UploadStaging::new(uploads.clone()).unwrap();
        let pipeline = TranscriptionPipeline::new(transcriber, diarizer);
        let state = AppState::new(ConfigManager::from_config(config), pipeline, staging);

        Self {
            _root: root,
            uploads,
            router: build_router(state),
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn uploads_are_empty(&self) -> bool {
        std::fs::read_dir(&self.uploads).unwrap().next().is_none()
    }
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, Vec<u8>),
}

fn transcribe_request(parts: Vec<Part<'_>>) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                        .as_bytes(),
                );
            }
            Part::File(filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/transcribe")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// One second of a 440 Hz tone as 16 kHz mono WAV.
fn tone_wav() -> Vec<u8> {
    let samples: Vec<f32> = (0..16_000)
        .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16_000.0).sin() * 0.3)
        .collect();
    pcm_f32_to_wav_bytes(&samples, 16_000).unwrap()
}

#[tokio::test]
async fn health_is_always_ok() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness.send(get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn root_reports_service_settings() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness.send(get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["device"], "cpu");
    assert_eq!(body["compute_type"], "int8");
    assert_eq!(body["default_model"], "base");
    assert_eq!(body["engine"], "fake");
    assert_eq!(body["diarization"], false);
}

#[tokio::test]
async fn root_reports_engine_settings_not_reloaded_config() {
    // The config now asks for GPU float16 but the running engine was built for CPU int8.
    let harness = Harness::with_config(Arc::new(FakeEngine), None, |config| {
        config.device = Device::Auto;
        config.compute_type = ComputeType::Float16;
        config.default_model = WhisperModel::Tiny;
    });
    let (status, body) = harness.send(get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device"], "cpu");
    assert_eq!(body["compute_type"], "int8");
    assert_eq!(body["default_model"], "tiny");
}

#[tokio::test]
async fn unknown_language_is_rejected_before_inference() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("language", "xx"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["error"], "invalid_field");
    assert!(body["detail"].as_str().unwrap().contains("xx"));
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn models_lists_catalog() {
    let harness = Harness::with_config(Arc::new(FakeEngine), None, |config| {
        config.default_model = WhisperModel::Small;
    });
    let (status, body) = harness.send(get("/models")).await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["tiny", "base", "small", "medium", "large-v2", "large-v3"]
    );
    assert_eq!(body["default"], "small");
    assert!(body["recommended_for_cpu"].is_string());
}

#[tokio::test]
async fn transcribes_with_ordered_segments_and_cleans_up() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![Part::File("tone.wav", tone_wav())]))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["model"], "base");
    assert_eq!(body["task"], "transcribe");
    assert_eq!(body["language"], "en");
    assert_eq!(body["duration"], 1.0);
    assert_eq!(body["text"], "First part. Second part. Third.");

    let segments = body["segments"].as_array().unwrap();
    assert_eq!(segments.len(), 3);
    let starts: Vec<f64> = segments
        .iter()
        .map(|s| s["start"].as_f64().unwrap())
        .collect();
    assert!(starts.windows(2).all(|w| w[0] <= w[1]), "{starts:?}");
    assert!(segments.iter().all(|s| s["words"].is_array()));
    assert!(segments.iter().all(|s| s.get("speaker").is_none()));

    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn align_false_omits_words() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("align", "false"),
            Part::Text("language", "de"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["language"], "de");
    let segments = body["segments"].as_array().unwrap();
    assert!(segments.iter().all(|s| s.get("words").is_none()));
}

#[tokio::test]
async fn diarization_labels_segments_and_words() {
    let harness = Harness::new(Arc::new(FakeEngine), Some(Arc::new(TwoSpeakers)));
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("diarize", "true"),
            Part::Text("hf_token", "hf_token_value"),
            Part::Text("min_speakers", "1"),
            Part::Text("max_speakers", "2"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    let segments = body["segments"].as_array().unwrap();
    assert_eq!(segments[0]["speaker"], "SPEAKER_00");
    assert_eq!(segments[1]["speaker"], "SPEAKER_01");
    assert_eq!(segments[0]["words"][0]["speaker"], "SPEAKER_00");
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn unsupported_model_lists_valid_options() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("model", "gigantic"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "unsupported_model");
    assert_eq!(body["valid_options"].as_array().unwrap().len(), 6);
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn diarize_without_credential_is_rejected() {
    let harness = Harness::new(Arc::new(FakeEngine), Some(Arc::new(TwoSpeakers)));
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("diarize", "true"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_credential");
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn diarize_without_backend_is_not_implemented() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("diarize", "true"),
            Part::Text("hf_token", "hf_token_value"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["error"], "diarization_unavailable");
}

#[tokio::test]
async fn missing_file_is_rejected() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![Part::Text("model", "tiny")]))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_file");
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn undecodable_audio_is_unsupported_media() {
    let harness = Harness::new(Arc::new(FakeEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![Part::File(
            "notes.txt",
            b"this is not audio at all".to_vec(),
        )]))
        .await;

    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"], "unsupported_audio");
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let harness = Harness::with_config(Arc::new(FakeEngine), None, |config| {
        config.max_upload_mb = 1;
    });
    let (status, body) = harness
        .send(transcribe_request(vec![Part::File(
            "big.wav",
            vec![0u8; 2 * 1024 * 1024],
        )]))
        .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "payload_too_large");
    assert!(harness.uploads_are_empty());
}

#[tokio::test]
async fn engine_out_of_memory_maps_to_507() {
    let harness = Harness::new(Arc::new(OomEngine), None);
    let (status, body) = harness
        .send(transcribe_request(vec![
            Part::Text("model", "large-v3"),
            Part::File("tone.wav", tone_wav()),
        ]))
        .await;

    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(body["error"], "out_of_memory");
    assert!(body["detail"].as_str().unwrap().contains("large-v3"));
    assert!(harness.uploads_are_empty());
}
