//! The per-request processing chain: decode, transcribe, clean, align,
//! diarize and assemble the response.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::align::align_segments;
use crate::audio::{decode_audio, pcm_f32_to_wav_bytes, TARGET_SAMPLE_RATE};
use crate::diarize::{assign_speakers, DiarizationRequest, Diarizer};
use crate::engine::postprocess::clean_segments;
use crate::engine::{InferenceSettings, Task, Transcriber, TranscriptionJob};
use crate::error::GatewayError;
use crate::logging::{record_pipeline, PipelineRecord, StageRecord};
use crate::models::WhisperModel;
use crate::staging::StagedRequest;
use crate::transcript::{Segment, TranscriptionResult};

/// Validated form options for one transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    pub model: WhisperModel,
    /// `None` means auto-detect.
    pub language: Option<String>,
    pub task: Task,
    pub align: bool,
    pub diarize: bool,
    pub hf_token: Option<String>,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
    pub initial_prompt: Option<String>,
}

impl TranscribeOptions {
    pub fn new(model: WhisperModel) -> Self {
        Self {
            model,
            language: None,
            task: Task::Transcribe,
            align: true,
            diarize: false,
            hf_token: None,
            min_speakers: None,
            max_speakers: None,
            initial_prompt: None,
        }
    }
}

/// The raw upload, already streamed into the request directory.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub path: PathBuf,
    pub filename: String,
    pub bytes: u64,
}

pub struct TranscriptionPipeline {
    transcriber: Arc<dyn Transcriber>,
    diarizer: Option<Arc<dyn Diarizer>>,
}

impl TranscriptionPipeline {
    pub fn new(transcriber: Arc<dyn Transcriber>, diarizer: Option<Arc<dyn Diarizer>>) -> Self {
        Self {
            transcriber,
            diarizer,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.transcriber.name()
    }

    pub fn engine_settings(&self) -> InferenceSettings {
        self.transcriber.settings()
    }

    pub fn diarization_available(&self) -> bool {
        self.diarizer.is_some()
    }

    pub async fn run(
        &self,
        staged: &StagedRequest,
        upload: &StagedUpload,
        options: TranscribeOptions,
    ) -> Result<TranscriptionResult, GatewayError> {
        let mut record = PipelineRecord {
            request_id: staged.id().simple().to_string(),
            model: options.model.name().to_string(),
            file: format!("{} ({} bytes)", upload.filename, upload.bytes),
            audio_secs: 0.0,
            stages: Vec::new(),
            outcome: String::new(),
            text_preview: String::new(),
        };

        let result = self.run_stages(staged, upload, options, &mut record).await;

        match &result {
            Ok(result) => {
                record.outcome = "ok".to_string();
                record.text_preview = result.text.clone();
                info!(
                    "Transcribed {} ({:.1}s audio, {} segments) in {}ms",
                    upload.filename,
                    result.duration,
                    result.segments.len(),
                    record.total_ms()
                );
            }
            Err(err) => record.outcome = err.code().to_string(),
        }
        record_pipeline(&record);

        result
    }

    async fn run_stages(
        &self,
        staged: &StagedRequest,
        upload: &StagedUpload,
        options: TranscribeOptions,
        record: &mut PipelineRecord,
    ) -> Result<TranscriptionResult, GatewayError> {
        // Fail before any heavy lifting when diarization cannot happen.
        let diarization = if options.diarize {
            let diarizer = self
                .diarizer
                .clone()
                .ok_or(GatewayError::DiarizationUnavailable)?;
            let credential = options
                .hf_token
                .clone()
                .filter(|token| !token.trim().is_empty())
                .ok_or(GatewayError::MissingCredential)?;
            Some((diarizer, credential))
        } else {
            None
        };

        let started = Instant::now();
        let data = tokio::fs::read(&upload.path)
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to read upload: {err}")))?;
        let filename = upload.filename.clone();
        let decoded = tokio::task::spawn_blocking(move || decode_audio(data, Some(&filename)))
            .await
            .map_err(|err| GatewayError::Internal(format!("decoder task failed: {err}")))??;

        let duration = decoded.duration_secs();
        record.audio_secs = duration;

        let wav = pcm_f32_to_wav_bytes(&decoded.samples, TARGET_SAMPLE_RATE)
            .map_err(|err| GatewayError::Internal(format!("{err:#}")))?;
        let wav_path = staged.wav_path();
        tokio::fs::write(&wav_path, wav)
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to stage audio: {err}")))?;
        record.stages.push(StageRecord::new(
            "decode",
            started.elapsed(),
            Some(format!(
                "{} Hz x{} -> {} Hz mono",
                decoded.source_sample_rate, decoded.source_channels, TARGET_SAMPLE_RATE
            )),
        ));

        let started = Instant::now();
        let job = TranscriptionJob {
            model: options.model,
            wav_path: wav_path.clone(),
            work_dir: staged.dir().to_path_buf(),
            samples: Arc::new(decoded.samples),
            language: options.language.clone(),
            task: options.task,
            initial_prompt: options.initial_prompt.clone(),
            word_timestamps: options.align,
        };
        let transcript = self.transcriber.transcribe(job).await?;
        record.stages.push(StageRecord::new(
            "transcribe",
            started.elapsed(),
            Some(format!(
                "{} via {}, {} raw segments",
                options.model,
                self.transcriber.name(),
                transcript.segments.len()
            )),
        ));

        let started = Instant::now();
        let cleaned = clean_segments(transcript.segments, options.initial_prompt.as_deref());
        let mut segments = align_segments(cleaned, options.align, duration);
        record.stages.push(StageRecord::new(
            "align",
            started.elapsed(),
            Some(format!(
                "{} segments{}",
                segments.len(),
                if options.align { " with words" } else { "" }
            )),
        ));

        if let Some((diarizer, credential)) = diarization {
            let started = Instant::now();
            let turns = diarizer
                .diarize(DiarizationRequest {
                    wav_path,
                    credential,
                    min_speakers: options.min_speakers,
                    max_speakers: options.max_speakers,
                })
                .await?;
            assign_speakers(&mut segments, &turns);
            debug!("Assigned speakers from {} turns", turns.len());
            record.stages.push(StageRecord::new(
                "diarize",
                started.elapsed(),
                Some(format!("{} turns", turns.len())),
            ));
        }

        let result = TranscriptionResult {
            success: true,
            model: options.model.name().to_string(),
            task: options.task,
            language: transcript.language.or(options.language),
            language_probability: transcript.language_probability,
            duration,
            text: join_text(&segments),
            segments,
        };

        Ok(result.rounded())
    }
}

fn join_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diarize::{DiarizationError, SpeakerTurn};
    use crate::engine::{EngineError, RawSegment, RawToken, RawTranscript};
    use crate::staging::UploadStaging;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedEngine {
        seen: Mutex<Option<TranscriptionJob>>,
    }

    #[async_trait]
    impl Transcriber for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn settings(&self) -> InferenceSettings {
            crate::Config::default().inference_settings()
        }

        async fn transcribe(&self, job: TranscriptionJob) -> Result<RawTranscript, EngineError> {
            assert!(job.wav_path.exists());
            *self.seen.lock().unwrap() = Some(job);
            Ok(RawTranscript {
                language: Some("en".into()),
                language_probability: Some(0.91234),
                segments: vec![
                    RawSegment {
                        start: 0.0,
                        end: 0.4,
                        text: " Hello there.".into(),
                        tokens: vec![
                            RawToken {
                                text: " Hello".into(),
                                start: 0.0,
                                end: 0.2,
                                probability: 0.9,
                            },
                            RawToken {
                                text: " there.".into(),
                                start: 0.2,
                                end: 0.4,
                                probability: 0.8,
                            },
                        ],
                    },
                    RawSegment {
                        start: 0.4,
                        end: 0.5,
                        text: " [BLANK_AUDIO]".into(),
                        tokens: Vec::new(),
                    },
                ],
            })
        }
    }

    struct OneSpeaker;

    #[async_trait]
    impl Diarizer for OneSpeaker {
        async fn diarize(
            &self,
            request: DiarizationRequest,
        ) -> Result<Vec<SpeakerTurn>, DiarizationError> {
            assert_eq!(request.credential, "hf_test");
            Ok(vec![SpeakerTurn {
                start: 0.0,
                end: 1.0,
                speaker: "SPEAKER_00".into(),
            }])
        }
    }

    fn tone_wav() -> Vec<u8> {
        let samples: Vec<f32> = (0..8000)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16_000.0).sin() * 0.3)
            .collect();
        pcm_f32_to_wav_bytes(&samples, 16_000).unwrap()
    }

    fn stage_upload(staged: &StagedRequest, data: &[u8]) -> StagedUpload {
        let path = staged.upload_path("tone.wav");
        std::fs::write(&path, data).unwrap();
        StagedUpload {
            path,
            filename: "tone.wav".into(),
            bytes: data.len() as u64,
        }
    }

    #[tokio::test]
    async fn runs_all_stages() {
        let root = tempfile::tempdir().unwrap();
        let staging = UploadStaging::new(root.path().to_path_buf()).unwrap();
        let staged = staging.begin().unwrap();
        let upload = stage_upload(&staged, &tone_wav());

        let engine = Arc::new(ScriptedEngine {
            seen: Mutex::new(None),
        });
        let pipeline = TranscriptionPipeline::new(engine.clone(), Some(Arc::new(OneSpeaker)));

        let mut options = TranscribeOptions::new(WhisperModel::Tiny);
        options.diarize = true;
        options.hf_token = Some("hf_test".into());

        let result = pipeline.run(&staged, &upload, options).await.unwrap();

        assert_eq!(result.text, "Hello there.");
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(result.language_probability, Some(0.912));
        assert_eq!(result.duration, 0.5);
        assert_eq!(result.segments[0].speaker.as_deref(), Some("SPEAKER_00"));
        assert_eq!(result.segments[0].words.as_ref().unwrap().len(), 2);

        let job = engine.seen.lock().unwrap().take().unwrap();
        assert!(job.word_timestamps);
        assert_eq!(job.samples.len(), 8000);
    }

    #[tokio::test]
    async fn diarization_without_backend_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let staging = UploadStaging::new(root.path().to_path_buf()).unwrap();
        let staged = staging.begin().unwrap();
        let upload = stage_upload(&staged, &tone_wav());

        let engine = Arc::new(ScriptedEngine {
            seen: Mutex::new(None),
        });
        let pipeline = TranscriptionPipeline::new(engine.clone(), None);

        let mut options = TranscribeOptions::new(WhisperModel::Base);
        options.diarize = true;
        options.hf_token = Some("hf_test".into());

        let err = pipeline.run(&staged, &upload, options).await.unwrap_err();
        assert!(matches!(err, GatewayError::DiarizationUnavailable));
        assert!(engine.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_upload_is_unsupported_audio() {
        let root = tempfile::tempdir().unwrap();
        let staging = UploadStaging::new(root.path().to_path_buf()).unwrap();
        let staged = staging.begin().unwrap();
        let upload = stage_upload(&staged, b"definitely not audio");

        let pipeline = TranscriptionPipeline::new(
            Arc::new(ScriptedEngine {
                seen: Mutex::new(None),
            }),
            None,
        );

        let err = pipeline
            .run(&staged, &upload, TranscribeOptions::new(WhisperModel::Base))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedAudio(_)));
    }
}
