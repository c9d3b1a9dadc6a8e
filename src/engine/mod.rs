//! Speech-recognition backends.
//!
//! The gateway only talks to the [`Transcriber`] trait. The default backend
//! drives the whisper.cpp CLI as a subprocess; `whisper-native` swaps in an
//! in-process whisper-rs context cache.

pub mod cli;
pub mod languages;
#[cfg(feature = "whisper-native")]
pub mod native;
pub mod postprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Device;
use crate::models::{ComputeType, ModelStoreError, WhisperModel};

pub use cli::WhisperCli;
#[cfg(feature = "whisper-native")]
pub use native::NativeWhisper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    /// Translate into English.
    Translate,
}

impl Task {
    pub fn as_str(self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate => "translate",
        }
    }
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            other => Err(format!(
                "unknown task '{}' (expected 'transcribe' or 'translate')",
                other
            )),
        }
    }
}

/// Decoding knobs shared by every backend.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub device: Device,
    pub compute_type: ComputeType,
    pub use_gpu: bool,
    pub threads: usize,
    pub beam_size: u32,
    pub no_speech_threshold: f32,
}

/// One inference call, with all inputs already staged on disk.
#[derive(Debug, Clone)]
pub struct TranscriptionJob {
    pub model: WhisperModel,
    /// 16 kHz mono 16-bit WAV re-encode of the upload.
    pub wav_path: PathBuf,
    /// Directory the backend may write scratch output into. Removed with the request.
    pub work_dir: PathBuf,
    pub samples: Arc<Vec<f32>>,
    pub language: Option<String>,
    pub task: Task,
    pub initial_prompt: Option<String>,
    pub word_timestamps: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawToken {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<RawToken>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTranscript {
    pub language: Option<String>,
    pub language_probability: Option<f32>,
    pub segments: Vec<RawSegment>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelStoreError),
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("out of memory while running model '{model}'")]
    OutOfMemory { model: WhisperModel },
    #[error("transcription failed: {0}")]
    Failed(String),
    #[error("unreadable engine output: {0}")]
    Output(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Substrings whisper.cpp and ggml print when an allocation fails.
const OOM_MARKERS: &[&str] = &[
    "failed to allocate",
    "out of memory",
    "bad_alloc",
    "cannot allocate memory",
    "not enough space in the context",
];

pub(crate) fn is_oom_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    OOM_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Settings the backend was built with. Fixed for the life of the process.
    fn settings(&self) -> InferenceSettings;

    async fn transcribe(&self, job: TranscriptionJob) -> Result<RawTranscript, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task() {
        assert_eq!("Translate".parse::<Task>().unwrap(), Task::Translate);
        assert_eq!(" transcribe ".parse::<Task>().unwrap(), Task::Transcribe);
        assert!("summarize".parse::<Task>().is_err());
    }

    #[test]
    fn recognises_allocation_failures() {
        assert!(is_oom_message(
            "ggml_backend_cpu_buffer_type_alloc_buffer: failed to allocate buffer of size 3000 MB"
        ));
        assert!(is_oom_message("std::bad_alloc"));
        assert!(is_oom_message("whisper_init_state: Cannot allocate memory"));
        assert!(!is_oom_message("failed to read audio file"));
    }
}
