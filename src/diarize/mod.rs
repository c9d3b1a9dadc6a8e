//! Speaker diarization behind the [`Diarizer`] seam.

pub mod assign;
pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use assign::assign_speakers;
pub use command::CommandDiarizer;

/// A time span attributed to one speaker, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

#[derive(Debug, Clone)]
pub struct DiarizationRequest {
    pub wav_path: PathBuf,
    pub credential: String,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
}

#[derive(Debug, Error)]
pub enum DiarizationError {
    #[error("failed to launch diarizer '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("diarizer exited with status {status:?}: {message}")]
    Failed { status: Option<i32>, message: String },
    #[error("unreadable diarizer output: {0}")]
    Output(String),
}

#[async_trait]
pub trait Diarizer: Send + Sync {
    async fn diarize(&self, request: DiarizationRequest) -> Result<Vec<SpeakerTurn>, DiarizationError>;
}
