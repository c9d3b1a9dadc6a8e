use serde::{Deserialize, Serialize};

use crate::engine::Task;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
    pub probability: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
}

/// Body of a successful `POST /transcribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub success: bool,
    pub model: String,
    pub task: Task,
    pub language: Option<String>,
    pub language_probability: Option<f32>,
    pub duration: f64,
    pub text: String,
    pub segments: Vec<Segment>,
}

impl TranscriptionResult {
    /// Rounds timestamps to centiseconds and probabilities to three places.
    pub fn rounded(mut self) -> Self {
        self.duration = round_to(self.duration, 2);
        self.language_probability = self
            .language_probability
            .map(|p| round_to(f64::from(p), 3) as f32);

        for segment in &mut self.segments {
            segment.start = round_to(segment.start, 2);
            segment.end = round_to(segment.end, 2);
            for word in segment.words.iter_mut().flatten() {
                word.start = round_to(word.start, 2);
                word.end = round_to(word.end, 2);
                word.probability = round_to(f64::from(word.probability), 3) as f32;
            }
        }
        self
    }
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
