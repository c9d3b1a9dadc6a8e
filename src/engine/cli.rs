use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use super::{
    is_oom_message, EngineError, InferenceSettings, RawSegment, RawToken, RawTranscript, Task,
    Transcriber, TranscriptionJob,
};
use crate::models::{ModelStore, WhisperModel};

const OUTPUT_BASENAME: &str = "transcript";

#[derive(Debug, Clone, PartialEq)]
pub struct WhisperVadOptions {
    pub enabled: bool,
    /// Explicit Silero weights. When unset the model store provides them.
    pub model_path: Option<PathBuf>,
    pub threshold: f32,
    pub min_speech_ms: u32,
    pub min_silence_ms: u32,
    pub max_speech_s: f32,
    pub speech_pad_ms: u32,
    pub samples_overlap: f32,
}

impl Default for WhisperVadOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            model_path: None,
            threshold: 0.5,
            min_speech_ms: 250,
            min_silence_ms: 100,
            max_speech_s: f32::INFINITY,
            speech_pad_ms: 30,
            samples_overlap: 0.10,
        }
    }
}

impl WhisperVadOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Runs the whisper.cpp `whisper-cli` binary once per request.
pub struct WhisperCli {
    binary_path: PathBuf,
    store: Arc<ModelStore>,
    settings: InferenceSettings,
    vad: WhisperVadOptions,
}

impl WhisperCli {
    pub fn new(
        binary_path: PathBuf,
        store: Arc<ModelStore>,
        settings: InferenceSettings,
        vad: WhisperVadOptions,
    ) -> Self {
        Self {
            binary_path,
            store,
            settings,
            vad,
        }
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        if !self.binary_path.exists() {
            anyhow::bail!("Whisper binary not found at: {:?}", self.binary_path);
        }

        info!("✅ whisper.cpp backend ready");
        info!("   Binary: {:?}", self.binary_path);
        info!("   Models: {:?}", self.store.models_dir());
        info!(
            "   Compute: {} | threads: {} | beam: {}",
            self.settings.compute_type, self.settings.threads, self.settings.beam_size
        );
        if self.settings.use_gpu {
            info!("   GPU: allowed ({})", detect_gpu());
        } else {
            info!("   GPU: disabled (CPU only)");
        }

        match (self.vad.enabled, &self.vad.model_path) {
            (false, _) => info!("   VAD: disabled"),
            (true, Some(path)) if path.exists() => info!("   VAD: enabled ({})", path.display()),
            (true, Some(path)) => warn!(
                "   VAD: model {} not found (running without VAD)",
                path.display()
            ),
            (true, None) => info!(
                "   VAD: enabled ({}, fetched on first use)",
                self.store.vad_path().display()
            ),
        }

        Ok(())
    }

    /// Silero weights for this request, or `None` to run without VAD.
    async fn resolve_vad_model(&self) -> Option<PathBuf> {
        if !self.vad.enabled {
            return None;
        }

        if let Some(path) = &self.vad.model_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("VAD model {} not found, running without VAD", path.display());
            return None;
        }

        match self.store.ensure_vad().await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("VAD model unavailable, running without VAD: {}", err);
                None
            }
        }
    }

    fn build_command(
        &self,
        job: &TranscriptionJob,
        model_path: &Path,
        vad_model: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(&self.binary_path);

        cmd.arg("-m").arg(model_path);
        cmd.arg("-f").arg(&job.wav_path);
        cmd.arg("-of").arg(job.work_dir.join(OUTPUT_BASENAME));
        cmd.args(["-oj", "-ojf"]);
        cmd.arg("-t").arg(self.settings.threads.to_string());
        cmd.arg("-bs").arg(self.settings.beam_size.to_string());
        cmd.arg("-l").arg(job.language.as_deref().unwrap_or("auto"));
        cmd.arg("--no-speech-thold")
            .arg(format!("{}", self.settings.no_speech_threshold));

        if job.task == Task::Translate {
            cmd.arg("--translate");
        }

        if let Some(prompt) = job.initial_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            cmd.arg("--prompt").arg(prompt);
        }

        if job.word_timestamps {
            cmd.arg("-dtw").arg(job.model.dtw_preset());
        }

        if let Some(vad_model) = vad_model {
            cmd.arg("--vad");
            cmd.arg("--vad-model").arg(vad_model);
            cmd.arg("--vad-threshold")
                .arg(format!("{}", self.vad.threshold));
            cmd.arg("--vad-min-speech-duration-ms")
                .arg(self.vad.min_speech_ms.to_string());
            cmd.arg("--vad-min-silence-duration-ms")
                .arg(self.vad.min_silence_ms.to_string());
            if self.vad.max_speech_s.is_finite() {
                cmd.arg("--vad-max-speech-duration-s")
                    .arg(format!("{}", self.vad.max_speech_s));
            }
            cmd.arg("--vad-speech-pad-ms")
                .arg(self.vad.speech_pad_ms.to_string());
            cmd.arg("--vad-samples-overlap")
                .arg(format!("{}", self.vad.samples_overlap));
        }

        if !self.settings.use_gpu {
            cmd.arg("--no-gpu");
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transcriber for WhisperCli {
    fn name(&self) -> &'static str {
        "whisper.cpp"
    }

    fn settings(&self) -> InferenceSettings {
        self.settings.clone()
    }

    async fn transcribe(&self, job: TranscriptionJob) -> Result<RawTranscript, EngineError> {
        let model_path = self
            .store
            .ensure(job.model, self.settings.compute_type)
            .await?;

        let vad_model = self.resolve_vad_model().await;
        let mut cmd = self.build_command(&job, &model_path, vad_model.as_deref());
        debug!("Running whisper: {:?}", cmd);

        let output = cmd.output().await.map_err(|source| EngineError::Launch {
            binary: self.binary_path.display().to_string(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!("Whisper stdout: {}", String::from_utf8_lossy(&output.stdout));
        trace!("Whisper stderr: {}", stderr);

        if !output.status.success() {
            warn!(
                "Whisper command failed with exit code: {:?}",
                output.status.code()
            );
            warn!("Stderr: {}", stderr);
            return Err(classify_failure(&output.status, &stderr, job.model));
        }

        let json_path = job.work_dir.join(format!("{}.json", OUTPUT_BASENAME));
        let raw = tokio::fs::read(&json_path).await.map_err(|err| {
            EngineError::Output(format!("missing {}: {}", json_path.display(), err))
        })?;

        let mut transcript = parse_cli_json(&String::from_utf8_lossy(&raw))?;

        match detected_language(&stderr) {
            Some((language, probability)) => {
                transcript.language.get_or_insert(language);
                transcript.language_probability = Some(probability);
            }
            None if job.language.is_some() => {
                transcript.language_probability = Some(1.0);
            }
            None => {}
        }

        Ok(transcript)
    }
}

fn detect_gpu() -> String {
    use std::process::Command;

    if Command::new("nvidia-smi").output().is_ok() {
        return "NVIDIA GPU detected".to_string();
    }

    if Command::new("rocm-smi").output().is_ok() || Path::new("/opt/rocm").exists() {
        return "AMD GPU (ROCm) detected".to_string();
    }

    "no GPU detected".to_string()
}

fn classify_failure(status: &ExitStatus, stderr: &str, model: WhisperModel) -> EngineError {
    if is_oom_message(stderr) || killed_by_oom(status) {
        return EngineError::OutOfMemory { model };
    }

    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("whisper-cli exited without output")
        .trim()
        .to_string();
    EngineError::Failed(format!("exit status {:?}: {}", status.code(), detail))
}

#[cfg(unix)]
fn killed_by_oom(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    // SIGKILL with no exit code is what the kernel OOM killer leaves behind.
    status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_oom(_status: &ExitStatus) -> bool {
    false
}

fn detected_language(stderr: &str) -> Option<(String, f32)> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| {
            Regex::new(r"auto-detected language: ([a-z]{2,3}) \(p = ([0-9.]+)\)").ok()
        })
        .as_ref()?;

    let caps = re.captures(stderr)?;
    let probability = caps.get(2)?.as_str().parse().ok()?;
    Some((caps.get(1)?.as_str().to_string(), probability))
}

#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    result: Option<CliResult>,
    #[serde(default)]
    transcription: Vec<CliSegment>,
}

#[derive(Debug, Deserialize)]
struct CliResult {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliOffsets {
    from: i64,
    to: i64,
}

#[derive(Debug, Deserialize)]
struct CliSegment {
    offsets: CliOffsets,
    text: String,
    #[serde(default)]
    tokens: Vec<CliToken>,
}

#[derive(Debug, Deserialize)]
struct CliToken {
    text: String,
    offsets: Option<CliOffsets>,
    #[serde(default)]
    p: f32,
    /// DTW timestamp in centiseconds, `-1` when DTW was not run.
    #[serde(default = "no_dtw")]
    t_dtw: i64,
}

fn no_dtw() -> i64 {
    -1
}

fn is_special_token(text: &str) -> bool {
    let text = text.trim();
    (text.starts_with("[_") && text.ends_with(']'))
        || (text.starts_with("<|") && text.ends_with("|>"))
}

fn millis(value: i64) -> f64 {
    value.max(0) as f64 / 1000.0
}

fn parse_cli_json(raw: &str) -> Result<RawTranscript, EngineError> {
    let output: CliOutput =
        serde_json::from_str(raw).map_err(|err| EngineError::Output(err.to_string()))?;

    let segments = output
        .transcription
        .into_iter()
        .map(|segment| {
            let seg_start = millis(segment.offsets.from);
            let seg_end = millis(segment.offsets.to).max(seg_start);

            let tokens = segment
                .tokens
                .into_iter()
                .filter(|token| !is_special_token(&token.text) && !token.text.is_empty())
                .map(|token| {
                    let (mut start, end) = token
                        .offsets
                        .as_ref()
                        .map(|o| (millis(o.from), millis(o.to)))
                        .unwrap_or((seg_start, seg_end));
                    if token.t_dtw >= 0 {
                        start = token.t_dtw as f64 / 100.0;
                    }
                    RawToken {
                        text: token.text,
                        start,
                        end: end.max(start),
                        probability: token.p,
                    }
                })
                .collect();

            RawSegment {
                start: seg_start,
                end: seg_end,
                text: segment.text,
                tokens,
            }
        })
        .collect();

    Ok(RawTranscript {
        language: output.result.and_then(|r| r.language),
        language_probability: None,
        segments,
    })
}
