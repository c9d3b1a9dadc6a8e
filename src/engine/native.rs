use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperError,
};

use super::{
    is_oom_message, EngineError, InferenceSettings, RawSegment, RawToken, RawTranscript, Task,
    Transcriber, TranscriptionJob,
};
use crate::models::{ModelStore, WhisperModel};

/// In-process whisper.cpp via whisper-rs. Loaded contexts are kept for the
/// lifetime of the process, one per model file.
pub struct NativeWhisper {
    store: Arc<ModelStore>,
    settings: InferenceSettings,
    contexts: Mutex<HashMap<PathBuf, Arc<WhisperContext>>>,
    loading: tokio::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl NativeWhisper {
    pub fn new(store: Arc<ModelStore>, settings: InferenceSettings) -> Self {
        Self {
            store,
            settings,
            contexts: Mutex::new(HashMap::new()),
            loading: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        info!("✅ whisper-rs backend ready");
        info!("   Models: {:?}", self.store.models_dir());
        info!(
            "   Compute: {} | threads: {} | beam: {} | GPU: {}",
            self.settings.compute_type,
            self.settings.threads,
            self.settings.beam_size,
            if self.settings.use_gpu { "allowed" } else { "disabled" }
        );
        info!("   VAD: not available in-process");
        Ok(())
    }

    fn cached(&self, path: &Path) -> Option<Arc<WhisperContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    /// Loads each model file at most once, even when requests race for it.
    async fn context_for(
        &self,
        path: PathBuf,
        model: WhisperModel,
    ) -> Result<Arc<WhisperContext>, EngineError> {
        if let Some(ctx) = self.cached(&path) {
            return Ok(ctx);
        }

        let lock = {
            let mut loading = self.loading.lock().await;
            Arc::clone(loading.entry(path.clone()).or_default())
        };
        let _guard = lock.lock().await;

        if let Some(ctx) = self.cached(&path) {
            return Ok(ctx);
        }

        info!("Loading model: {}", path.display());
        let use_gpu = self.settings.use_gpu;
        let load_path = path.clone();
        let ctx = tokio::task::spawn_blocking(move || {
            let mut params = WhisperContextParameters::default();
            params.use_gpu(use_gpu);
            WhisperContext::new_with_params(&load_path.to_string_lossy(), params)
        })
        .await
        .map_err(|err| EngineError::Failed(format!("model loader panicked: {err}")))?
        .map_err(|err| classify_error(err, model))?;

        let ctx = Arc::new(ctx);
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path, Arc::clone(&ctx));
        Ok(ctx)
    }
}

/// State creation allocates the KV cache and compute buffers, so its failure
/// is treated as memory exhaustion.
fn classify_error(err: WhisperError, model: WhisperModel) -> EngineError {
    let message = err.to_string();
    if matches!(err, WhisperError::FailedToCreateState) || is_oom_message(&message) {
        return EngineError::OutOfMemory { model };
    }
    EngineError::Failed(message)
}

#[async_trait]
impl Transcriber for NativeWhisper {
    fn name(&self) -> &'static str {
        "whisper-rs"
    }

    fn settings(&self) -> InferenceSettings {
        self.settings.clone()
    }

    async fn transcribe(&self, job: TranscriptionJob) -> Result<RawTranscript, EngineError> {
        let model_path = self
            .store
            .ensure(job.model, self.settings.compute_type)
            .await?;
        let ctx = self.context_for(model_path, job.model).await?;
        let settings = self.settings.clone();

        tokio::task::spawn_blocking(move || run_inference(&ctx, &settings, &job))
            .await
            .map_err(|err| EngineError::Failed(format!("inference task panicked: {err}")))?
    }
}

fn run_inference(
    ctx: &WhisperContext,
    settings: &InferenceSettings,
    job: &TranscriptionJob,
) -> Result<RawTranscript, EngineError> {
    let failed = |err: WhisperError| classify_error(err, job.model);

    let mut params = FullParams::new(SamplingStrategy::BeamSearch {
        beam_size: settings.beam_size as i32,
        patience: -1.0,
    });
    params.set_n_threads(settings.threads as i32);
    params.set_language(Some(job.language.as_deref().unwrap_or("auto")));
    params.set_translate(job.task == Task::Translate);
    params.set_token_timestamps(job.word_timestamps);
    params.set_no_speech_thold(settings.no_speech_threshold);
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    if let Some(prompt) = job.initial_prompt.as_deref() {
        params.set_initial_prompt(prompt);
    }

    let mut state = ctx.create_state().map_err(failed)?;
    state.full(params, &job.samples).map_err(failed)?;

    let language = state
        .full_lang_id_from_state()
        .ok()
        .and_then(whisper_rs::get_lang_str)
        .map(str::to_string);

    let n_segments = state.full_n_segments().map_err(failed)?;
    let mut segments = Vec::with_capacity(n_segments.max(0) as usize);

    for i in 0..n_segments {
        let text = state.full_get_segment_text_lossy(i).map_err(failed)?;
        let start = state.full_get_segment_t0(i).map_err(failed)? as f64 / 100.0;
        let end = state.full_get_segment_t1(i).map_err(failed)? as f64 / 100.0;

        let mut tokens = Vec::new();
        if job.word_timestamps {
            let n_tokens = state.full_n_tokens(i).map_err(failed)?;
            for t in 0..n_tokens {
                let token_text = state.full_get_token_text_lossy(i, t).map_err(failed)?;
                if token_text.starts_with("[_") || token_text.starts_with("<|") {
                    continue;
                }
                let data = state.full_get_token_data(i, t).map_err(failed)?;
                tokens.push(RawToken {
                    text: token_text,
                    start: data.t0.max(0) as f64 / 100.0,
                    end: data.t1.max(0) as f64 / 100.0,
                    probability: data.p,
                });
            }
        }

        segments.push(RawSegment {
            start,
            end: end.max(start),
            text,
            tokens,
        });
    }

    debug!("whisper-rs produced {} segments", segments.len());

    Ok(RawTranscript {
        language,
        // whisper-rs exposes no detection probability; a forced language is certain.
        language_probability: job.language.as_ref().map(|_| 1.0),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_allocation_failure_is_out_of_memory() {
        assert!(matches!(
            classify_error(WhisperError::FailedToCreateState, WhisperModel::Medium),
            EngineError::OutOfMemory {
                model: WhisperModel::Medium
            }
        ));
        assert!(matches!(
            classify_error(WhisperError::FailedToEncode, WhisperModel::Base),
            EngineError::Failed(_)
        ));
    }
}
