use anyhow::{anyhow, Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time;

use crate::engine::cli::WhisperVadOptions;
use crate::engine::InferenceSettings;
use crate::models::{ComputeType, WhisperModel, DEFAULT_DOWNLOAD_BASE_URL};

const APP_NAME: &str = "whisper-gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Auto,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Auto => "auto",
        }
    }

    pub fn allows_gpu(self) -> bool {
        self != Device::Cpu
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            "auto" => Ok(Device::Auto),
            other => Err(anyhow!("unknown device '{}' (expected cpu, cuda or auto)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Cli,
    Native,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" | "whisper-cli" => Ok(EngineKind::Cli),
            "native" | "whisper-rs" => Ok(EngineKind::Native),
            other => Err(anyhow!("unknown engine '{}' (expected cli or native)", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiarizationConfig {
    /// Executable that prints speaker turns as JSON. Diarization is disabled when unset.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VadConfig {
    /// Silero VAD in front of whisper. On by default.
    #[serde(default = "default_vad_enabled")]
    pub enabled: bool,

    /// Custom weights. Unset means the model store downloads the stock file.
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    #[serde(default = "default_vad_min_speech_ms")]
    pub min_speech_ms: u32,

    #[serde(default = "default_vad_min_silence_ms")]
    pub min_silence_ms: u32,

    #[serde(default)]
    pub max_speech_s: Option<f32>,

    #[serde(default = "default_vad_speech_pad_ms")]
    pub speech_pad_ms: u32,

    #[serde(default = "default_vad_samples_overlap")]
    pub samples_overlap: f32,
}

fn default_vad_enabled() -> bool {
    true
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_vad_min_speech_ms() -> u32 {
    250
}

fn default_vad_min_silence_ms() -> u32 {
    100
}

fn default_vad_speech_pad_ms() -> u32 {
    30
}

fn default_vad_samples_overlap() -> f32 {
    0.10
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: default_vad_enabled(),
            model_path: None,
            threshold: default_vad_threshold(),
            min_speech_ms: default_vad_min_speech_ms(),
            min_silence_ms: default_vad_min_silence_ms(),
            max_speech_s: None,
            speech_pad_ms: default_vad_speech_pad_ms(),
            samples_overlap: default_vad_samples_overlap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub device: Device,

    #[serde(default)]
    pub compute_type: ComputeType,

    #[serde(default = "default_model")]
    pub default_model: WhisperModel,

    #[serde(default)]
    pub engine: EngineKind,

    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default = "default_beam_size")]
    pub beam_size: u32,

    #[serde(default = "default_no_speech_threshold")]
    pub no_speech_threshold: f32,

    #[serde(default)]
    pub whisper_binary: Option<PathBuf>,

    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    #[serde(default)]
    pub upload_dir: Option<PathBuf>,

    #[serde(default = "default_auto_download")]
    pub auto_download_models: bool,

    #[serde(default = "default_model_base_url")]
    pub model_base_url: String,

    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    #[serde(default)]
    pub diarization: DiarizationConfig,

    #[serde(default)]
    pub vad: VadConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_model() -> WhisperModel {
    WhisperModel::Base
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_beam_size() -> u32 {
    5
}

fn default_no_speech_threshold() -> f32 {
    0.6
}

fn default_auto_download() -> bool {
    true
}

fn default_model_base_url() -> String {
    DEFAULT_DOWNLOAD_BASE_URL.to_string()
}

fn default_max_upload_mb() -> u64 {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            device: Device::default(),
            compute_type: ComputeType::default(),
            default_model: default_model(),
            engine: EngineKind::default(),
            threads: default_threads(),
            beam_size: default_beam_size(),
            no_speech_threshold: default_no_speech_threshold(),
            whisper_binary: None,
            models_dir: None,
            upload_dir: None,
            auto_download_models: default_auto_download(),
            model_base_url: default_model_base_url(),
            max_upload_mb: default_max_upload_mb(),
            diarization: DiarizationConfig::default(),
            vad: VadConfig::default(),
        }
    }
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn inference_settings(&self) -> InferenceSettings {
        InferenceSettings {
            device: self.device,
            compute_type: self.compute_type,
            use_gpu: self.device.allows_gpu(),
            threads: self.threads.max(1),
            beam_size: self.beam_size.max(1),
            no_speech_threshold: self.no_speech_threshold,
        }
    }

    pub fn vad_options(&self) -> WhisperVadOptions {
        WhisperVadOptions {
            enabled: self.vad.enabled,
            model_path: self.vad.model_path.clone(),
            threshold: self.vad.threshold,
            min_speech_ms: self.vad.min_speech_ms,
            min_silence_ms: self.vad.min_silence_ms,
            max_speech_s: self.vad.max_speech_s.unwrap_or(f32::INFINITY),
            speech_pad_ms: self.vad.speech_pad_ms,
            samples_overlap: self.vad.samples_overlap,
        }
    }

    pub fn resolved_models_dir(&self) -> PathBuf {
        if let Some(dir) = &self.models_dir {
            return dir.clone();
        }

        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.data_dir().join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }

    pub fn resolved_upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(APP_NAME).join("uploads"))
    }

    pub fn resolved_whisper_binary(&self) -> PathBuf {
        if let Some(path) = &self.whisper_binary {
            return path.clone();
        }

        let mut candidates = vec![
            PathBuf::from("/usr/local/bin/whisper-cli"),
            PathBuf::from("/usr/bin/whisper-cli"),
            PathBuf::from("/opt/whisper.cpp/build/bin/whisper-cli"),
        ];
        if let Some(base) = directories::BaseDirs::new() {
            candidates.push(
                base.data_local_dir()
                    .join("whisper.cpp/build/bin/whisper-cli"),
            );
        }

        candidates
            .iter()
            .find(|path| path.exists())
            .cloned()
            .unwrap_or_else(|| candidates[0].clone())
    }

    /// Overlays deployment environment variables on top of file settings.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("HOST") {
            self.host = value;
        }
        if let Some(value) = get("PORT") {
            self.port = value.trim().parse().context("PORT must be a port number")?;
        }
        if let Some(value) = get("DEVICE") {
            self.device = value.parse()?;
        }
        if let Some(value) = get("COMPUTE_TYPE") {
            self.compute_type = value.parse()?;
        }
        if let Some(value) = get("DEFAULT_MODEL") {
            self.default_model = value.parse().map_err(|err| {
                anyhow!(
                    "DEFAULT_MODEL: {} (valid: {})",
                    err,
                    WhisperModel::valid_names().join(", ")
                )
            })?;
        }
        if let Some(value) = get("ENGINE") {
            self.engine = value.parse()?;
        }
        if let Some(value) = get("WHISPER_THREADS") {
            self.threads = value
                .trim()
                .parse()
                .context("WHISPER_THREADS must be a positive integer")?;
        }
        if let Some(value) = get("BEAM_SIZE") {
            self.beam_size = value
                .trim()
                .parse()
                .context("BEAM_SIZE must be a positive integer")?;
        }
        if let Some(value) = get("WHISPER_BINARY") {
            self.whisper_binary = Some(PathBuf::from(value));
        }
        if let Some(value) = get("MODELS_DIR") {
            self.models_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("UPLOAD_DIR") {
            self.upload_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("AUTO_DOWNLOAD_MODELS") {
            self.auto_download_models = parse_flag(&value)
                .ok_or_else(|| anyhow!("AUTO_DOWNLOAD_MODELS must be a boolean"))?;
        }
        if let Some(value) = get("MODEL_BASE_URL") {
            self.model_base_url = value;
        }
        if let Some(value) = get("MAX_UPLOAD_MB") {
            self.max_upload_mb = value
                .trim()
                .parse()
                .context("MAX_UPLOAD_MB must be a positive integer")?;
        }
        if let Some(value) = get("DIARIZE_COMMAND") {
            self.diarization.command = Some(value);
        }
        if let Some(value) = get("DIARIZE_ARGS") {
            self.diarization.args = value.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = get("VAD_ENABLED") {
            self.vad.enabled =
                parse_flag(&value).ok_or_else(|| anyhow!("VAD_ENABLED must be a boolean"))?;
        }
        if let Some(value) = get("VAD_MODEL") {
            self.vad.model_path = Some(PathBuf::from(value));
        }

        Ok(())
    }
}

/// Names of settings that differ between `startup` and `current` but are only
/// read when the server starts: the bind address, the engine and its model
/// store. `default_model` and lower upload limits apply per request and are
/// not listed.
pub fn restart_required_changes(startup: &Config, current: &Config) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let mut note = |name: &'static str, differs: bool| {
        if differs {
            changed.push(name);
        }
    };

    note("host", startup.host != current.host);
    note("port", startup.port != current.port);
    note("device", startup.device != current.device);
    note("compute_type", startup.compute_type != current.compute_type);
    note("engine", startup.engine != current.engine);
    note("threads", startup.threads != current.threads);
    note("beam_size", startup.beam_size != current.beam_size);
    note(
        "no_speech_threshold",
        startup.no_speech_threshold != current.no_speech_threshold,
    );
    note("whisper_binary", startup.whisper_binary != current.whisper_binary);
    note("models_dir", startup.models_dir != current.models_dir);
    note("upload_dir", startup.upload_dir != current.upload_dir);
    note(
        "auto_download_models",
        startup.auto_download_models != current.auto_download_models,
    );
    note("model_base_url", startup.model_base_url != current.model_base_url);
    // The body limit layer is sized at startup; lowering the limit still works.
    note("max_upload_mb", current.max_upload_mb > startup.max_upload_mb);
    note("diarization", startup.diarization != current.diarization);
    note("vad", startup.vad != current.vad);

    changed
}

/// Parses the loose boolean spellings accepted in env vars and form fields.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<ConfigManagerInner>,
}

struct ConfigManagerInner {
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    change_tx: watch::Sender<Config>,
    watcher_active: AtomicBool,
}

impl ConfigManager {
    /// Loads `$GATEWAY_CONFIG` or the per-user `config.jsonc`, creating a
    /// default file when none exists, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = match env::var_os("GATEWAY_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => directories::ProjectDirs::from("", "", APP_NAME)
                .context("Failed to get config directory")?
                .config_dir()
                .join("config.jsonc"),
        };

        let mut config = if config_path.exists() {
            let config = Self::read_config_from_disk(&config_path)?;
            tracing::info!("Loaded config from: {:?}", config_path);
            config
        } else {
            let default_config = Config::default();
            match Self::write_config_file(&config_path, &default_config) {
                Ok(()) => tracing::info!("Created default config at: {:?}", config_path),
                Err(err) => tracing::warn!("Using built-in defaults: {err:#}"),
            }
            default_config
        };

        config.apply_env_overrides(|key| env::var(key).ok())?;

        Ok(Self::with_path(config, Some(config_path)))
    }

    /// A manager over a fixed config with no backing file.
    pub fn from_config(config: Config) -> Self {
        Self::with_path(config, None)
    }

    fn with_path(config: Config, config_path: Option<PathBuf>) -> Self {
        let (change_tx, _) = watch::channel(config.clone());

        Self {
            inner: Arc::new(ConfigManagerInner {
                config: RwLock::new(config),
                config_path,
                change_tx,
                watcher_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn start_watching(&self) {
        let Some(config_path) = self.inner.config_path.clone() else {
            return;
        };

        if self.inner.watcher_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut last_state = Self::file_state(&config_path);
            let mut ticker = time::interval(Duration::from_millis(1000));

            loop {
                ticker.tick().await;

                let current_state = Self::file_state(&config_path);
                if current_state == last_state {
                    continue;
                }

                last_state = current_state;

                let reloaded = Self::read_config_from_disk(&config_path).and_then(|mut config| {
                    config.apply_env_overrides(|key| env::var(key).ok())?;
                    Ok(config)
                });

                match reloaded {
                    Ok(new_config) => {
                        let mut guard = inner
                            .config
                            .write()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if *guard != new_config {
                            *guard = new_config.clone();
                            drop(guard);

                            if inner.change_tx.send(new_config.clone()).is_ok() {
                                tracing::debug!(?new_config, "Config watcher applied update");
                            }
                            tracing::info!("Reloaded config from: {:?}", config_path);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Failed to reload config: {err:#}");
                    }
                }
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.inner.change_tx.subscribe()
    }

    /// Warns on every reload that changes settings the running server read
    /// once at startup.
    pub fn spawn_restart_notifier(&self) {
        let startup = self.get();
        let mut changes = self.subscribe();

        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let current = changes.borrow_and_update().clone();
                let pending = restart_required_changes(&startup, &current);
                if pending.is_empty() {
                    tracing::info!("Config reload applied");
                } else {
                    tracing::warn!(
                        "Config reload applied; restart to pick up: {}",
                        pending.join(", ")
                    );
                }
            }
        });
    }

    pub fn get(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn read_config_from_disk(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {:?}", path))?;
        Self::parse_config(&content)
    }

    fn write_config_file(path: &Path, config: &Config) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config file at {:?}", path))
    }

    fn parse_config(content: &str) -> Result<Config> {
        let value = parse_to_serde_value(content, &ParseOptions::default())
            .context("Failed to parse config as JSONC")?
            .ok_or_else(|| anyhow!("Config file did not contain a JSON value"))?;
        serde_json::from_value(value).context("Failed to deserialize config")
    }

    fn file_state(path: &Path) -> Option<(SystemTime, u64)> {
        let metadata = fs::metadata(path).ok()?;
        let modified = metadata.modified().ok()?;
        Some((modified, metadata.len()))
    }
}
