use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_DOWNLOAD_BASE_URL: &str =
    "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

pub const DEFAULT_VAD_DOWNLOAD_BASE_URL: &str =
    "https://huggingface.co/ggml-org/whisper-vad/resolve/main";

/// Silero VAD weights understood by `whisper-cli --vad-model`.
pub const VAD_MODEL_FILE: &str = "ggml-silero-v5.1.2.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhisperModel {
    #[serde(rename = "tiny")]
    Tiny,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "large-v2")]
    LargeV2,
    #[serde(rename = "large-v3")]
    LargeV3,
}

impl WhisperModel {
    pub const ALL: [WhisperModel; 6] = [
        WhisperModel::Tiny,
        WhisperModel::Base,
        WhisperModel::Small,
        WhisperModel::Medium,
        WhisperModel::LargeV2,
        WhisperModel::LargeV3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::LargeV2 => "large-v2",
            WhisperModel::LargeV3 => "large-v3",
        }
    }

    pub fn params(self) -> &'static str {
        match self {
            WhisperModel::Tiny => "39M",
            WhisperModel::Base => "74M",
            WhisperModel::Small => "244M",
            WhisperModel::Medium => "769M",
            WhisperModel::LargeV2 | WhisperModel::LargeV3 => "1550M",
        }
    }

    /// Rough resident memory while decoding on CPU with the unquantised weights.
    pub fn approx_memory(self) -> &'static str {
        match self {
            WhisperModel::Tiny => "~390MB",
            WhisperModel::Base => "~500MB",
            WhisperModel::Small => "~1.0GB",
            WhisperModel::Medium => "~2.6GB",
            WhisperModel::LargeV2 | WhisperModel::LargeV3 => "~4.7GB",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            WhisperModel::Tiny => "Fastest, lowest accuracy",
            WhisperModel::Base => "Fast, good for simple audio",
            WhisperModel::Small => "Balanced speed/accuracy",
            WhisperModel::Medium => "Good accuracy",
            WhisperModel::LargeV2 => "Best accuracy",
            WhisperModel::LargeV3 => "Latest, best accuracy",
        }
    }

    /// Alignment-head preset name understood by `whisper-cli -dtw`.
    pub fn dtw_preset(self) -> &'static str {
        match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::LargeV2 => "large.v2",
            WhisperModel::LargeV3 => "large.v3",
        }
    }

    fn quantized_suffix(self, compute_type: ComputeType) -> Option<&'static str> {
        match (compute_type, self) {
            (ComputeType::Float16, _) => None,
            (ComputeType::Int8, WhisperModel::LargeV3) => None,
            (ComputeType::Int8, _) => Some("q8_0"),
            (ComputeType::Int5, WhisperModel::Tiny | WhisperModel::Base | WhisperModel::Small) => {
                Some("q5_1")
            }
            (ComputeType::Int5, _) => Some("q5_0"),
        }
    }

    /// File name of the ggml weights for this model at the requested precision.
    /// Falls back to the unquantised file when no variant is published.
    pub fn file_name(self, compute_type: ComputeType) -> String {
        match self.quantized_suffix(compute_type) {
            Some(suffix) => format!("ggml-{}-{}.bin", self.name(), suffix),
            None => format!("ggml-{}.bin", self.name()),
        }
    }

    pub fn valid_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|model| model.name()).collect()
    }
}

impl fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported model '{requested}'")]
pub struct UnknownModel {
    pub requested: String,
}

impl FromStr for WhisperModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "tiny" => Ok(WhisperModel::Tiny),
            "base" => Ok(WhisperModel::Base),
            "small" => Ok(WhisperModel::Small),
            "medium" => Ok(WhisperModel::Medium),
            "large-v2" => Ok(WhisperModel::LargeV2),
            "large-v3" | "large" => Ok(WhisperModel::LargeV3),
            _ => Err(UnknownModel {
                requested: s.to_string(),
            }),
        }
    }
}

/// Numeric precision used for inference, selecting the ggml weight variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    Int8,
    Int5,
    Float16,
}

impl ComputeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputeType::Int8 => "int8",
            ComputeType::Int5 => "int5",
            ComputeType::Float16 => "float16",
        }
    }
}

impl Default for ComputeType {
    fn default() -> Self {
        ComputeType::Int8
    }
}

impl fmt::Display for ComputeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" | "int8_float16" | "int8_float32" | "q8_0" => Ok(ComputeType::Int8),
            "int5" | "q5_0" | "q5_1" => Ok(ComputeType::Int5),
            "float16" | "float32" | "default" | "f16" => Ok(ComputeType::Float16),
            other => anyhow::bail!(
                "unknown compute type '{}' (expected int8, int5 or float16)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: &'static str,
    pub params: &'static str,
    pub memory: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelInfo>,
    pub default: &'static str,
    pub recommended_for_cpu: &'static str,
    pub note: &'static str,
}

pub fn catalog(default_model: WhisperModel) -> ModelCatalog {
    ModelCatalog {
        models: WhisperModel::ALL
            .iter()
            .map(|model| ModelInfo {
                name: model.name(),
                params: model.params(),
                memory: model.approx_memory(),
                description: model.description(),
            })
            .collect(),
        default: default_model.name(),
        recommended_for_cpu: "base or small",
        note: "Models are downloaded on first use",
    }
}

#[derive(Debug, Error)]
pub enum ModelStoreError {
    #[error("model file {0} is not present and automatic downloads are disabled")]
    Missing(PathBuf),
    #[error("failed to download {url}: {message}")]
    Download { url: String, message: String },
    #[error("I/O error while preparing model: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves ggml model files on disk, downloading them on first use.
pub struct ModelStore {
    models_dir: PathBuf,
    base_url: String,
    vad_base_url: String,
    auto_download: bool,
    client: reqwest::Client,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ModelStore {
    pub fn new(models_dir: PathBuf, base_url: String, auto_download: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("whisper-gateway/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            models_dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            vad_base_url: DEFAULT_VAD_DOWNLOAD_BASE_URL.to_string(),
            auto_download,
            client,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_vad_base_url(mut self, url: impl Into<String>) -> Self {
        self.vad_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn path_for(&self, model: WhisperModel, compute_type: ComputeType) -> PathBuf {
        self.models_dir.join(model.file_name(compute_type))
    }

    pub fn vad_path(&self) -> PathBuf {
        self.models_dir.join(VAD_MODEL_FILE)
    }

    /// Returns the path of a usable model file, fetching it when allowed.
    ///
    /// A locally present unquantised file satisfies any compute type when the
    /// quantised variant is absent and downloads are disabled.
    pub async fn ensure(
        &self,
        model: WhisperModel,
        compute_type: ComputeType,
    ) -> Result<PathBuf, ModelStoreError> {
        if compute_type != ComputeType::Float16
            && model.file_name(compute_type) == model.file_name(ComputeType::Float16)
        {
            warn!(
                "{} has no {} variant, using unquantised weights",
                model, compute_type
            );
        }

        let path = self.path_for(model, compute_type);
        if path.exists() {
            return Ok(path);
        }

        if !self.auto_download {
            let fallback = self.path_for(model, ComputeType::Float16);
            if fallback.exists() {
                warn!(
                    "{} not found, using unquantised {}",
                    path.display(),
                    fallback.display()
                );
                return Ok(fallback);
            }
            return Err(ModelStoreError::Missing(path));
        }

        self.fetch_once(&self.base_url, &model.file_name(compute_type), path)
            .await
    }

    /// Silero VAD weights in ggml format, fetched from the whisper.cpp VAD
    /// mirror like the speech models.
    pub async fn ensure_vad(&self) -> Result<PathBuf, ModelStoreError> {
        let path = self.vad_path();
        if path.exists() {
            return Ok(path);
        }
        if !self.auto_download {
            return Err(ModelStoreError::Missing(path));
        }
        self.fetch_once(&self.vad_base_url, VAD_MODEL_FILE, path)
            .await
    }

    /// Downloads `file_name` into `path` unless a concurrent caller already
    /// did. One download per file at a time.
    async fn fetch_once(
        &self,
        base_url: &str,
        file_name: &str,
        path: PathBuf,
    ) -> Result<PathBuf, ModelStoreError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(path.clone()).or_default())
        };
        let _guard = lock.lock().await;

        // Another request may have finished the download while we waited.
        if path.exists() {
            return Ok(path);
        }

        let url = format!("{}/{}", base_url, file_name);
        self.download(&url, &path).await?;
        Ok(path)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ModelStoreError> {
        info!("⬇️  Downloading {} from {}", dest.display(), url);

        tokio::fs::create_dir_all(&self.models_dir).await?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| download_error(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_error(url, format!("HTTP status {}", status)));
        }

        let partial = dest.with_extension("bin.part");
        let written = match write_partial(response, url, &partial, dest).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    debug!("No partial file to remove at {:?}: {}", partial, cleanup);
                }
                return Err(err);
            }
        };

        info!(
            "✅ {} ready ({:.1} MB)",
            dest.display(),
            written as f64 / 1_048_576.0
        );
        Ok(())
    }
}

fn download_error(url: &str, message: impl fmt::Display) -> ModelStoreError {
    ModelStoreError::Download {
        url: url.to_string(),
        message: message.to_string(),
    }
}

/// Streams the body into `partial` and moves it over `dest` once complete.
async fn write_partial(
    response: reqwest::Response,
    url: &str,
    partial: &Path,
    dest: &Path,
) -> Result<u64, ModelStoreError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| download_error(url, err))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(partial, dest).await?;
    Ok(written)
}
