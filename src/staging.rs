//! Per-request scratch directories under the upload root.

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

const MAX_FILENAME_CHARS: usize = 96;

pub struct UploadStaging {
    root: PathBuf,
}

impl UploadStaging {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create upload directory {:?}", root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens a fresh directory for one request. It is removed when the
    /// returned value is dropped, whichever way the request ends.
    pub fn begin(&self) -> io::Result<StagedRequest> {
        let id = Uuid::now_v7();
        let dir = tempfile::Builder::new()
            .prefix(&format!("req-{}-", id.simple()))
            .tempdir_in(&self.root)?;
        Ok(StagedRequest { id, dir })
    }
}

pub struct StagedRequest {
    id: Uuid,
    dir: TempDir,
}

impl StagedRequest {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Where the raw upload is written: `<dir>/<uuid>_<sanitized name>`.
    pub fn upload_path(&self, filename: &str) -> PathBuf {
        self.dir()
            .join(format!("{}_{}", self.id.simple(), sanitize_filename(filename)))
    }

    pub fn wav_path(&self) -> PathBuf {
        self.dir().join("audio.wav")
    }

    /// Removes the directory now, reporting failures instead of swallowing them on drop.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Keeps the name recognisable for logs and extension probing while
/// stripping path components and shell-unfriendly characters.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        return "upload".to_string();
    }

    // Keep the extension when trimming long names.
    if cleaned.chars().count() > MAX_FILENAME_CHARS {
        let ext = Path::new(cleaned)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.len() <= 8)
            .unwrap_or("");
        let keep = MAX_FILENAME_CHARS.saturating_sub(ext.len() + 1);
        let stem: String = cleaned.chars().take(keep).collect();
        return if ext.is_empty() {
            stem
        } else {
            format!("{}.{}", stem, ext)
        };
    }

    cleaned.to_string()
}
