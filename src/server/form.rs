use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use axum::http::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::parse_flag;
use crate::engine::languages::is_supported_language;
use crate::engine::Task;
use crate::error::GatewayError;
use crate::models::WhisperModel;
use crate::pipeline::{StagedUpload, TranscribeOptions};
use crate::staging::StagedRequest;

/// Text fields of a `/transcribe` form, as sent.
#[derive(Debug, Clone, Default)]
pub struct FormFields {
    pub model: Option<String>,
    pub language: Option<String>,
    pub task: Option<String>,
    pub align: Option<String>,
    pub diarize: Option<String>,
    pub hf_token: Option<String>,
    pub min_speakers: Option<String>,
    pub max_speakers: Option<String>,
    pub initial_prompt: Option<String>,
}

impl FormFields {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        Some(match name {
            "model" => &mut self.model,
            "language" => &mut self.language,
            "task" => &mut self.task,
            "align" => &mut self.align,
            "diarize" => &mut self.diarize,
            "hf_token" => &mut self.hf_token,
            "min_speakers" => &mut self.min_speakers,
            "max_speakers" => &mut self.max_speakers,
            "initial_prompt" => &mut self.initial_prompt,
            _ => return None,
        })
    }
}

pub(super) struct TranscribeForm {
    pub upload: StagedUpload,
    pub options: TranscribeOptions,
}

/// Streams the `file` part into the request directory and validates the rest.
pub(super) async fn read_form(
    mut multipart: Multipart,
    staged: &StagedRequest,
    max_upload_bytes: usize,
    default_model: WhisperModel,
) -> Result<TranscribeForm, GatewayError> {
    let mut fields = FormFields::default();
    let mut upload = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            upload = Some(stream_upload(field, staged, max_upload_bytes).await?);
            continue;
        }

        match fields.slot(&name) {
            Some(slot) => *slot = Some(field.text().await.map_err(multipart_error)?),
            None => debug!("Ignoring unknown form field '{}'", name),
        }
    }

    let upload = upload.ok_or(GatewayError::MissingFile)?;
    let options = parse_options(&fields, default_model)?;

    Ok(TranscribeForm { upload, options })
}

async fn stream_upload(
    mut field: Field<'_>,
    staged: &StagedRequest,
    max_upload_bytes: usize,
) -> Result<StagedUpload, GatewayError> {
    let filename = field
        .file_name()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(GatewayError::MissingFile)?
        .to_string();

    let path = staged.upload_path(&filename);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| GatewayError::Internal(format!("failed to stage upload: {err}")))?;

    let mut written: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        written += chunk.len() as u64;
        if written > max_upload_bytes as u64 {
            return Err(GatewayError::PayloadTooLarge);
        }
        file.write_all(&chunk)
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to stage upload: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| GatewayError::Internal(format!("failed to stage upload: {err}")))?;

    debug!("Staged upload {} ({} bytes)", filename, written);

    Ok(StagedUpload {
        path,
        filename,
        bytes: written,
    })
}

fn multipart_error(err: MultipartError) -> GatewayError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge
    } else {
        GatewayError::invalid("multipart", err.body_text())
    }
}

/// Validates the text fields into options. Absent and blank values take defaults.
pub fn parse_options(
    fields: &FormFields,
    default_model: WhisperModel,
) -> Result<TranscribeOptions, GatewayError> {
    let value = |raw: &Option<String>| {
        raw.as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let model = match value(&fields.model) {
        Some(name) => name
            .parse::<WhisperModel>()
            .map_err(|_| GatewayError::UnsupportedModel { requested: name })?,
        None => default_model,
    };

    let mut options = TranscribeOptions::new(model);

    options.language = match value(&fields.language) {
        Some(lang) => parse_language(&lang)?,
        None => None,
    };

    if let Some(task) = value(&fields.task) {
        options.task = task
            .parse::<Task>()
            .map_err(|message| GatewayError::invalid("task", message))?;
    }

    if let Some(align) = value(&fields.align) {
        options.align = parse_bool("align", &align)?;
    }
    if let Some(diarize) = value(&fields.diarize) {
        options.diarize = parse_bool("diarize", &diarize)?;
    }

    options.hf_token = value(&fields.hf_token);
    options.initial_prompt = value(&fields.initial_prompt);

    options.min_speakers = value(&fields.min_speakers)
        .map(|v| parse_speaker_count("min_speakers", &v))
        .transpose()?;
    options.max_speakers = value(&fields.max_speakers)
        .map(|v| parse_speaker_count("max_speakers", &v))
        .transpose()?;

    if let (Some(min), Some(max)) = (options.min_speakers, options.max_speakers) {
        if min > max {
            return Err(GatewayError::invalid(
                "min_speakers",
                format!("min_speakers ({min}) exceeds max_speakers ({max})"),
            ));
        }
    }

    if options.diarize && options.hf_token.is_none() {
        return Err(GatewayError::MissingCredential);
    }

    Ok(options)
}

fn parse_language(raw: &str) -> Result<Option<String>, GatewayError> {
    let lang = raw.to_ascii_lowercase();
    if lang == "auto" {
        return Ok(None);
    }
    if is_supported_language(&lang) {
        return Ok(Some(lang));
    }
    Err(GatewayError::invalid(
        "language",
        format!("'{raw}' is not a language whisper supports; use a code such as 'en' or 'auto'"),
    ))
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, GatewayError> {
    parse_flag(raw)
        .ok_or_else(|| GatewayError::invalid(field, format!("'{raw}' is not a boolean")))
}

fn parse_speaker_count(field: &str, raw: &str) -> Result<u32, GatewayError> {
    match raw.parse::<u32>() {
        Ok(count) if count >= 1 => Ok(count),
        _ => Err(GatewayError::invalid(
            field,
            format!("'{raw}' is not a positive integer"),
        )),
    }
}
