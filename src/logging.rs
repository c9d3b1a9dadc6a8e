use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
};

pub const PIPELINE_TARGET: &str = "whisper_gateway::pipeline";
const PREVIEW_CHAR_LIMIT: usize = 120;
const TARGET_GUTTER_WIDTH: usize = 28;
const STAGE_NAME_WIDTH: usize = 10;
const TIMESTAMP_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Per-request timing summary, rendered as a box under the log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub request_id: String,
    pub model: String,
    pub file: String,
    pub audio_secs: f64,
    pub stages: Vec<StageRecord>,
    pub outcome: String,
    pub text_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
}

impl StageRecord {
    pub fn new(name: impl Into<String>, elapsed: Duration, detail: Option<String>) -> Self {
        Self {
            name: name.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            detail,
        }
    }
}

impl PipelineRecord {
    pub fn total_ms(&self) -> u64 {
        self.stages.iter().map(|stage| stage.elapsed_ms).sum()
    }

    /// Processing time relative to audio length; below 1.0 is faster than real time.
    pub fn real_time_factor(&self) -> Option<f64> {
        (self.audio_secs > 0.0).then(|| self.total_ms() as f64 / 1000.0 / self.audio_secs)
    }

    pub fn render_pretty(&self, use_color: bool) -> String {
        let mut lines = Vec::new();
        let rtf = self
            .real_time_factor()
            .map(|rtf| format!(", rtf: {:.2}", rtf))
            .unwrap_or_default();
        lines.push(format!(
            "┌─ Request {} (model: {}, audio: {:.1}s, total: {}ms{})",
            self.request_id,
            self.model,
            self.audio_secs,
            self.total_ms(),
            rtf
        ));
        push_body_line(&mut lines, format!("FILE: {}", self.file));

        for stage in &self.stages {
            let timing = format!("{:>7}ms", stage.elapsed_ms);
            let timing = if use_color {
                timing.dimmed().to_string()
            } else {
                timing
            };
            let mut line = format!(
                "• {:<width$} {}",
                stage.name,
                timing,
                width = STAGE_NAME_WIDTH
            );
            if let Some(detail) = &stage.detail {
                line.push_str("  ");
                line.push_str(detail);
            }
            push_body_line(&mut lines, line);
        }

        let outcome = if use_color {
            if self.outcome == "ok" {
                self.outcome.as_str().green().to_string()
            } else {
                self.outcome.as_str().red().to_string()
            }
        } else {
            self.outcome.clone()
        };
        push_body_line(&mut lines, format!("OUT : {}", outcome));
        if !self.text_preview.is_empty() {
            push_body_line(
                &mut lines,
                format!("TEXT: {}", preview_value(&self.text_preview, use_color)),
            );
        }
        lines.push("└─".to_string());

        lines.join("\n")
    }
}

fn escape_fragment(value: &str) -> String {
    let mut rendered = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\n' => rendered.push('⏎'),
            '\t' => rendered.push('⇥'),
            '\r' => rendered.push('␍'),
            c if c.is_control() => rendered.push_str(&format!("\\u{{{:04X}}}", c as u32)),
            c => rendered.push(c),
        }
    }
    rendered
}

fn push_body_line(lines: &mut Vec<String>, content: String) {
    lines.push(format!("│ {}", content));
}

fn preview_value(value: &str, use_color: bool) -> String {
    let mut preview: String = value.chars().take(PREVIEW_CHAR_LIMIT).collect();
    if value.chars().count() > PREVIEW_CHAR_LIMIT {
        preview.push_str("...");
    }
    let escaped = escape_fragment(&preview);
    if use_color {
        escaped.cyan().to_string()
    } else {
        escaped
    }
}

#[derive(Debug, Default)]
struct PipelineEventVisitor {
    pipeline_json: Option<String>,
}

impl tracing::field::Visit for PipelineEventVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "pipeline_json" {
            self.pipeline_json = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "pipeline_json" && self.pipeline_json.is_none() {
            self.pipeline_json = Some(format!("{value:?}"));
        }
    }
}

/// Compact single-line formatter that expands pipeline records into a box.
#[derive(Default)]
pub struct GatewayLogFormatter;

impl GatewayLogFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl<S, N> FormatEvent<S, N> for GatewayLogFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let use_color = writer.has_ansi_escapes();

        write_prefix(&mut writer, metadata, use_color)?;

        if metadata.target() == PIPELINE_TARGET {
            let mut visitor = PipelineEventVisitor::default();
            event.record(&mut visitor);
            if let Some(json) = visitor.pipeline_json {
                writer.write_str("transcription pipeline\n")?;
                match serde_json::from_str::<PipelineRecord>(&json) {
                    Ok(record) => writer.write_str(&record.render_pretty(use_color))?,
                    Err(err) => {
                        writer.write_str("│ Failed to render pipeline record: ")?;
                        writer.write_str(&err.to_string())?;
                    }
                }
                return writer.write_char('\n');
            }
        }

        ctx.format_fields(writer.by_ref(), event)?;
        writer.write_char('\n')
    }
}

pub fn record_pipeline(record: &PipelineRecord) {
    if !tracing::enabled!(target: PIPELINE_TARGET, Level::DEBUG) {
        return;
    }
    match serde_json::to_string(record) {
        Ok(json) => tracing::event!(
            target: PIPELINE_TARGET,
            Level::DEBUG,
            pipeline_json = json.as_str(),
            request_id = record.request_id.as_str(),
            total_ms = record.total_ms(),
            "transcription pipeline"
        ),
        Err(_) => tracing::event!(
            target: PIPELINE_TARGET,
            Level::DEBUG,
            request_id = record.request_id.as_str(),
            "transcription pipeline (serialization failure)"
        ),
    }
}

fn write_prefix(
    writer: &mut Writer<'_>,
    metadata: &tracing::Metadata<'_>,
    use_color: bool,
) -> fmt::Result {
    let timestamp_plain = format_timestamp();
    let timestamp_display = if use_color {
        timestamp_plain.as_str().dimmed().to_string()
    } else {
        timestamp_plain
    };
    writer.write_str(&timestamp_display)?;

    let level_plain = format!("{:>5}", metadata.level());
    let level_has_leading_space = level_plain.starts_with(' ');
    let level_display = if use_color {
        color_level(&level_plain, *metadata.level())
    } else {
        level_plain.clone()
    };
    if level_has_leading_space {
        writer.write_str(&level_display)?;
    } else {
        writer.write_char(' ')?;
        writer.write_str(&level_display)?;
    }
    writer.write_char(' ')?;

    let target_text = format!("{:<width$}", metadata.target(), width = TARGET_GUTTER_WIDTH);
    let target_text = if use_color {
        target_text.blue().dimmed().to_string()
    } else {
        target_text
    };
    writer.write_str(&target_text)?;
    writer.write_str(": ")?;

    Ok(())
}

fn color_level(text: &str, level: Level) -> String {
    match level {
        Level::ERROR => text.red().bold().to_string(),
        Level::WARN => text.yellow().bold().to_string(),
        Level::INFO => text.green().to_string(),
        Level::DEBUG => text.cyan().to_string(),
        Level::TRACE => text.dimmed().to_string(),
    }
}

fn format_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| "0000-00-00 00:00:00".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PipelineRecord {
        PipelineRecord {
            request_id: "0192".into(),
            model: "base".into(),
            file: "meeting.mp3".into(),
            audio_secs: 10.0,
            stages: vec![
                StageRecord::new("decode", Duration::from_millis(120), None),
                StageRecord::new(
                    "transcribe",
                    Duration::from_millis(4880),
                    Some("3 segments".into()),
                ),
            ],
            outcome: "ok".into(),
            text_preview: "Hello\nthere".into(),
        }
    }

    #[test]
    fn renders_plain_box() {
        let rendered = record().render_pretty(false);
        let lines: Vec<&str> = rendered.lines().collect();

        assert!(lines[0].starts_with("┌─ Request 0192"));
        assert!(lines[0].contains("total: 5000ms"));
        assert!(lines[0].contains("rtf: 0.50"));
        assert!(rendered.contains("transcribe"));
        assert!(rendered.contains("3 segments"));
        assert!(rendered.contains("TEXT: Hello⏎there"));
        assert_eq!(*lines.last().unwrap(), "└─");
    }

    #[test]
    fn truncates_long_previews() {
        let long = "a".repeat(PREVIEW_CHAR_LIMIT + 10);
        let preview = preview_value(&long, false);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), PREVIEW_CHAR_LIMIT + 3);
    }

    #[test]
    fn unknown_audio_length_has_no_rtf() {
        let mut record = record();
        record.audio_secs = 0.0;
        assert!(record.real_time_factor().is_none());
    }
}
