use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{DiarizationError, DiarizationRequest, Diarizer, SpeakerTurn};

/// Environment variable the diarization command reads its model credential from.
pub const CREDENTIAL_ENV: &str = "HF_TOKEN";

/// Runs an external diarization program, e.g. a pyannote wrapper script.
///
/// The program is invoked as `<command> <args..> --audio <wav>
/// [--min-speakers N] [--max-speakers N]` and must print JSON turns on stdout,
/// either `[{"start","end","speaker"}]` or `{"segments": [...]}`.
pub struct CommandDiarizer {
    command: String,
    args: Vec<String>,
}

impl CommandDiarizer {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }

    pub fn initialize(&self) {
        info!("✅ Diarization command: {} {}", self.command, self.args.join(" "));
    }

    fn build_command(&self, request: &DiarizationRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg("--audio").arg(&request.wav_path);
        if let Some(min) = request.min_speakers {
            cmd.arg("--min-speakers").arg(min.to_string());
        }
        if let Some(max) = request.max_speakers {
            cmd.arg("--max-speakers").arg(max.to_string());
        }
        cmd.env(CREDENTIAL_ENV, &request.credential)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Diarizer for CommandDiarizer {
    async fn diarize(
        &self,
        request: DiarizationRequest,
    ) -> Result<Vec<SpeakerTurn>, DiarizationError> {
        let mut cmd = self.build_command(&request);
        debug!("Running diarizer on {:?}", request.wav_path);

        let output = cmd.output().await.map_err(|source| DiarizationError::Launch {
            command: self.command.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Diarizer stderr: {}", stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no error output")
                .trim()
                .to_string();
            return Err(DiarizationError::Failed {
                status: output.status.code(),
                message,
            });
        }

        let turns = parse_turns(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Diarizer returned {} speaker turns", turns.len());
        Ok(turns)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TurnsOutput {
    Bare(Vec<SpeakerTurn>),
    Wrapped { segments: Vec<SpeakerTurn> },
}

fn parse_turns(stdout: &str) -> Result<Vec<SpeakerTurn>, DiarizationError> {
    let parsed: TurnsOutput = serde_json::from_str(stdout.trim())
        .map_err(|err| DiarizationError::Output(err.to_string()))?;

    let mut turns = match parsed {
        TurnsOutput::Bare(turns) | TurnsOutput::Wrapped { segments: turns } => turns,
    };
    turns.retain(|turn| turn.end > turn.start);
    turns.sort_by(|a, b| a.start.total_cmp(&b.start));
    Ok(turns)
}
