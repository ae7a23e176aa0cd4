//! Pitch-detection transcriber implementations.
//!
//! [`Transcriber`] is the capability seam between the pipeline and pitch
//! detection. The production implementation shells out to an external
//! Basic Pitch CLI that drops a MIDI file into an output directory; the
//! stub produces a fixed C-major scale and exists both as the fallback
//! when the model tooling is absent and as the deterministic path for
//! tests and demo deployments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::job::Job;
use crate::pipeline::{NoteEvent, midi};

/// Turns uploaded audio into note events.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        workdir: &Path,
        job: &Job,
    ) -> Result<Vec<NoteEvent>, PipelineError>;
}

/// Deterministic fallback: an ascending C-major scale, one note every
/// half second.
pub struct StubTranscriber;

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        _audio: &Path,
        _workdir: &Path,
        _job: &Job,
    ) -> Result<Vec<NoteEvent>, PipelineError> {
        Ok([60u8, 62, 64, 65, 67, 69, 71, 72]
            .iter()
            .enumerate()
            .map(|(i, &pitch)| NoteEvent {
                onset: i as f64 * 0.5,
                duration: 0.5,
                pitch,
                velocity: 90,
            })
            .collect())
    }
}

/// Runs the external `basic-pitch` CLI and ingests the MIDI it produces.
///
/// Invocation contract: `basic-pitch [--model <path>] <output-dir>
/// <audio>`; the tool writes one or more `.mid` files into the output
/// directory. A missing executable is reported as
/// [`PipelineError::TranscriberUnavailable`], which the pipeline answers
/// with its one-shot stub fallback.
pub struct BasicPitchTranscriber {
    executable: PathBuf,
    model: Option<PathBuf>,
}

impl BasicPitchTranscriber {
    pub fn new(executable: PathBuf, model: Option<PathBuf>) -> Self {
        Self { executable, model }
    }
}

#[async_trait]
impl Transcriber for BasicPitchTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        workdir: &Path,
        job: &Job,
    ) -> Result<Vec<NoteEvent>, PipelineError> {
        let out_dir = workdir.join("model-out");
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut command = tokio::process::Command::new(&self.executable);
        if let Some(model) = &self.model {
            command.arg("--model").arg(model);
        }
        command.arg(&out_dir).arg(audio);

        tracing::debug!(job_id = %job.id, "invoking transcriber {:?}", self.executable);
        let output = match command.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::TranscriberUnavailable {
                    reason: format!("{} not found", self.executable.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Transcription {
                reason: format!(
                    "transcriber exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        let midi_path = first_midi_in(&out_dir).await?;
        let data = tokio::fs::read(&midi_path).await?;
        midi::read_smf(&data)
    }
}

async fn first_midi_in(dir: &Path) -> Result<PathBuf, PipelineError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("mid") {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Transcription {
            reason: "transcriber produced no MIDI output".to_string(),
        })
}
