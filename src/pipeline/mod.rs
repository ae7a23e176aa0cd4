//! The transcription pipeline.
//!
//! The job manager only knows the [`Processor`] contract: consume a job,
//! mutate its progress/meta/artifacts, fail with a [`PipelineError`] on
//! anything unrecoverable. [`TranscriptionPipeline`] is the production
//! implementation; [`NullProcessor`] satisfies the contract for tests.
//!
//! Stages, with the advisory progress checkpoint each one stamps:
//!
//! 1. locate + probe the uploaded audio (10)
//! 2. transcribe to note events (30) via the external model subprocess,
//!    with a one-shot fallback to the built-in stub when unavailable
//! 3. snap onsets/durations to the requested grid (60)
//! 4. emit MusicXML and build metadata (75)
//! 5. write the quantized MIDI and engrave the PDF (90)

pub mod audio;
pub mod engrave;
pub mod midi;
pub mod musicxml;
pub mod quantize;
pub mod transcribe;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{Config, EngraverKind};
use crate::error::PipelineError;
use crate::job::Job;
use engrave::{Engraver, LilypondEngraver, MusescoreEngraver, PlaceholderEngraver};
use transcribe::{BasicPitchTranscriber, StubTranscriber, Transcriber};

/// Default tempo in BPM when the client gives no override and the
/// transcriber reports none.
pub const DEFAULT_TEMPO: u32 = 120;

/// Peak amplitude below which an upload is rejected as silent.
const SILENCE_THRESHOLD: f32 = 1e-4;

/// A single detected note, in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    /// Onset from the start of the recording, in seconds.
    pub onset: f64,
    /// Sounding length, in seconds.
    pub duration: f64,
    /// MIDI note number.
    pub pitch: u8,
    /// MIDI velocity, 1-127.
    pub velocity: u8,
}

/// Contract between the job manager and the transcription machinery.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one job to completion, mutating its progress, metadata,
    /// and artifacts in place. Any error is terminal for this job.
    async fn process(&self, job: &mut Job) -> Result<(), PipelineError>;
}

/// Processor that completes immediately without touching the job.
/// Satisfies the [`Processor`] contract for manager and API tests.
pub struct NullProcessor;

#[async_trait]
impl Processor for NullProcessor {
    async fn process(&self, _job: &mut Job) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// The production audio-to-notation pipeline.
pub struct TranscriptionPipeline {
    transcriber: Box<dyn Transcriber>,
    /// Whether `transcriber` is the external model (and the stub is a
    /// legitimate fallback) or already the stub itself.
    has_primary: bool,
    engraver: Box<dyn Engraver>,
}

impl TranscriptionPipeline {
    /// Select transcriber and engraver implementations from configuration.
    pub fn new(config: &Config) -> Self {
        let (transcriber, has_primary): (Box<dyn Transcriber>, bool) =
            match &config.basic_pitch_path {
                Some(path) => (
                    Box::new(BasicPitchTranscriber::new(
                        path.clone(),
                        config.basic_pitch_model.clone(),
                    )),
                    true,
                ),
                None => (Box::new(StubTranscriber), false),
            };

        let engraver: Box<dyn Engraver> = match config.engraver {
            EngraverKind::Lilypond => Box::new(LilypondEngraver::new(
                config.engraver_path.clone(),
                config.musicxml2ly_path.clone(),
            )),
            EngraverKind::Musescore => {
                Box::new(MusescoreEngraver::new(config.engraver_path.clone()))
            }
            EngraverKind::Placeholder => Box::new(PlaceholderEngraver),
        };

        Self {
            transcriber,
            has_primary,
            engraver,
        }
    }

    /// Transcribe the upload, substituting the stub exactly once if the
    /// configured transcriber cannot run in this environment. Any other
    /// failure, including a failure of the stub itself, is terminal.
    async fn transcribe_with_fallback(
        &self,
        audio: &Path,
        workdir: &Path,
        job: &Job,
    ) -> Result<Vec<NoteEvent>, PipelineError> {
        match self.transcriber.transcribe(audio, workdir, job).await {
            Ok(notes) => Ok(notes),
            Err(PipelineError::TranscriberUnavailable { reason }) if self.has_primary => {
                tracing::warn!(
                    job_id = %job.id,
                    "transcriber unavailable ({reason}), falling back to stub"
                );
                StubTranscriber.transcribe(audio, workdir, job).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Processor for TranscriptionPipeline {
    async fn process(&self, job: &mut Job) -> Result<(), PipelineError> {
        let workdir = job.workdir.clone();
        if !workdir.is_dir() {
            return Err(PipelineError::MissingWorkdir);
        }
        let upload = find_upload(&workdir)?;

        job.progress = 10;
        if upload.extension().and_then(|e| e.to_str()) == Some("wav") {
            let path = upload.clone();
            let info = tokio::task::spawn_blocking(move || audio::probe_wav(&path))
                .await
                .map_err(|e| PipelineError::Io(std::io::Error::other(e)))??;
            if info.peak < SILENCE_THRESHOLD {
                return Err(PipelineError::SilentAudio);
            }
        }

        job.progress = 30;
        let notes = self.transcribe_with_fallback(&upload, &workdir, job).await?;
        if notes.is_empty() {
            return Err(PipelineError::Transcription {
                reason: "no notes detected".to_string(),
            });
        }

        job.progress = 60;
        let tempo = job.options.tempo.unwrap_or(DEFAULT_TEMPO);
        let quantized = quantize::quantize(
            &notes,
            tempo,
            job.options.quantization,
            job.options.loose_quantization,
        );

        job.progress = 75;
        let score = musicxml::ScoreBuilder::new(&job.options, tempo).build(&quantized);
        let musicxml_path = workdir.join("score.musicxml");
        tokio::fs::write(&musicxml_path, score.musicxml.as_bytes()).await?;

        let midi_path = workdir.join("transcription.mid");
        let smf = midi::write_smf(&quantized, tempo, job.options.instrument.midi_program());
        tokio::fs::write(&midi_path, smf).await?;
        job.meta = Some(score.meta);

        job.progress = 90;
        let pdf_path = workdir.join("score.pdf");
        self.engraver.engrave(&musicxml_path, &pdf_path).await?;

        job.artifacts.insert(crate::job::ArtifactKind::Midi, midi_path);
        job.artifacts
            .insert(crate::job::ArtifactKind::Musicxml, musicxml_path);
        job.artifacts.insert(crate::job::ArtifactKind::Pdf, pdf_path);
        Ok(())
    }
}

/// The uploaded audio file: the lexicographically first `upload*` entry in
/// the workdir.
fn find_upload(workdir: &Path) -> Result<PathBuf, PipelineError> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(workdir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("upload"))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next().ok_or(PipelineError::MissingUpload)
}
