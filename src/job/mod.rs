//! The job entity and its lifecycle state machine.
//!
//! A [`Job`] is one transcription request and everything it accumulates:
//! submission options, lifecycle status, progress, artifacts, and the
//! private working directory holding the uploaded audio and generated
//! files. Jobs move `queued → running → {done, error}`; the only backward
//! transition is the startup-recovery reset of an orphaned `running` job
//! back to `queued` (see [`manager::JobManager::load_existing_jobs`]).

pub mod manager;
pub mod store;

pub use manager::JobManager;
pub use store::JobStore;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the dispatch queue.
    Queued,
    /// Picked up by the dispatch loop, processing in flight.
    Running,
    /// Finished successfully; artifacts are available.
    Done,
    /// Failed; `error` carries the reason. Terminal.
    Error,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Clef requested for the rendered score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClefChoice {
    #[default]
    Treble,
    Alto,
    Tenor,
    Bass,
}

impl ClefChoice {
    /// MusicXML clef sign and staff line.
    pub fn sign_and_line(self) -> (&'static str, u8) {
        match self {
            ClefChoice::Treble => ("G", 2),
            ClefChoice::Alto => ("C", 3),
            ClefChoice::Tenor => ("C", 4),
            ClefChoice::Bass => ("F", 4),
        }
    }
}

impl std::str::FromStr for ClefChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "treble" => Ok(ClefChoice::Treble),
            "alto" => Ok(ClefChoice::Alto),
            "tenor" => Ok(ClefChoice::Tenor),
            "bass" => Ok(ClefChoice::Bass),
            other => Err(format!("unknown clef: {other}")),
        }
    }
}

/// Instrument the uploaded recording is assumed to contain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentChoice {
    #[default]
    Piano,
    Guitar,
    Violin,
    Cello,
    Flute,
    Voice,
}

impl InstrumentChoice {
    /// General MIDI program number used for the MIDI artifact.
    pub fn midi_program(self) -> u8 {
        match self {
            InstrumentChoice::Piano => 0,
            InstrumentChoice::Guitar => 24,
            InstrumentChoice::Violin => 40,
            InstrumentChoice::Cello => 42,
            InstrumentChoice::Flute => 73,
            InstrumentChoice::Voice => 52,
        }
    }
}

impl std::str::FromStr for InstrumentChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "piano" => Ok(InstrumentChoice::Piano),
            "guitar" => Ok(InstrumentChoice::Guitar),
            "violin" => Ok(InstrumentChoice::Violin),
            "cello" => Ok(InstrumentChoice::Cello),
            "flute" => Ok(InstrumentChoice::Flute),
            "voice" => Ok(InstrumentChoice::Voice),
            other => Err(format!("unknown instrument: {other}")),
        }
    }
}

/// Rhythmic grid note onsets and durations are snapped to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationGrid {
    Quarter,
    #[default]
    Eighth,
    Sixteenth,
}

impl QuantizationGrid {
    /// Grid step expressed in beats (a quarter note is one beat).
    pub fn step_beats(self) -> f64 {
        match self {
            QuantizationGrid::Quarter => 1.0,
            QuantizationGrid::Eighth => 0.5,
            QuantizationGrid::Sixteenth => 0.25,
        }
    }
}

impl std::str::FromStr for QuantizationGrid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quarter" => Ok(QuantizationGrid::Quarter),
            "eighth" => Ok(QuantizationGrid::Eighth),
            "sixteenth" => Ok(QuantizationGrid::Sixteenth),
            other => Err(format!("unknown quantization grid: {other}")),
        }
    }
}

/// Immutable transcription parameters captured at submission time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub clef: ClefChoice,
    #[serde(default)]
    pub instrument: InstrumentChoice,
    /// Tempo override in BPM; when unset the pipeline detects or defaults.
    #[serde(default)]
    pub tempo: Option<u32>,
    /// Override key detection with an explicit key, e.g. "C major".
    #[serde(default)]
    pub force_key: Option<String>,
    #[serde(default = "default_true")]
    pub detect_time_signature: bool,
    #[serde(default)]
    pub quantization: QuantizationGrid,
    #[serde(default)]
    pub loose_quantization: bool,
}

fn default_true() -> bool {
    true
}

/// Structured metadata describing a finished transcription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub time_signature: Option<String>,
    #[serde(default)]
    pub tempo: Option<u32>,
    #[serde(default)]
    pub note_count: Option<usize>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// Kind of output artifact a finished job exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Pdf,
    Musicxml,
    Midi,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Musicxml => "musicxml",
            ArtifactKind::Midi => "midi",
        }
    }
}

/// One transcription request and its accumulated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique, URL-safe identifier. Immutable.
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Instant after which the job and its files are reclaimed.
    pub expires_at: DateTime<Utc>,
    pub options: JobOptions,
    pub status: JobStatus,
    /// 0-100, monotonically non-decreasing within a run. Advisory.
    pub progress: u8,
    /// Failure description, present only when `status == Error`.
    #[serde(default)]
    pub error: Option<String>,
    /// Transcription metadata, present only when `status == Done`.
    #[serde(default)]
    pub meta: Option<JobMeta>,
    /// Generated output files, populated only on success.
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactKind, PathBuf>,
    /// Private per-job directory for the upload and generated files.
    pub workdir: PathBuf,
}

impl Job {
    /// Create a fresh `queued` job rooted under `storage_dir`.
    ///
    /// The workdir path is derived here; the caller (the manager) creates
    /// the directory and persists the record.
    pub fn create(options: JobOptions, retention: Duration, storage_dir: &Path) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::minutes(30));
        Self {
            workdir: storage_dir.join(&id),
            id,
            created_at: now,
            expires_at,
            options,
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            meta: None,
            artifacts: BTreeMap::new(),
        }
    }

    /// Whether the job's retention window has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
