//! Error types for the transcription backend.

/// Errors raised by the durable job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record exists on disk but could not be parsed.
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// Serialization of a job record failed.
    #[error("failed to serialize job record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while processing a job through the transcription pipeline.
///
/// These never escape the per-job processing task: the manager records the
/// message into the job's `error` field and moves the job to its terminal
/// `error` state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The job's working directory is missing.
    #[error("job workdir not initialised")]
    MissingWorkdir,

    /// No uploaded audio file was found in the workdir.
    #[error("uploaded audio missing")]
    MissingUpload,

    /// Failed to decode the uploaded audio.
    #[error("failed to decode audio: {reason}")]
    Decode { reason: String },

    /// The uploaded audio contains no signal above the silence threshold.
    #[error("uploaded audio appears to be silent")]
    SilentAudio,

    /// The configured transcriber cannot run in this environment.
    ///
    /// This is the one failure the pipeline recovers from: it substitutes
    /// the stub transcriber exactly once and continues.
    #[error("transcriber unavailable: {reason}")]
    TranscriberUnavailable { reason: String },

    /// Transcription ran but failed to produce usable output.
    #[error("transcription failed: {reason}")]
    Transcription { reason: String },

    /// The engraving step failed.
    #[error("engraving failed: {reason}")]
    Engrave { reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
