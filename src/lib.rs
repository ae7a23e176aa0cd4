//! ScoreForge: an asynchronous audio-to-sheet-music transcription backend.
//!
//! A client uploads an audio recording, the service transcribes it to
//! musical notation, and PDF/MusicXML/MIDI artifacts become available
//! through status lookups. The crate is organized around a durable
//! file-backed job store ([`job::JobStore`]), a dispatch-loop job manager
//! ([`job::JobManager`]) that survives process restarts, the transcription
//! pipeline ([`pipeline::TranscriptionPipeline`]) behind the
//! [`pipeline::Processor`] seam, and a thin axum HTTP surface ([`api`]).

pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
