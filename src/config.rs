//! Process configuration.
//!
//! A [`Config`] is constructed once at startup from `SCOREFORGE_*`
//! environment variables and handed by value into the store, manager, and
//! pipeline constructors. Nothing in the crate reads the environment after
//! startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which notation engraving backend renders the PDF artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngraverKind {
    /// LilyPond via `musicxml2ly` + `lilypond` subprocesses.
    Lilypond,
    /// MuseScore via a single `mscore` subprocess.
    Musescore,
    /// Built-in placeholder that writes a minimal one-page PDF.
    Placeholder,
}

impl FromStr for EngraverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lilypond" => Ok(Self::Lilypond),
            "musescore" => Ok(Self::Musescore),
            "placeholder" => Ok(Self::Placeholder),
            other => Err(format!("unknown engraver backend: {other}")),
        }
    }
}

/// Backend configuration, resolved once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for job records, workdirs, and served artifacts.
    pub storage_dir: PathBuf,
    /// How long finished (or abandoned) jobs are kept before reclamation.
    pub job_retention: Duration,
    /// Selected engraving backend.
    pub engraver: EngraverKind,
    /// Override path for the engraver executable.
    pub engraver_path: Option<PathBuf>,
    /// Override path for the `musicxml2ly` converter (LilyPond backend only).
    pub musicxml2ly_path: Option<PathBuf>,
    /// Path to the external pitch-detection transcriber executable.
    pub basic_pitch_path: Option<PathBuf>,
    /// Override path for the pitch-detection model handed to the transcriber.
    pub basic_pitch_model: Option<PathBuf>,
    /// Maximum accepted upload size in megabytes.
    pub max_file_mb: u64,
    /// Maximum accepted audio duration in seconds.
    pub max_duration_seconds: u64,
    /// MIME types accepted for upload.
    pub allowed_mime_types: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage"),
            job_retention: Duration::from_secs(30 * 60),
            engraver: EngraverKind::Lilypond,
            engraver_path: None,
            musicxml2ly_path: None,
            basic_pitch_path: None,
            basic_pitch_model: None,
            max_file_mb: 20,
            max_duration_seconds: 5 * 60,
            allowed_mime_types: [
                "audio/wav",
                "audio/x-wav",
                "audio/mpeg",
                "audio/mp3",
                "audio/x-m4a",
                "audio/flac",
                "audio/x-flac",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Config {
    /// Build a config from `SCOREFORGE_*` environment variables, falling
    /// back to defaults for anything unset. Invalid values are rejected
    /// rather than silently defaulted.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(dir) = env_var("SCOREFORGE_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(minutes) = env_var("SCOREFORGE_JOB_RETENTION_MINUTES") {
            let minutes: u64 = minutes
                .parse()
                .map_err(|_| format!("invalid SCOREFORGE_JOB_RETENTION_MINUTES: {minutes}"))?;
            config.job_retention = Duration::from_secs(minutes * 60);
        }
        if let Some(engraver) = env_var("SCOREFORGE_ENGRAVER") {
            config.engraver = engraver.parse()?;
        }
        if let Some(path) = env_var("SCOREFORGE_ENGRAVER_PATH") {
            config.engraver_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var("SCOREFORGE_MUSICXML2LY_PATH") {
            config.musicxml2ly_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var("SCOREFORGE_BASIC_PITCH_PATH") {
            config.basic_pitch_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var("SCOREFORGE_BASIC_PITCH_MODEL") {
            config.basic_pitch_model = Some(PathBuf::from(path));
        }
        if let Some(mb) = env_var("SCOREFORGE_MAX_FILE_MB") {
            config.max_file_mb = mb
                .parse()
                .map_err(|_| format!("invalid SCOREFORGE_MAX_FILE_MB: {mb}"))?;
        }
        if let Some(seconds) = env_var("SCOREFORGE_MAX_DURATION_SECONDS") {
            config.max_duration_seconds = seconds
                .parse()
                .map_err(|_| format!("invalid SCOREFORGE_MAX_DURATION_SECONDS: {seconds}"))?;
        }
        if let Some(types) = env_var("SCOREFORGE_ALLOWED_MIME_TYPES") {
            config.allowed_mime_types = types
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }

        Ok(config)
    }

    /// Maximum upload size in bytes.
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb * 1024 * 1024
    }

    /// Whether a declared content type is accepted for upload.
    pub fn accepts_mime(&self, mime: &str) -> bool {
        self.allowed_mime_types.iter().any(|m| m == mime)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
