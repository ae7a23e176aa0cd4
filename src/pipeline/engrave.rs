//! Notation engraving backends.
//!
//! [`Engraver`] turns the MusicXML artifact into the PDF artifact. The
//! LilyPond and MuseScore backends drive external executables; the
//! placeholder backend writes a minimal self-contained PDF so the service
//! stays end-to-end functional on hosts with no engraving toolchain.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PipelineError;

/// Renders a MusicXML score to PDF.
#[async_trait]
pub trait Engraver: Send + Sync {
    async fn engrave(&self, musicxml: &Path, pdf: &Path) -> Result<(), PipelineError>;
}

/// LilyPond backend: `musicxml2ly` converts to `.ly`, then `lilypond`
/// renders the PDF.
pub struct LilypondEngraver {
    lilypond: PathBuf,
    musicxml2ly: PathBuf,
}

impl LilypondEngraver {
    /// When no explicit `musicxml2ly` path is given, look for it next to
    /// the `lilypond` executable, falling back to `$PATH`.
    pub fn new(lilypond: Option<PathBuf>, musicxml2ly: Option<PathBuf>) -> Self {
        let lilypond = lilypond.unwrap_or_else(|| PathBuf::from("lilypond"));
        let musicxml2ly = musicxml2ly.unwrap_or_else(|| {
            match lilypond.parent() {
                Some(parent) if parent != Path::new("") => parent.join("musicxml2ly"),
                _ => PathBuf::from("musicxml2ly"),
            }
        });
        Self {
            lilypond,
            musicxml2ly,
        }
    }
}

#[async_trait]
impl Engraver for LilypondEngraver {
    async fn engrave(&self, musicxml: &Path, pdf: &Path) -> Result<(), PipelineError> {
        let ly = musicxml.with_extension("ly");
        run_engraver(&self.musicxml2ly, |cmd| {
            cmd.arg(musicxml).arg("-o").arg(&ly);
        })
        .await?;
        // LilyPond appends the .pdf suffix itself.
        run_engraver(&self.lilypond, |cmd| {
            cmd.arg("-o").arg(pdf.with_extension("")).arg(&ly);
        })
        .await?;
        if !pdf.is_file() {
            return Err(PipelineError::Engrave {
                reason: "lilypond exited cleanly but produced no PDF".to_string(),
            });
        }
        Ok(())
    }
}

/// MuseScore backend: one `mscore -o out.pdf in.musicxml` invocation.
pub struct MusescoreEngraver {
    executable: PathBuf,
}

impl MusescoreEngraver {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self {
            executable: executable.unwrap_or_else(|| PathBuf::from("mscore")),
        }
    }
}

#[async_trait]
impl Engraver for MusescoreEngraver {
    async fn engrave(&self, musicxml: &Path, pdf: &Path) -> Result<(), PipelineError> {
        run_engraver(&self.executable, |cmd| {
            cmd.arg("-o").arg(pdf).arg(musicxml);
        })
        .await
    }
}

async fn run_engraver(
    executable: &Path,
    configure: impl FnOnce(&mut tokio::process::Command),
) -> Result<(), PipelineError> {
    let mut command = tokio::process::Command::new(executable);
    configure(&mut command);
    let output = match command.output().await {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::Engrave {
                reason: format!("{} not found", executable.display()),
            });
        }
        Err(e) => return Err(e.into()),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::Engrave {
            reason: format!(
                "{} exited with {}: {}",
                executable.display(),
                output.status,
                stderr.trim()
            ),
        });
    }
    Ok(())
}

/// Fallback backend: writes a minimal one-page PDF naming the score it
/// stands in for.
pub struct PlaceholderEngraver;

#[async_trait]
impl Engraver for PlaceholderEngraver {
    async fn engrave(&self, musicxml: &Path, pdf: &Path) -> Result<(), PipelineError> {
        let source = musicxml
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("score.musicxml");
        let document = minimal_pdf(&[
            "ScoreForge Placeholder Score".to_string(),
            format!("Generated from {source}"),
        ]);
        tokio::fs::write(pdf, document).await?;
        Ok(())
    }
}

/// Assemble a valid single-page PDF with one line of text per entry.
fn minimal_pdf(lines: &[String]) -> Vec<u8> {
    let mut content = String::from("BT /F1 16 Tf 72 720 Td\n");
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            content.push_str("0 -20 Td\n");
        }
        let escaped = line.replace('\\', "\\\\").replace('(', "\\(").replace(')', "\\)");
        content.push_str(&format!("({escaped}) Tj\n"));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
         /Resources << /Font << /F1 5 0 R >> >> /Contents 4 0 R >>"
            .to_string(),
        format!("<< /Length {} >>\nstream\n{content}endstream", content.len()),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.push_str(&format!("{} 0 obj\n{body}\nendobj\n", i + 1));
    }
    let xref_offset = out.len();
    out.push_str(&format!("xref\n0 {}\n", objects.len() + 1));
    out.push_str("0000000000 65535 f \n");
    for offset in offsets {
        out.push_str(&format!("{offset:010} 00000 n \n"));
    }
    out.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        objects.len() + 1
    ));
    out.into_bytes()
}
