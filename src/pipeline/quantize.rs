//! Grid quantization of detected note events.
//!
//! Converts wall-clock note events into beat-aligned notes: onsets and
//! releases snap to the nearest grid step at the job's tempo, every note
//! keeps at least one step of duration, and degenerate events are dropped.
//! Loose quantization halves the step, preserving more of the original
//! phrasing at the cost of a busier score.

use crate::job::QuantizationGrid;
use crate::pipeline::NoteEvent;

/// A note aligned to the quantization grid, in beats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizedNote {
    /// Onset in beats from the start of the piece; a multiple of the step.
    pub onset_beats: f64,
    /// Duration in beats; at least one grid step.
    pub duration_beats: f64,
    pub pitch: u8,
    pub velocity: u8,
}

/// Snap `notes` to the grid at `tempo` BPM, sorted by onset.
pub fn quantize(
    notes: &[NoteEvent],
    tempo: u32,
    grid: QuantizationGrid,
    loose: bool,
) -> Vec<QuantizedNote> {
    let mut step = grid.step_beats();
    if loose {
        step /= 2.0;
    }
    let beats_per_second = f64::from(tempo) / 60.0;

    let mut quantized: Vec<QuantizedNote> = notes
        .iter()
        .filter(|note| note.duration > 0.0 && note.velocity > 0)
        .map(|note| {
            let onset = snap(note.onset * beats_per_second, step);
            let release = snap((note.onset + note.duration) * beats_per_second, step);
            QuantizedNote {
                onset_beats: onset,
                duration_beats: (release - onset).max(step),
                pitch: note.pitch,
                velocity: note.velocity,
            }
        })
        .collect();
    quantized.sort_by(|a, b| {
        a.onset_beats
            .partial_cmp(&b.onset_beats)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pitch.cmp(&b.pitch))
    });
    quantized
}

fn snap(beats: f64, step: f64) -> f64 {
    (beats / step).round() * step
}
