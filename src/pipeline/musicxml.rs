//! MusicXML emission and transcription metadata.
//!
//! Renders quantized notes as a single-part score-partwise document and
//! derives the job metadata (key, time signature, tempo, note count,
//! duration) in the same pass. Key detection is a duration-weighted
//! pitch-class match against the major scales; a client-forced key wins
//! when it parses, and silently falls back to detection when it doesn't.

use crate::job::{JobMeta, JobOptions};
use crate::pipeline::quantize::QuantizedNote;

/// Displayed work title on every rendered score.
const SCORE_TITLE: &str = "ScoreForge Transcription";

/// MusicXML divisions per quarter note; 4 gives sixteenth-note resolution.
const DIVISIONS: u32 = 4;

/// Beats per measure; the service notates in common time.
const BEATS_PER_MEASURE: u32 = 4;

/// A rendered score plus the metadata extracted while rendering.
pub struct Score {
    pub musicxml: String,
    pub meta: JobMeta,
}

/// Builds the MusicXML document and [`JobMeta`] for one job.
pub struct ScoreBuilder<'a> {
    options: &'a JobOptions,
    tempo: u32,
}

impl<'a> ScoreBuilder<'a> {
    pub fn new(options: &'a JobOptions, tempo: u32) -> Self {
        Self { options, tempo }
    }

    pub fn build(&self, notes: &[QuantizedNote]) -> Score {
        let key = self
            .options
            .force_key
            .as_deref()
            .and_then(parse_key)
            .unwrap_or_else(|| detect_key(notes));

        let time_signature = self
            .options
            .detect_time_signature
            .then(|| format!("{BEATS_PER_MEASURE}/4"));

        let total_beats = notes
            .iter()
            .map(|n| n.onset_beats + n.duration_beats)
            .fold(0.0f64, f64::max);

        let meta = JobMeta {
            title: Some(SCORE_TITLE.to_string()),
            key: Some(key.name()),
            time_signature: time_signature.clone(),
            tempo: Some(self.tempo),
            note_count: Some(notes.len()),
            duration_seconds: Some(total_beats * 60.0 / f64::from(self.tempo)),
        };

        let musicxml = self.render(notes, &key, time_signature.is_some());
        Score { musicxml, meta }
    }

    fn render(&self, notes: &[QuantizedNote], key: &Key, with_time: bool) -> String {
        let mut xml = String::with_capacity(2048 + notes.len() * 160);
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(
            "<!DOCTYPE score-partwise PUBLIC \"-//Recordare//DTD MusicXML 4.0 Partwise//EN\" \
             \"http://www.musicxml.org/dtds/partwise.dtd\">\n",
        );
        xml.push_str("<score-partwise version=\"4.0\">\n");
        xml.push_str(&format!(
            "  <work><work-title>{SCORE_TITLE}</work-title></work>\n"
        ));
        xml.push_str("  <part-list>\n");
        xml.push_str(&format!(
            "    <score-part id=\"P1\"><part-name>{:?}</part-name></score-part>\n",
            self.options.instrument
        ));
        xml.push_str("  </part-list>\n");
        xml.push_str("  <part id=\"P1\">\n");

        let measure_divs = BEATS_PER_MEASURE * DIVISIONS;
        let (sign, line) = self.options.clef.sign_and_line();

        // Flatten to (onset_div, duration_div) with simultaneous onsets
        // grouped into chords.
        let placed = place_notes(notes);
        let total_divs = placed
            .iter()
            .map(|group| group.onset + group.duration)
            .max()
            .unwrap_or(0)
            .max(measure_divs);
        let measure_count = total_divs.div_ceil(measure_divs);

        let mut note_index = 0;
        for measure in 0..measure_count {
            let measure_start = measure * measure_divs;
            let measure_end = measure_start + measure_divs;
            xml.push_str(&format!("    <measure number=\"{}\">\n", measure + 1));

            if measure == 0 {
                xml.push_str("      <attributes>\n");
                xml.push_str(&format!("        <divisions>{DIVISIONS}</divisions>\n"));
                xml.push_str(&format!(
                    "        <key><fifths>{}</fifths><mode>{}</mode></key>\n",
                    key.fifths,
                    key.mode()
                ));
                if with_time {
                    xml.push_str(&format!(
                        "        <time><beats>{BEATS_PER_MEASURE}</beats><beat-type>4</beat-type></time>\n"
                    ));
                }
                xml.push_str(&format!(
                    "        <clef><sign>{sign}</sign><line>{line}</line></clef>\n"
                ));
                xml.push_str("      </attributes>\n");
                xml.push_str(&format!(
                    "      <direction placement=\"above\"><direction-type><metronome>\
                     <beat-unit>quarter</beat-unit><per-minute>{0}</per-minute>\
                     </metronome></direction-type><sound tempo=\"{0}\"/></direction>\n",
                    self.tempo
                ));
            }

            let mut cursor = measure_start;
            while note_index < placed.len() && placed[note_index].onset < measure_end {
                let group = &placed[note_index];
                if group.onset > cursor {
                    write_rest(&mut xml, group.onset - cursor);
                }
                // Truncate at the measure boundary; ties are not emitted.
                let duration = group.duration.min(measure_end - group.onset).max(1);
                for (i, &(pitch, _velocity)) in group.pitches.iter().enumerate() {
                    write_note(&mut xml, pitch, duration, i > 0);
                }
                cursor = group.onset + duration;
                note_index += 1;
            }
            if cursor < measure_end {
                write_rest(&mut xml, measure_end - cursor);
            }
            xml.push_str("    </measure>\n");
        }

        xml.push_str("  </part>\n");
        xml.push_str("</score-partwise>\n");
        xml
    }
}

/// Notes that share an onset, rendered as a chord.
struct PlacedGroup {
    onset: u32,
    duration: u32,
    pitches: Vec<(u8, u8)>,
}

fn place_notes(notes: &[QuantizedNote]) -> Vec<PlacedGroup> {
    let mut groups: Vec<PlacedGroup> = Vec::new();
    for note in notes {
        let onset = (note.onset_beats * f64::from(DIVISIONS)).round() as u32;
        let duration = ((note.duration_beats * f64::from(DIVISIONS)).round() as u32).max(1);
        match groups.last_mut() {
            Some(group) if group.onset == onset => {
                group.pitches.push((note.pitch, note.velocity));
                group.duration = group.duration.max(duration);
            }
            _ => groups.push(PlacedGroup {
                onset,
                duration,
                pitches: vec![(note.pitch, note.velocity)],
            }),
        }
    }
    // Clip overlapping successors so the measure cursor never runs
    // backwards.
    for i in 1..groups.len() {
        let prev_end = groups[i - 1].onset + groups[i - 1].duration;
        if groups[i].onset < prev_end {
            groups[i].onset = prev_end;
        }
    }
    groups
}

fn write_note(xml: &mut String, pitch: u8, duration: u32, chord: bool) {
    let (step, alter, octave) = spell_pitch(pitch);
    xml.push_str("      <note>");
    if chord {
        xml.push_str("<chord/>");
    }
    xml.push_str("<pitch>");
    xml.push_str(&format!("<step>{step}</step>"));
    if alter != 0 {
        xml.push_str(&format!("<alter>{alter}</alter>"));
    }
    xml.push_str(&format!("<octave>{octave}</octave></pitch>"));
    xml.push_str(&format!("<duration>{duration}</duration>"));
    xml.push_str(&format!("<type>{}</type>", note_type(duration)));
    xml.push_str("</note>\n");
}

fn write_rest(xml: &mut String, duration: u32) {
    xml.push_str(&format!(
        "      <note><rest/><duration>{duration}</duration><type>{}</type></note>\n",
        note_type(duration)
    ));
}

/// Nearest notated value for a duration in divisions.
fn note_type(duration: u32) -> &'static str {
    match duration {
        0..=1 => "16th",
        2..=3 => "eighth",
        4..=6 => "quarter",
        7..=11 => "half",
        _ => "whole",
    }
}

/// Spell a MIDI note number with sharps.
fn spell_pitch(pitch: u8) -> (&'static str, i8, i8) {
    const STEPS: [(&str, i8); 12] = [
        ("C", 0),
        ("C", 1),
        ("D", 0),
        ("D", 1),
        ("E", 0),
        ("F", 0),
        ("F", 1),
        ("G", 0),
        ("G", 1),
        ("A", 0),
        ("A", 1),
        ("B", 0),
    ];
    let (step, alter) = STEPS[(pitch % 12) as usize];
    (step, alter, (pitch / 12) as i8 - 1)
}

/// A concert key: tonic pitch class and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub tonic: u8,
    pub minor: bool,
    /// Circle-of-fifths position for the MusicXML key signature.
    pub fifths: i8,
}

impl Key {
    fn new(tonic: u8, minor: bool) -> Self {
        // Major fifths from the tonic pitch class; a minor key borrows its
        // relative major's signature.
        let major_tonic = if minor { (tonic + 3) % 12 } else { tonic };
        let fifths = ((i16::from(major_tonic) * 7 + 5) % 12 - 5) as i8;
        Self {
            tonic,
            minor,
            fifths,
        }
    }

    fn mode(&self) -> &'static str {
        if self.minor { "minor" } else { "major" }
    }

    pub fn name(&self) -> String {
        const NAMES: [&str; 12] = [
            "C", "Db", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
        ];
        format!("{} {}", NAMES[self.tonic as usize], self.mode())
    }
}

/// Parse a client-supplied key such as "C major", "f# minor", or "Bb".
pub fn parse_key(input: &str) -> Option<Key> {
    let mut parts = input.split_whitespace();
    let tonic_part = parts.next()?;
    let mode_part = parts.next().unwrap_or("major");
    if parts.next().is_some() {
        return None;
    }

    let mut chars = tonic_part.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let tonic = match chars.next() {
        None => base,
        Some('#') => (base + 1) % 12,
        Some('b') => (base + 11) % 12,
        Some(_) => return None,
    };
    if chars.next().is_some() {
        return None;
    }

    let minor = match mode_part.to_ascii_lowercase().as_str() {
        "major" | "maj" => false,
        "minor" | "min" => true,
        _ => return None,
    };
    Some(Key::new(tonic, minor))
}

/// Duration-weighted pitch-class match against the twelve major scales.
pub fn detect_key(notes: &[QuantizedNote]) -> Key {
    const MAJOR_SCALE: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
    let mut histogram = [0.0f64; 12];
    for note in notes {
        histogram[(note.pitch % 12) as usize] += note.duration_beats;
    }

    let mut best = (0u8, f64::MIN);
    for tonic in 0..12u8 {
        let coverage: f64 = MAJOR_SCALE
            .iter()
            .map(|&degree| histogram[((tonic + degree) % 12) as usize])
            .sum();
        // Weight the tonic itself so enharmonically tied scales resolve
        // toward the most-sounded root.
        let score = coverage + histogram[tonic as usize] * 0.5;
        if score > best.1 {
            best = (tonic, score);
        }
    }
    Key::new(best.0, false)
}
