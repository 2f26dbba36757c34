// Scale lookup and note utilities.
//
// Loops store a scale *name*, never its intervals. Every consumer resolves
// the name through `ScaleBook::get` at the point of use, so a global scale
// change can never leave a stale interval set cached on a loop. An
// unresolvable name is a hard error (`EngineError::UnknownScale`); there is
// no fallback scale.
//
// This module provides:
// - The built-in scale table with a tonal family per scale (used by the
//   tension/release policy) and a similarity measure (used by call/response
//   to find harmonically related scales)
// - MIDI range clamping for the domain-wide 24..=96 window
// - Enumeration of in-scale, in-range pitches ("possible notes")
// - Snapping and in-scale transposition against a possible-note list
//
// Consumed by generate.rs, traversal.rs, counterpoint.rs, matrix.rs and
// evolution.rs.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowest MIDI note any loop may use.
pub const NOTE_FLOOR: u8 = 24;
/// Highest MIDI note any loop may use.
pub const NOTE_CEIL: u8 = 96;

/// Minimum shared-pitch-class ratio for two scales to count as related.
const RELATED_SIMILARITY: f32 = 0.7;

/// Tonal colour of a scale, used by the tension/release evolution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleFamily {
    Consonant,
    Neutral,
    Dissonant,
}

/// One named scale: semitone offsets (0-11) from the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleEntry {
    pub intervals: Vec<u8>,
    pub family: ScaleFamily,
}

/// Name -> interval table. BTreeMap keeps name iteration order stable,
/// which keeps seeded scale picks reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleBook {
    scales: BTreeMap<String, ScaleEntry>,
}

impl Default for ScaleBook {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ScaleBook {
    /// An empty book. Mostly useful for tests.
    pub fn empty() -> Self {
        ScaleBook {
            scales: BTreeMap::new(),
        }
    }

    /// The standard table shipped with the engine.
    pub fn builtin() -> Self {
        use ScaleFamily::*;
        let mut book = Self::empty();
        book.insert("major", &[0, 2, 4, 5, 7, 9, 11], Consonant);
        book.insert("minor", &[0, 2, 3, 5, 7, 8, 10], Consonant);
        book.insert("dorian", &[0, 2, 3, 5, 7, 9, 10], Consonant);
        book.insert("mixolydian", &[0, 2, 4, 5, 7, 9, 10], Consonant);
        book.insert("pentatonic-major", &[0, 2, 4, 7, 9], Consonant);
        book.insert("pentatonic-minor", &[0, 3, 5, 7, 10], Consonant);
        book.insert("lydian", &[0, 2, 4, 6, 7, 9, 11], Neutral);
        book.insert("blues", &[0, 3, 5, 6, 7, 10], Neutral);
        book.insert("phrygian", &[0, 1, 3, 5, 7, 8, 10], Dissonant);
        book.insert("locrian", &[0, 1, 3, 5, 6, 8, 10], Dissonant);
        book.insert("harmonic-minor", &[0, 2, 3, 5, 7, 8, 11], Dissonant);
        book.insert("whole-tone", &[0, 2, 4, 6, 8, 10], Dissonant);
        book.insert("diminished", &[0, 2, 3, 5, 6, 8, 9, 11], Dissonant);
        book.insert("chromatic", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11], Dissonant);
        book
    }

    /// Add or replace a scale. Intervals are reduced mod 12, sorted and
    /// deduplicated.
    pub fn insert(&mut self, name: &str, intervals: &[u8], family: ScaleFamily) {
        let mut intervals: Vec<u8> = intervals.iter().map(|i| i % 12).collect();
        intervals.sort_unstable();
        intervals.dedup();
        self.scales
            .insert(name.to_string(), ScaleEntry { intervals, family });
    }

    /// Resolve a scale name to its interval set.
    pub fn get(&self, name: &str) -> Result<&[u8]> {
        self.entry(name).map(|e| e.intervals.as_slice())
    }

    pub fn family(&self, name: &str) -> Result<ScaleFamily> {
        self.entry(name).map(|e| e.family)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scales.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scales.keys().map(String::as_str)
    }

    pub fn names_in_family(&self, family: ScaleFamily) -> Vec<&str> {
        self.scales
            .iter()
            .filter(|(_, e)| e.family == family)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Other scales sharing most of `name`'s pitch classes (similarity at
    /// least 0.7), most similar first.
    pub fn related(&self, name: &str) -> Result<Vec<&str>> {
        let base = self.get(name)?;
        let mut out: Vec<(&str, f32)> = self
            .scales
            .iter()
            .filter(|(n, _)| n.as_str() != name)
            .map(|(n, e)| (n.as_str(), similarity(base, &e.intervals)))
            .filter(|&(_, s)| s >= RELATED_SIMILARITY)
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(out.into_iter().map(|(n, _)| n).collect())
    }

    fn entry(&self, name: &str) -> Result<&ScaleEntry> {
        self.scales.get(name).ok_or_else(|| EngineError::UnknownScale {
            name: name.to_string(),
        })
    }
}

/// Shared pitch classes divided by the size of the larger set.
fn similarity(a: &[u8], b: &[u8]) -> f32 {
    let shared = a.iter().filter(|pc| b.contains(pc)).count();
    let larger = a.len().max(b.len());
    if larger == 0 {
        0.0
    } else {
        shared as f32 / larger as f32
    }
}

/// Clamp any integer pitch into the domain window.
pub fn clamp_note(note: i32) -> u8 {
    note.clamp(NOTE_FLOOR as i32, NOTE_CEIL as i32) as u8
}

/// Clamp both bounds into the domain window and order them.
pub fn clamp_range(min: i32, max: i32) -> (u8, u8) {
    let a = clamp_note(min);
    let b = clamp_note(max);
    (a.min(b), a.max(b))
}

/// Every pitch `base + interval + 12k` inside `[min, max]`, ascending.
pub fn possible_notes(intervals: &[u8], base_note: u8, min: u8, max: u8) -> Vec<u8> {
    if min > max || intervals.is_empty() {
        return Vec::new();
    }
    let mut pcs = [false; 12];
    for &iv in intervals {
        pcs[(iv % 12) as usize] = true;
    }
    (min..=max)
        .filter(|&n| {
            let offset = (n as i32 - base_note as i32).rem_euclid(12);
            pcs[offset as usize]
        })
        .collect()
}

/// Index of the entry in a sorted note list closest to `note`; ties go to
/// the lower note. `None` for an empty list.
pub fn nearest_index(sorted: &[u8], note: u8) -> Option<usize> {
    sorted
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| ((n as i32 - note as i32).abs(), n))
        .map(|(i, _)| i)
}

/// Snap to the nearest entry of a sorted candidate list (ties go down).
/// Returns the note unchanged when there are no candidates.
pub fn snap_to(sorted: &[u8], note: u8) -> u8 {
    nearest_index(sorted, note).map_or(note, |i| sorted[i])
}

/// Move a note by `degrees` steps through a sorted candidate list. The note
/// is first snapped; steps that would run off either end reflect back.
pub fn transpose_degrees(sorted: &[u8], note: u8, degrees: i32) -> u8 {
    let Some(start) = nearest_index(sorted, note) else {
        return note;
    };
    let len = sorted.len() as i32;
    if len == 1 {
        return sorted[0];
    }
    // Reflect inside [0, len-1] with period 2*(len-1).
    let period = 2 * (len - 1);
    let raw = (start as i32 + degrees).rem_euclid(period);
    let idx = if raw < len { raw } else { period - raw };
    sorted[idx as usize]
}

/// Scientific pitch name (C4 = 60).
pub fn pitch_name(note: u8) -> String {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
    ];
    let octave = note as i32 / 12 - 1;
    format!("{}{}", NAMES[(note % 12) as usize], octave)
}
