// Pattern generation: turning a loop's musical settings into a step row.
//
// A generator takes a `GenerationSpec` (length, scale intervals, base note,
// note window, density) plus its own options record and returns one
// `Option<u8>` per step: `Some(midi)` for a note, `None` for a rest.
//
// Three algorithms:
// - Euclidean (here): placement via placement.rs, pitches walk forward
//   through the sorted possible-note list by a random 1-3 each pulse, which
//   gives a wandering contour instead of independent picks.
// - Scale traversal (traversal.rs): a lead voice bouncing across the note
//   list, trailed by grace notes.
// - Random (here): placement via placement.rs, pitches cycle evenly through
//   the possible-note list so the whole configured range is heard.
//
// All generators return an all-rest row when no scale note fits the window.
// That is logged, never raised. Which generator runs for a regeneration is
// picked from the loop's `PatternProbabilities`.

use crate::placement::{TimingMode, compute_positions};
use crate::scale::possible_notes;
use crate::traversal::{TraversalOptions, generate_traversal};
use driftloom_prng::SeqRng;
use log::warn;
use serde::{Deserialize, Serialize};

/// One generated row. Index = step.
pub type NoteRow = Vec<Option<u8>>;

/// Which generator produced (or should produce) a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    Euclidean,
    Scale,
    Random,
}

impl PatternKind {
    pub const ALL: [PatternKind; 3] = [PatternKind::Euclidean, PatternKind::Scale, PatternKind::Random];

    pub fn label(self) -> &'static str {
        match self {
            PatternKind::Euclidean => "euclidean",
            PatternKind::Scale => "scale",
            PatternKind::Random => "random",
        }
    }
}

/// Relative likelihood of each generator for a loop.
///
/// Values are weights, not probabilities: they are normalized at selection
/// time. Negative values are treated as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternProbabilities {
    pub euclidean: f32,
    pub scale: f32,
    pub random: f32,
}

impl Default for PatternProbabilities {
    fn default() -> Self {
        PatternProbabilities {
            euclidean: 0.4,
            scale: 0.4,
            random: 0.2,
        }
    }
}

impl PatternProbabilities {
    /// Pick a generator. All-zero weights fall back to a uniform choice.
    pub fn choose(&self, rng: &mut SeqRng) -> PatternKind {
        let weights = [self.euclidean, self.scale, self.random];
        match rng.weighted_index(&weights) {
            Some(i) => PatternKind::ALL[i],
            None => PatternKind::ALL[rng.range_usize(0, PatternKind::ALL.len())],
        }
    }

    /// Same weights with negatives and NaN replaced by zero.
    pub fn sanitized(self) -> Self {
        let fix = |w: f32| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        PatternProbabilities {
            euclidean: fix(self.euclidean),
            scale: fix(self.scale),
            random: fix(self.random),
        }
    }
}

/// What every generator needs to know about the loop.
#[derive(Debug, Clone, Copy)]
pub struct GenerationSpec<'a> {
    pub length: usize,
    pub intervals: &'a [u8],
    pub base_note: u8,
    pub range_min: u8,
    pub range_max: u8,
    /// Clamped to [0, 1] by `generate`.
    pub density: f32,
}

impl GenerationSpec<'_> {
    /// Sorted in-scale, in-range pitches.
    pub fn possible_notes(&self) -> Vec<u8> {
        possible_notes(self.intervals, self.base_note, self.range_min, self.range_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EuclideanOptions {
    pub timing: TimingMode,
    pub start_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomOptions {
    pub timing: TimingMode,
    pub start_offset: usize,
}

impl Default for RandomOptions {
    fn default() -> Self {
        RandomOptions {
            timing: TimingMode::Random,
            start_offset: 0,
        }
    }
}

/// Options for a single generator run.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorOptions {
    Euclidean(EuclideanOptions),
    Scale(TraversalOptions),
    Random(RandomOptions),
}

impl GeneratorOptions {
    /// Default options for `kind`. `max_tail` bounds the traversal tail.
    pub fn defaults_for(kind: PatternKind, max_tail: usize) -> Self {
        match kind {
            PatternKind::Euclidean => GeneratorOptions::Euclidean(EuclideanOptions::default()),
            PatternKind::Scale => GeneratorOptions::Scale(TraversalOptions {
                max_tail,
                ..TraversalOptions::default()
            }),
            PatternKind::Random => GeneratorOptions::Random(RandomOptions::default()),
        }
    }

    pub fn kind(&self) -> PatternKind {
        match self {
            GeneratorOptions::Euclidean(_) => PatternKind::Euclidean,
            GeneratorOptions::Scale(_) => PatternKind::Scale,
            GeneratorOptions::Random(_) => PatternKind::Random,
        }
    }
}

/// Run the generator selected by `options`.
pub fn generate(spec: &GenerationSpec, options: &GeneratorOptions, rng: &mut SeqRng) -> NoteRow {
    let spec = GenerationSpec {
        density: crate::config::clamp_unit(spec.density),
        ..*spec
    };
    match options {
        GeneratorOptions::Euclidean(opts) => generate_euclidean(&spec, opts, rng),
        GeneratorOptions::Scale(opts) => generate_traversal(&spec, opts, rng),
        GeneratorOptions::Random(opts) => generate_random(&spec, opts, rng),
    }
}

/// A row of `length` rests.
pub fn rest_row(length: usize) -> NoteRow {
    vec![None; length]
}

/// Log and return silence for a window that holds no scale note.
pub(crate) fn empty_range_row(spec: &GenerationSpec, generator: &str) -> NoteRow {
    warn!(
        "{generator}: no scale notes between {} and {} (base {}); returning rests",
        spec.range_min, spec.range_max, spec.base_note
    );
    rest_row(spec.length)
}

/// Euclidean pulses with a wandering pitch walk.
///
/// Uses `allow_zero = true`: density 0 yields true silence here, and the
/// notes matrix repairs it if the row is written to an active loop.
pub fn generate_euclidean(spec: &GenerationSpec, opts: &EuclideanOptions, rng: &mut SeqRng) -> NoteRow {
    let notes = spec.possible_notes();
    if notes.is_empty() {
        return empty_range_row(spec, "euclidean");
    }
    let mut row = rest_row(spec.length);
    let mut positions =
        compute_positions(spec.length, spec.density, opts.timing, opts.start_offset, true, rng);
    positions.sort_unstable();

    let mut idx = rng.range_usize(0, notes.len());
    for (k, &pos) in positions.iter().enumerate() {
        if k > 0 {
            idx = (idx + rng.range_usize_inclusive(1, 3)) % notes.len();
        }
        row[pos] = Some(notes[idx]);
    }
    row
}

/// Placement-driven row whose pitches cycle evenly through the range.
///
/// With at most as many placements as notes, pick `i` takes
/// `notes[i * n / count]`, spreading picks across the whole window. With
/// more placements, picks cycle `notes[i % n]` so every note is heard.
///
/// The even spread fixes which pitches sound, so they never cluster in one
/// corner of the range. Only their order is shuffled across the placed
/// steps; laid out in pick order the row would be a plain rising scale.
pub fn generate_random(spec: &GenerationSpec, opts: &RandomOptions, rng: &mut SeqRng) -> NoteRow {
    let notes = spec.possible_notes();
    if notes.is_empty() {
        return empty_range_row(spec, "random");
    }
    let mut row = rest_row(spec.length);
    let mut positions =
        compute_positions(spec.length, spec.density, opts.timing, opts.start_offset, false, rng);
    positions.sort_unstable();

    let n = notes.len();
    let count = positions.len();
    let mut picks: Vec<u8> = (0..count)
        .map(|i| if count <= n { notes[i * n / count] } else { notes[i % n] })
        .collect();
    rng.shuffle(&mut picks);

    for (&pos, pitch) in positions.iter().zip(picks) {
        row[pos] = Some(pitch);
    }
    row
}

/// Number of sounding steps in a row.
pub fn note_count(row: &[Option<u8>]) -> usize {
    row.iter().filter(|n| n.is_some()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::ScaleBook;

    fn spec<'a>(intervals: &'a [u8], length: usize, density: f32) -> GenerationSpec<'a> {
        GenerationSpec {
            length,
            intervals,
            base_note: 60,
            range_min: 48,
            range_max: 72,
            density,
        }
    }

    #[test]
    fn test_euclidean_basic_scenario() {
        let book = ScaleBook::builtin();
        let mut rng = SeqRng::new(4);
        let s = spec(book.get("major").unwrap(), 16, 0.25);
        let row = generate_euclidean(&s, &EuclideanOptions::default(), &mut rng);
        assert_eq!(row.len(), 16);
        let filled: Vec<usize> = (0..16).filter(|&i| row[i].is_some()).collect();
        assert_eq!(filled, vec![0, 4, 8, 12]);
    }

    #[test]
    fn test_euclidean_density_zero_is_silent() {
        let mut rng = SeqRng::new(4);
        let s = spec(&[0, 4, 7], 16, 0.0);
        let row = generate_euclidean(&s, &EuclideanOptions::default(), &mut rng);
        assert_eq!(note_count(&row), 0);
    }

    #[test]
    fn test_euclidean_walk_moves_forward() {
        // With a long note list the walk advances 1-3 positions per pulse.
        let mut rng = SeqRng::new(8);
        let chromatic: Vec<u8> = (0..12).collect();
        let s = GenerationSpec {
            range_min: 24,
            range_max: 96,
            ..spec(&chromatic, 8, 1.0)
        };
        let notes = s.possible_notes();
        let row = generate_euclidean(&s, &EuclideanOptions::default(), &mut rng);
        let idxs: Vec<usize> = row
            .iter()
            .map(|n| notes.iter().position(|p| Some(*p) == *n).unwrap())
            .collect();
        for pair in idxs.windows(2) {
            let step = (pair[1] + notes.len() - pair[0]) % notes.len();
            assert!((1..=3).contains(&step), "walk step {step} in {idxs:?}");
        }
    }

    #[test]
    fn test_generators_respect_range_and_density() {
        let book = ScaleBook::builtin();
        let mut rng = SeqRng::new(21);
        for name in ["major", "pentatonic-minor", "chromatic"] {
            for &density in &[0.1f32, 0.25, 0.5, 0.8, 1.0] {
                for length in [7usize, 16, 32] {
                    let s = spec(book.get(name).unwrap(), length, density);
                    let expected = ((length as f32 * density).round() as usize).max(1);
                    for kind in PatternKind::ALL {
                        let opts = GeneratorOptions::defaults_for(kind, 5);
                        let row = generate(&s, &opts, &mut rng);
                        assert_eq!(row.len(), length);
                        for n in row.iter().flatten() {
                            assert!((48..=72).contains(n), "{kind:?} produced {n}");
                        }
                        if kind != PatternKind::Scale {
                            let count = note_count(&row) as i64;
                            assert!((count - expected as i64).abs() <= 1, "{kind:?} {count} vs {expected}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_empty_range_returns_rests() {
        let mut rng = SeqRng::new(1);
        // Only C in the scale, window C#..B.
        let s = GenerationSpec {
            range_min: 61,
            range_max: 71,
            ..spec(&[0], 12, 1.0)
        };
        for kind in PatternKind::ALL {
            let row = generate(&s, &GeneratorOptions::defaults_for(kind, 5), &mut rng);
            assert_eq!(row, rest_row(12));
        }
    }

    #[test]
    fn test_random_covers_full_range() {
        let mut rng = SeqRng::new(5);
        let s = GenerationSpec {
            range_min: 60,
            range_max: 72,
            ..spec(&[0, 2, 4, 5, 7, 9, 11], 32, 1.0)
        };
        let notes = s.possible_notes();
        let row = generate_random(&s, &RandomOptions::default(), &mut rng);
        for n in &notes {
            assert!(row.contains(&Some(*n)), "missing {n}");
        }
    }

    #[test]
    fn test_random_spreads_sparse_picks() {
        let mut rng = SeqRng::new(5);
        // 8 notes available, 4 placements -> picks at indices 0, 2, 4, 6.
        let s = GenerationSpec {
            range_min: 60,
            range_max: 72,
            ..spec(&[0, 2, 4, 5, 7, 9, 11], 16, 0.25)
        };
        let notes = s.possible_notes();
        let row = generate_random(&s, &RandomOptions::default(), &mut rng);
        let mut got: Vec<u8> = row.into_iter().flatten().collect();
        got.sort_unstable();
        assert_eq!(got, vec![notes[0], notes[2], notes[4], notes[6]]);
    }

    #[test]
    fn test_random_reorders_but_keeps_the_even_spread() {
        let s = GenerationSpec {
            range_min: 60,
            range_max: 72,
            ..spec(&[0, 2, 4, 5, 7, 9, 11], 16, 0.5)
        };
        let notes = s.possible_notes();
        let mut ascending_rows = 0;
        for seed in 0..8 {
            let mut rng = SeqRng::new(seed);
            let row = generate_random(&s, &RandomOptions::default(), &mut rng);
            let played: Vec<u8> = row.into_iter().flatten().collect();
            // 8 placements over 8 notes: each note exactly once.
            let mut sorted = played.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, notes);
            if played.windows(2).all(|w| w[0] < w[1]) {
                ascending_rows += 1;
            }
        }
        assert!(ascending_rows < 8);
    }

    #[test]
    fn test_probabilities_choose() {
        let mut rng = SeqRng::new(2);
        let only_scale = PatternProbabilities {
            euclidean: 0.0,
            scale: 3.0,
            random: 0.0,
        };
        for _ in 0..100 {
            assert_eq!(only_scale.choose(&mut rng), PatternKind::Scale);
        }
        let zero = PatternProbabilities {
            euclidean: 0.0,
            scale: 0.0,
            random: 0.0,
        };
        let mut seen = [false; 3];
        for _ in 0..300 {
            let k = zero.choose(&mut rng);
            seen[PatternKind::ALL.iter().position(|&p| p == k).unwrap()] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn test_probabilities_sanitize_negative() {
        let p = PatternProbabilities {
            euclidean: -1.0,
            scale: f32::NAN,
            random: 0.5,
        }
        .sanitized();
        assert_eq!(p.euclidean, 0.0);
        assert_eq!(p.scale, 0.0);
        assert_eq!(p.random, 0.5);
    }
}
