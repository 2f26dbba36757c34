// Placement strategy: which steps of a loop receive a note.
//
// Decoupled from pitch choice. Given a loop length, a density and a timing
// mode, `compute_positions` returns the step indices that should sound;
// every other step is a rest. The generators then decide which pitch lands
// on each returned step.
//
// Pulse count policy: `round(length * density)` (half away from zero),
// clamped to `[0, length]`, the same for every mode. With `allow_zero =
// false` the count is at least 1 so audible callers never get silence.
//
// Modes:
// - Euclidean: step i is a pulse iff `(i * count) % length < count`, an even
//   distribution without the Bjorklund recursion.
// - Even: `floor(i * length / count)` for i in 0..count.
// - Random: `count` distinct steps drawn without replacement.
// - FillAll: every step once, in a bounce order starting at the offset.
//
// `start_offset` rotates the result for all modes but FillAll, where it is
// the bounce's starting step.

use driftloom_prng::SeqRng;
use serde::{Deserialize, Serialize};

/// How pulses are laid out over a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimingMode {
    #[default]
    Euclidean,
    Even,
    Random,
    FillAll,
}

impl TimingMode {
    pub fn label(self) -> &'static str {
        match self {
            TimingMode::Euclidean => "euclidean",
            TimingMode::Even => "even",
            TimingMode::Random => "random",
            TimingMode::FillAll => "fill-all",
        }
    }
}

/// Number of pulses for a loop of `length` steps at `density`.
///
/// `density` must already be in [0, 1]; callers clamp at their boundary.
pub fn pulse_count(length: usize, density: f32, allow_zero: bool) -> usize {
    if length == 0 {
        return 0;
    }
    let raw = (length as f32 * density).round() as usize;
    let count = raw.min(length);
    if allow_zero { count } else { count.max(1) }
}

/// Step indices that carry a note.
///
/// The order of the result depends on the mode: Euclidean and Even are
/// ascending before rotation, Random is draw order, FillAll is bounce order.
/// Callers that need time order sort the result. `length == 0` yields an
/// empty vector; callers guard against that upstream.
pub fn compute_positions(
    length: usize,
    density: f32,
    mode: TimingMode,
    start_offset: usize,
    allow_zero: bool,
    rng: &mut SeqRng,
) -> Vec<usize> {
    if length == 0 {
        return Vec::new();
    }
    let count = pulse_count(length, density, allow_zero);
    let raw: Vec<usize> = match mode {
        TimingMode::FillAll => return bounce_order(length, start_offset % length),
        _ if count == 0 => return Vec::new(),
        TimingMode::Euclidean => (0..length)
            .filter(|&i| (i * count) % length < count)
            .collect(),
        TimingMode::Even => (0..count).map(|i| i * length / count).collect(),
        TimingMode::Random => rng.sample_distinct(length, count),
    };

    let offset = start_offset % length;
    raw.into_iter().map(|p| (p + offset) % length).collect()
}

/// Bounce traversal covering every step once: climb from `start` to the top
/// step, turn, and descend from `start - 1` to step 0. The top step is never
/// emitted twice in a row, since the descent resumes below the start.
fn bounce_order(length: usize, start: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(length);
    order.extend(start..length);
    order.extend((0..start).rev());
    order
}
