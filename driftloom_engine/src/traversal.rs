// Scale-traversal ("lead + tail") generator.
//
// Models a lead voice walking across the sorted possible-note list, with a
// short tail of grace notes trailing behind it:
//
//   1. Emit the lead note.
//   2. Emit up to `tail_length` notes stepping *against* the current
//      direction from the lead index. A tail that would leave the list is
//      clipped, never wrapped.
//   3. Advance the lead by `lead_advance` in the current direction. If that
//      would leave the list, reverse (bounce) and advance the other way.
//   4. In `Alternate` mode, flip the direction after every cycle. In
//      `Random` mode, flip it with p = 0.1.
//
// This repeats until the stream holds `length` notes. A short tail with
// `Alternate` rocks the lead back and forth over a few neighbouring notes;
// the variety pass below is what widens such rows.
//
// The stream is then laid onto the steps picked by placement.rs, either in
// time order (`Sequential`, the default) or by absolute step
// (`Index`: step p takes `stream[p % len]`, which ties pitch to time and
// repeats audibly at regular intervals).
//
// If the laid-out row ends up with too few distinct pitches (fewer than
// `max(5, ceil(placements / 4))`) the stream is rebuilt exactly once with
// the maximum tail and an advance of 2.

use crate::generate::{GenerationSpec, NoteRow, empty_range_row, rest_row};
use crate::placement::{TimingMode, compute_positions};
use driftloom_prng::SeqRng;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Largest magnitude of the lead's starting bias.
pub const MAX_CENTER_BIAS: f32 = 0.6;
/// Chance per cycle of a direction flip in `Random` mode.
const RANDOM_FLIP_CHANCE: f64 = 0.1;
/// Floor on the distinct-pitch threshold that triggers the corrective pass.
const MIN_DISTINCT_PITCHES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectionMode {
    Alternate,
    Random,
}

/// How the note stream is laid onto the selected steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoteMapping {
    /// k-th stream note goes to the k-th selected step in time order.
    #[default]
    Sequential,
    /// Step p takes `stream[p % stream.len()]`.
    Index,
}

/// Traversal options. `None` fields are randomized on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalOptions {
    /// Start bias in [-0.6, 0.6]: 0 starts mid-list, +/-0.6 starts 60% of
    /// the way toward the top/bottom.
    pub center_bias: Option<f32>,
    pub tail_length: Option<usize>,
    /// Upper bound for a randomized tail length.
    pub max_tail: usize,
    pub direction_mode: Option<DirectionMode>,
    /// 1 or 2.
    pub lead_advance: Option<usize>,
    pub density_timing: TimingMode,
    pub mapping: NoteMapping,
    pub start_offset: usize,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        TraversalOptions {
            center_bias: None,
            tail_length: None,
            max_tail: 5,
            direction_mode: None,
            lead_advance: None,
            density_timing: TimingMode::Random,
            mapping: NoteMapping::Sequential,
            start_offset: 0,
        }
    }
}

/// Options with every randomized field resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TraversalParams {
    pub center_bias: f32,
    pub tail_length: usize,
    pub direction_mode: DirectionMode,
    pub lead_advance: usize,
}

impl TraversalParams {
    fn resolve(opts: &TraversalOptions, rng: &mut SeqRng) -> Self {
        let center_bias = match opts.center_bias {
            Some(b) if b.is_finite() => b.clamp(-MAX_CENTER_BIAS, MAX_CENTER_BIAS),
            _ => rng.range_f32(-MAX_CENTER_BIAS, MAX_CENTER_BIAS),
        };
        let tail_length = opts
            .tail_length
            .unwrap_or_else(|| rng.range_usize_inclusive(0, opts.max_tail));
        let direction_mode = opts.direction_mode.unwrap_or_else(|| {
            if rng.random_bool(0.5) {
                DirectionMode::Alternate
            } else {
                DirectionMode::Random
            }
        });
        let lead_advance = opts
            .lead_advance
            .unwrap_or_else(|| rng.range_usize_inclusive(1, 2))
            .clamp(1, 2);
        TraversalParams {
            center_bias,
            tail_length,
            direction_mode,
            lead_advance,
        }
    }
}

pub fn generate_traversal(spec: &GenerationSpec, opts: &TraversalOptions, rng: &mut SeqRng) -> NoteRow {
    let notes = spec.possible_notes();
    if notes.is_empty() {
        return empty_range_row(spec, "scale traversal");
    }
    let params = TraversalParams::resolve(opts, rng);

    let mut positions = compute_positions(
        spec.length,
        spec.density,
        opts.density_timing,
        opts.start_offset,
        false,
        rng,
    );
    positions.sort_unstable();

    let stream = note_stream(&notes, spec.length, &params, rng);
    let row = lay_out(&stream, &positions, opts.mapping, spec.length);

    let threshold = MIN_DISTINCT_PITCHES.max(positions.len().div_ceil(4));
    let distinct = distinct_pitches(&row);
    if distinct >= threshold || distinct >= notes.len() {
        return row;
    }

    debug!(
        "scale traversal: {distinct} distinct pitches below {threshold}, rebuilding with forced tail"
    );
    let forced = TraversalParams {
        tail_length: opts.max_tail.max(1),
        lead_advance: 2,
        ..params
    };
    let stream = note_stream(&notes, spec.length, &forced, rng);
    lay_out(&stream, &positions, opts.mapping, spec.length)
}

/// Index into a list of `n` notes where the lead starts.
pub fn lead_start_index(n: usize, center_bias: f32) -> usize {
    if n <= 1 {
        return 0;
    }
    let top = (n - 1) as f32;
    let mid = top / 2.0;
    let bias = center_bias.clamp(-MAX_CENTER_BIAS, MAX_CENTER_BIAS);
    let idx = if bias >= 0.0 {
        mid + bias * (top - mid)
    } else {
        mid + bias * mid
    };
    (idx.round() as usize).min(n - 1)
}

/// Build the full-length lead+tail stream.
pub(crate) fn note_stream(
    notes: &[u8],
    length: usize,
    params: &TraversalParams,
    rng: &mut SeqRng,
) -> Vec<u8> {
    let n = notes.len();
    if n == 1 {
        return vec![notes[0]; length];
    }
    let n = n as isize;
    let in_bounds = |i: isize| (0..n).contains(&i);

    let mut stream = Vec::with_capacity(length);
    let mut lead = lead_start_index(notes.len(), params.center_bias) as isize;
    let mut dir: isize = if rng.random_bool(0.5) { 1 } else { -1 };
    let advance = params.lead_advance as isize;

    while stream.len() < length {
        stream.push(notes[lead as usize]);

        for t in 1..=params.tail_length as isize {
            if stream.len() >= length {
                break;
            }
            let idx = lead - dir * t;
            if !in_bounds(idx) {
                break;
            }
            stream.push(notes[idx as usize]);
        }

        let mut next = lead + dir * advance;
        if !in_bounds(next) {
            dir = -dir;
            next = lead + dir * advance;
        }
        // A two-note list with advance 2 overshoots both ways.
        lead = next.clamp(0, n - 1);

        let flip = match params.direction_mode {
            DirectionMode::Alternate => true,
            DirectionMode::Random => rng.random_bool(RANDOM_FLIP_CHANCE),
        };
        if flip {
            dir = -dir;
        }
    }
    stream
}

/// Place stream notes onto sorted `positions`.
pub(crate) fn lay_out(stream: &[u8], positions: &[usize], mapping: NoteMapping, length: usize) -> NoteRow {
    let mut row = rest_row(length);
    if stream.is_empty() {
        return row;
    }
    match mapping {
        NoteMapping::Sequential => {
            for (k, &pos) in positions.iter().enumerate() {
                row[pos] = Some(stream[k % stream.len()]);
            }
        }
        NoteMapping::Index => {
            for &pos in positions {
                row[pos] = Some(stream[pos % stream.len()]);
            }
        }
    }
    row
}

fn distinct_pitches(row: &[Option<u8>]) -> usize {
    row.iter().flatten().collect::<BTreeSet<_>>().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinned(tail: usize, advance: usize, mode: DirectionMode) -> TraversalParams {
        TraversalParams {
            center_bias: 0.0,
            tail_length: tail,
            direction_mode: mode,
            lead_advance: advance,
        }
    }

    fn wide_spec(intervals: &[u8], length: usize, density: f32) -> GenerationSpec<'_> {
        GenerationSpec {
            length,
            intervals,
            base_note: 60,
            range_min: 48,
            range_max: 84,
            density,
        }
    }

    #[test]
    fn test_single_note_range_repeats() {
        let mut rng = SeqRng::new(3);
        let spec = GenerationSpec {
            length: 16,
            intervals: &[0],
            base_note: 60,
            range_min: 55,
            range_max: 65,
            density: 0.5,
        };
        let row = generate_traversal(&spec, &TraversalOptions::default(), &mut rng);
        assert_eq!(row.iter().flatten().count(), 8);
        assert!(row.iter().flatten().all(|&n| n == 60));
    }

    #[test]
    fn test_stream_has_requested_length() {
        let mut rng = SeqRng::new(9);
        let notes: Vec<u8> = (60..72).collect();
        for tail in 0..=5 {
            for adv in 1..=2 {
                let s = note_stream(&notes, 37, &pinned(tail, adv, DirectionMode::Random), &mut rng);
                assert_eq!(s.len(), 37);
            }
        }
    }

    #[test]
    fn test_tailless_alternate_rocks_between_neighbours() {
        let notes: Vec<u8> = (60..66).collect();
        for seed in 0..8 {
            let mut rng = SeqRng::new(seed);
            let s = note_stream(&notes, 30, &pinned(0, 1, DirectionMode::Alternate), &mut rng);
            assert_eq!((s[1] as i32 - s[0] as i32).abs(), 1, "stream {s:?}");
            for k in 2..s.len() {
                assert_eq!(s[k], s[k - 2], "stream {s:?}");
            }
        }
    }

    #[test]
    fn test_alternate_lead_reverses_every_cycle() {
        let notes: Vec<u8> = (60..80).collect();
        let mut rng = SeqRng::new(4);
        // Tail 1, advance 2: cycles are [lead, tail] pairs.
        let s = note_stream(&notes, 12, &pinned(1, 2, DirectionMode::Alternate), &mut rng);
        let leads: Vec<i32> = s.iter().step_by(2).map(|&n| n as i32).collect();
        let moves: Vec<i32> = leads.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in moves.windows(2) {
            assert_eq!(pair[0].abs(), 2, "leads {leads:?}");
            assert_eq!(pair[1], -pair[0], "leads {leads:?}");
        }
        // Each tail note sits one step behind its lead, against the move.
        for (k, m) in moves.iter().enumerate() {
            let tail = s[2 * k + 1] as i32;
            assert_eq!(tail - leads[k], -m / 2, "stream {s:?}");
        }
    }

    #[test]
    fn test_random_mode_sweeps_the_list() {
        let mut rng = SeqRng::new(1);
        let notes: Vec<u8> = (60..66).collect();
        let s = note_stream(&notes, 60, &pinned(0, 1, DirectionMode::Random), &mut rng);
        for pair in s.windows(2) {
            let diff = pair[1] as i32 - pair[0] as i32;
            assert_eq!(diff.abs(), 1, "stream {s:?}");
        }
    }

    #[test]
    fn test_tail_trails_against_direction() {
        let mut rng = SeqRng::new(2);
        let notes: Vec<u8> = (60..80).collect();
        let s = note_stream(&notes, 4, &pinned(3, 1, DirectionMode::Alternate), &mut rng);
        // Lead, then three steps in one direction, each one semitone apart.
        let step = s[1] as i32 - s[0] as i32;
        assert_eq!(step.abs(), 1);
        assert_eq!(s[2] as i32 - s[1] as i32, step);
        assert_eq!(s[3] as i32 - s[2] as i32, step);
    }

    #[test]
    fn test_tail_clipped_at_edge() {
        let mut rng = SeqRng::new(2);
        let notes = [60u8, 62];
        let s = note_stream(&notes, 12, &pinned(5, 2, DirectionMode::Random), &mut rng);
        assert_eq!(s.len(), 12);
        assert!(s.iter().all(|n| notes.contains(n)));
    }

    #[test]
    fn test_lead_start_index_bias() {
        assert_eq!(lead_start_index(11, 0.0), 5);
        assert_eq!(lead_start_index(11, 0.6), 8);
        assert_eq!(lead_start_index(11, -0.6), 2);
        assert_eq!(lead_start_index(11, 5.0), 8);
        assert_eq!(lead_start_index(1, 0.6), 0);
    }

    #[test]
    fn test_sequential_mapping_follows_time_order() {
        let stream = [60u8, 62, 64, 65];
        let row = lay_out(&stream, &[1, 5, 6], NoteMapping::Sequential, 8);
        assert_eq!(
            row,
            vec![None, Some(60), None, None, None, Some(62), Some(64), None]
        );
    }

    #[test]
    fn test_index_mapping_ties_pitch_to_step() {
        let stream = [60u8, 62, 64];
        let row = lay_out(&stream, &[1, 3, 4], NoteMapping::Index, 6);
        assert_eq!(row, vec![None, Some(62), None, Some(60), Some(62), None]);
    }

    #[test]
    fn test_full_density_row_is_varied() {
        let mut rng = SeqRng::new(17);
        let major = [0u8, 2, 4, 5, 7, 9, 11];
        let spec = wide_spec(&major, 32, 1.0);
        for _ in 0..20 {
            let row = generate_traversal(&spec, &TraversalOptions::default(), &mut rng);
            assert_eq!(row.iter().flatten().count(), 32);
            assert!(distinct_pitches(&row) >= MIN_DISTINCT_PITCHES);
            assert!(row.iter().flatten().all(|n| (48..=84).contains(n)));
        }
    }

    #[test]
    fn test_sparse_row_survives_corrective_pass() {
        let mut rng = SeqRng::new(23);
        let major = [0u8, 2, 4, 5, 7, 9, 11];
        // 4 placements can never reach 5 distinct pitches; the corrective
        // pass runs once and the result is still well formed.
        let spec = wide_spec(&major, 16, 0.25);
        let opts = TraversalOptions {
            tail_length: Some(0),
            ..TraversalOptions::default()
        };
        let row = generate_traversal(&spec, &opts, &mut rng);
        assert_eq!(row.len(), 16);
        assert_eq!(row.iter().flatten().count(), 4);
    }
}
