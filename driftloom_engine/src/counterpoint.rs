// Cross-loop pitch collision avoidance.
//
// After a loop is regenerated, each of its notes is checked against the
// notes other active loops sound at the same step. A colliding note is moved
// to the nearest free in-scale, in-range pitch. Each step is resolved on its
// own; there is no optimization across steps.
//
// Loops can have different lengths, so "the same step" for another loop is
// `step % other_len`. Ties between two equally distant alternatives go to
// the lower note. When every candidate is taken the collision is accepted
// and the original note kept.
//
// The engine only calls in here when counterpoint is enabled and more than
// one loop is active.

use crate::generate::NoteRow;
use crate::scale::possible_notes;
use log::debug;
use std::collections::BTreeSet;

/// Notes sounded at `step` by the given rows.
pub fn analyze_occupied_notes(others: &[&[Option<u8>]], step: usize) -> BTreeSet<u8> {
    others
        .iter()
        .filter(|row| !row.is_empty())
        .filter_map(|row| row[step % row.len()])
        .collect()
}

/// Move `candidate` off any occupied pitch.
///
/// Returns `candidate` unchanged if it is free, or if no in-scale, in-range
/// alternative is free.
pub fn resolve_conflict(
    candidate: u8,
    occupied: &BTreeSet<u8>,
    intervals: &[u8],
    base_note: u8,
    range_min: u8,
    range_max: u8,
) -> u8 {
    if !occupied.contains(&candidate) {
        return candidate;
    }
    let best = possible_notes(intervals, base_note, range_min, range_max)
        .into_iter()
        .filter(|n| !occupied.contains(n))
        .min_by_key(|&n| ((n as i32 - candidate as i32).abs(), n));
    match best {
        Some(n) => n,
        None => {
            debug!("counterpoint: every candidate for {candidate} is taken, keeping collision");
            candidate
        }
    }
}

/// Resolve every note of `row` against `others`. Returns how many notes
/// moved.
pub fn apply_counterpoint(
    row: &mut NoteRow,
    others: &[&[Option<u8>]],
    intervals: &[u8],
    base_note: u8,
    range_min: u8,
    range_max: u8,
) -> usize {
    if others.is_empty() {
        return 0;
    }
    let mut moved = 0;
    for (step, cell) in row.iter_mut().enumerate() {
        let Some(note) = *cell else { continue };
        let occupied = analyze_occupied_notes(others, step);
        let resolved = resolve_conflict(note, &occupied, intervals, base_note, range_min, range_max);
        if resolved != note {
            *cell = Some(resolved);
            moved += 1;
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAJOR: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];

    #[test]
    fn test_free_candidate_is_untouched() {
        let empty = BTreeSet::new();
        assert_eq!(resolve_conflict(64, &empty, &MAJOR, 60, 48, 72), 64);
        let other: BTreeSet<u8> = [60, 67].into_iter().collect();
        assert_eq!(resolve_conflict(64, &other, &MAJOR, 60, 48, 72), 64);
    }

    #[test]
    fn test_collision_moves_to_nearest_lower_on_tie() {
        // 64 is taken; 62 and 65 are the neighbours, 65 is closer.
        let occupied: BTreeSet<u8> = [64].into_iter().collect();
        assert_eq!(resolve_conflict(64, &occupied, &MAJOR, 60, 48, 72), 65);
        // 62 is taken; 60 and 64 are both two away, lower wins.
        let occupied: BTreeSet<u8> = [62].into_iter().collect();
        assert_eq!(resolve_conflict(62, &occupied, &MAJOR, 60, 48, 72), 60);
    }

    #[test]
    fn test_all_taken_keeps_candidate() {
        let occupied: BTreeSet<u8> = [60, 62, 64].into_iter().collect();
        // Window 60..=64 in C major holds only 60, 62, 64.
        assert_eq!(resolve_conflict(62, &occupied, &MAJOR, 60, 60, 64), 62);
    }

    #[test]
    fn test_occupied_wraps_shorter_loops() {
        let a: Vec<Option<u8>> = vec![Some(60), None];
        let b: Vec<Option<u8>> = vec![Some(67), Some(69), None, Some(71)];
        let others = [a.as_slice(), b.as_slice()];
        let at_3: Vec<u8> = analyze_occupied_notes(&others, 3).into_iter().collect();
        assert_eq!(at_3, vec![71]);
        let at_4: Vec<u8> = analyze_occupied_notes(&others, 4).into_iter().collect();
        assert_eq!(at_4, vec![60, 67]);
    }

    #[test]
    fn test_apply_counterpoint_counts_moves() {
        let other: Vec<Option<u8>> = vec![Some(60), Some(64), None, Some(67)];
        let others = [other.as_slice()];
        let mut row: NoteRow = vec![Some(60), Some(62), Some(64), None];
        let moved = apply_counterpoint(&mut row, &others, &MAJOR, 60, 48, 72);
        assert_eq!(moved, 1);
        assert_eq!(row, vec![Some(59), Some(62), Some(64), None]);
    }
}
