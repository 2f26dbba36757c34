// End-to-end transport runs: drive `Sequencer::on_step` the way an audio
// clock would and check the matrix after every evolution tick.

use driftloom_engine::config::EngineConfig;
use driftloom_engine::engine::Sequencer;
use driftloom_engine::evolution::EvolutionMode;
use driftloom_engine::matrix::{GenerationMode, LoopId, MetadataPatch};
use std::cell::Cell;
use std::rc::Rc;

const STEP_MS: u64 = 125;

fn sequencer(mode: EvolutionMode, loops: usize, seed: u64) -> Sequencer {
    let mut config = EngineConfig::default();
    config.evolution.mode = mode;
    let mut seq = Sequencer::new(config, seed).unwrap();
    for i in 0..loops {
        seq.add_loop(LoopId(i)).unwrap();
    }
    seq.set_evolve_interval(1);
    seq.set_evolve_intensity(1.0);
    seq.set_evolution_enabled(true);
    seq
}

/// Play `measures` measures; call `each_tick` after every evolution tick.
fn play(seq: &mut Sequencer, measures: u64, mut each_tick: impl FnMut(&Sequencer)) -> u64 {
    let spm = seq.config().steps_per_measure;
    let mut ticks = 0;
    for step in 0..measures * spm {
        if seq.on_step(step, step * STEP_MS).unwrap().is_some() {
            ticks += 1;
            each_tick(seq);
        }
    }
    ticks
}

fn check_invariants(seq: &Sequencer) {
    for id in seq.matrix().initialized_loops() {
        let meta = seq.matrix().metadata(id).unwrap();
        let row = seq.get_loop_notes(id).unwrap();
        assert_eq!(row.len(), meta.length, "{id} length");
        for &n in row.iter().flatten() {
            assert!(
                (meta.note_range_min..=meta.note_range_max).contains(&n),
                "{id}: note {n} outside {}..={}",
                meta.note_range_min,
                meta.note_range_max
            );
        }
        if meta.is_active {
            assert!(row.iter().any(Option::is_some), "{id} went silent");
        }
    }
}

#[test]
fn one_tick_per_measure_at_interval_one() {
    let mut seq = sequencer(EvolutionMode::Classic, 4, 10);
    let ticks = play(&mut seq, 10, |_| {});
    assert_eq!(ticks, 10);
    assert_eq!(seq.ticks_applied(), 10);
}

#[test]
fn interval_spaces_ticks() {
    let mut seq = sequencer(EvolutionMode::Classic, 2, 10);
    seq.set_evolve_interval(3);
    // Measures 0, 3, 6, 9.
    assert_eq!(play(&mut seq, 10, |_| {}), 4);
}

#[test]
fn disabled_evolution_never_ticks() {
    let mut seq = sequencer(EvolutionMode::Classic, 2, 10);
    seq.set_evolution_enabled(false);
    let before = seq.export_state().notes;
    assert_eq!(play(&mut seq, 8, |_| {}), 0);
    assert_eq!(seq.export_state().notes, before);
}

#[test]
fn every_mode_keeps_the_matrix_valid() {
    for mode in EvolutionMode::ALL {
        for seed in [1, 2, 3] {
            let mut seq = sequencer(mode, 5, seed);
            check_invariants(&seq);
            let ticks = play(&mut seq, 12, check_invariants);
            assert_eq!(ticks, 12, "{} seed {seed}", mode.label());
        }
    }
}

#[test]
fn locked_loop_is_never_touched_by_evolution() {
    for mode in EvolutionMode::ALL {
        let mut seq = sequencer(mode, 4, 77);
        let patch = MetadataPatch {
            generation_mode: Some(GenerationMode::Locked),
            ..Default::default()
        };
        seq.update_loop_metadata(LoopId(2), &patch).unwrap();
        let locked_row = seq.get_loop_notes(LoopId(2)).unwrap().to_vec();
        let locked_density = seq.get_effective_density(LoopId(2)).unwrap();
        let locked_scale = seq.matrix().metadata(LoopId(2)).unwrap().scale.clone();

        play(&mut seq, 16, |seq| {
            assert_eq!(seq.get_loop_notes(LoopId(2)).unwrap(), locked_row.as_slice());
        });
        assert_eq!(seq.get_effective_density(LoopId(2)).unwrap(), locked_density);
        assert_eq!(seq.matrix().metadata(LoopId(2)).unwrap().scale, locked_scale);
        assert!(seq.ticks_applied() > 0);
    }
}

#[test]
fn scale_locked_run_never_quantizes() {
    let mut seq = sequencer(EvolutionMode::TensionRelease, 3, 5);
    seq.set_scale_locked(true);
    play(&mut seq, 8, |seq| assert_eq!(seq.current_scale(), "minor"));
    assert_eq!(seq.quantizations(), 0);

    let revision = seq.matrix().revision();
    assert!(!seq.update_scale("minor").unwrap());
    assert_eq!(seq.quantizations(), 0);
    assert_eq!(seq.matrix().revision(), revision);
}

#[test]
fn each_tick_notifies_observers_once() {
    let mut seq = sequencer(EvolutionMode::Classic, 4, 21);
    let notices = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&notices);
    seq.subscribe(Box::new(move |_| counter.set(counter.get() + 1)));

    let ticks = play(&mut seq, 6, |_| {});
    assert_eq!(ticks, 6);
    assert_eq!(notices.get(), 6);
}

#[test]
fn energy_stays_under_a_low_ceiling() {
    let mut seq = sequencer(EvolutionMode::Momentum, 6, 3);
    seq.set_max_sonic_energy(1.0);
    play(&mut seq, 8, |_| {});
    let snapshot = seq.energy_snapshot();
    let floor_reached = seq
        .matrix()
        .active_loops()
        .into_iter()
        .all(|id| seq.matrix().metadata(id).unwrap().audio.volume <= seq.config().energy.min_balanced_volume);
    assert!(snapshot.total <= 1.0 + 1e-4 || floor_reached, "energy {}", snapshot.total);
    check_invariants(&seq);
}

#[test]
fn seeded_runs_are_reproducible() {
    let run = |seed| {
        let mut seq = sequencer(EvolutionMode::CallResponse, 4, seed);
        play(&mut seq, 10, |_| {});
        seq.export_state()
    };
    assert_eq!(run(99), run(99));
}

#[test]
fn rewinding_the_transport_keeps_ticking() {
    let mut seq = sequencer(EvolutionMode::Classic, 2, 4);
    assert_eq!(play(&mut seq, 4, |_| {}), 4);
    // A second pass from step 0, as after a loop-back in the host.
    assert_eq!(play(&mut seq, 4, |_| {}), 4);
    assert_eq!(seq.ticks_applied(), 8);
}
