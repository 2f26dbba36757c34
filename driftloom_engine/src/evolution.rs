// Evolution orchestrator: when to mutate, and what.
//
// Ticks are gated on the transport, never on a wall-clock timer. The
// sequencer forwards every step to `EvolutionState::gate`; a tick fires only
// on a measure boundary (`step % steps_per_measure == 0`), only once per
// measure, and only once the scheduled measure has been reached. The first
// boundary after evolution is enabled fires immediately; each fire schedules
// the next at `measure + interval`.
//
// A fired tick calls `plan_tick`, which returns a raw `MutationPlan`:
//
// - Scale decision (skipped while the scale is locked):
//   - Classic / Momentum: with `scale_change_chance`, a random scale that is
//     neither current nor among the last `scale_history` picks.
//   - CallResponse: no global change. A caller and a responder are drawn
//     from the active loops; the responder is re-harmonized to a scale
//     related to the caller's and regenerated.
//   - TensionRelease: every tick flips phase and picks a scale from the
//     phase's family (dissonant for tension, consonant for release).
// - Loop selection: `max(1, round(active * intensity))` active loops, drawn
//   without replacement. Locked loops are NOT filtered here; the coalescer
//   vetoes them, so a locked loop can be a raw candidate but never receives
//   an applied intent.
// - Per-loop mutation, weighted: regenerate, density nudge toward the
//   energy target (auto-mode loops only), or transpose by a few degrees.
// - Loops left in a scale other than the global one (an earlier responder)
//   get a quantize intent back to the global scale. The coalescer drops
//   these when a global scale change is also planned.
//
// Momentum raises the selection intensity linearly from the base intensity
// to `momentum_max_intensity` over `momentum_ramp_ms` since evolution was
// enabled.

use crate::config::{EvolutionParams, clamp_unit};
use crate::intent::{MutationIntent, MutationPlan};
use crate::matrix::{DensityMode, LoopId, MetadataPatch, NotesMatrix};
use crate::scale::ScaleFamily;
use driftloom_prng::SeqRng;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Largest random wobble added to a density nudge.
const DENSITY_JITTER: f32 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvolutionMode {
    #[default]
    Classic,
    Momentum,
    CallResponse,
    TensionRelease,
}

impl EvolutionMode {
    pub const ALL: [EvolutionMode; 4] = [
        EvolutionMode::Classic,
        EvolutionMode::Momentum,
        EvolutionMode::CallResponse,
        EvolutionMode::TensionRelease,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EvolutionMode::Classic => "classic",
            EvolutionMode::Momentum => "momentum",
            EvolutionMode::CallResponse => "call-response",
            EvolutionMode::TensionRelease => "tension-release",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.label() == label)
    }
}

/// Which half of the tension/release cycle was entered last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TensionPhase {
    Tension,
    #[default]
    Release,
}

impl TensionPhase {
    fn flipped(self) -> Self {
        match self {
            TensionPhase::Tension => TensionPhase::Release,
            TensionPhase::Release => TensionPhase::Tension,
        }
    }

    fn family(self) -> ScaleFamily {
        match self {
            TensionPhase::Tension => ScaleFamily::Dissonant,
            TensionPhase::Release => ScaleFamily::Consonant,
        }
    }
}

/// What `plan_tick` reads from the rest of the engine.
pub struct PlanContext<'a> {
    pub matrix: &'a NotesMatrix,
    pub current_scale: &'a str,
    pub params: &'a EvolutionParams,
    /// Selection intensity, already adjusted for the mode.
    pub intensity: f32,
    /// The energy manager's adaptive density target.
    pub density_target: f32,
}

/// Scheduling and creative-mode state. Serializable so it survives export.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionState {
    pub enabled: bool,
    pub mode: EvolutionMode,
    pub scale_locked: bool,
    pub enabled_at_ms: u64,
    pub recent_scales: VecDeque<String>,
    pub phase: TensionPhase,
    pub next_tick_measure: Option<u64>,
    pub last_fired_measure: Option<u64>,
    pub ticks_applied: u64,
    /// (caller, responder) of the most recent call-response tick.
    pub last_pair: Option<(LoopId, LoopId)>,
}

impl EvolutionState {
    pub fn new(mode: EvolutionMode) -> Self {
        EvolutionState {
            mode,
            ..Default::default()
        }
    }

    /// Start (or restart) evolution. The next measure boundary fires.
    pub fn enable(&mut self, now_ms: u64) {
        self.enabled = true;
        self.enabled_at_ms = now_ms;
        self.next_tick_measure = None;
        self.last_fired_measure = None;
        info!("evolution enabled ({})", self.mode.label());
    }

    /// Stop scheduling ticks. Nothing is in flight, so nothing to cancel.
    pub fn disable(&mut self) {
        self.enabled = false;
        info!("evolution disabled");
    }

    /// Measure-boundary gate. Returns the measure index when a tick should
    /// fire at `step`, and schedules the next one.
    pub fn gate(&mut self, step: u64, steps_per_measure: u64, interval_measures: u64) -> Option<u64> {
        let steps_per_measure = steps_per_measure.max(1);
        if !self.enabled || step % steps_per_measure != 0 {
            return None;
        }
        let measure = step / steps_per_measure;
        match self.last_fired_measure {
            Some(last) if last == measure => return None,
            Some(last) if measure < last => {
                debug!("transport rewound to measure {measure}; rescheduling evolution");
                self.next_tick_measure = None;
            }
            _ => {}
        }
        if matches!(self.next_tick_measure, Some(next) if measure < next) {
            return None;
        }
        self.last_fired_measure = Some(measure);
        self.next_tick_measure = Some(measure + interval_measures.max(1));
        Some(measure)
    }

    /// Selection intensity for the current mode at `now_ms`.
    pub fn effective_intensity(&self, base: f32, params: &EvolutionParams, now_ms: u64) -> f32 {
        let base = clamp_unit(base);
        if self.mode != EvolutionMode::Momentum {
            return base;
        }
        let elapsed = now_ms.saturating_sub(self.enabled_at_ms) as f32;
        let progress = if params.momentum_ramp_ms == 0 {
            1.0
        } else {
            (elapsed / params.momentum_ramp_ms as f32).min(1.0)
        };
        let ceiling = params.momentum_max_intensity.max(base);
        base + (ceiling - base) * progress
    }

    /// Build the raw plan for one tick.
    pub fn plan_tick(&mut self, ctx: &PlanContext, rng: &mut SeqRng) -> MutationPlan {
        let mut plan = MutationPlan::default();
        let active = ctx.matrix.active_loops();
        let mut responder = None;

        if !self.scale_locked {
            match self.mode {
                EvolutionMode::Classic | EvolutionMode::Momentum => {
                    if rng.random_bool(ctx.params.scale_change_chance) {
                        plan.scale_change = self.pick_fresh_scale(ctx, None, rng);
                    }
                }
                EvolutionMode::TensionRelease => {
                    self.phase = self.phase.flipped();
                    plan.scale_change = self.pick_fresh_scale(ctx, Some(self.phase.family()), rng);
                }
                EvolutionMode::CallResponse => {
                    responder = self.plan_call_response(ctx, &active, &mut plan, rng);
                }
            }
        }
        if let Some(scale) = &plan.scale_change {
            self.remember_scale(scale, ctx.params.scale_history);
        }

        for id in self.select_loops(&active, ctx.intensity, rng) {
            if let Some(intent) = self.choose_mutation(ctx, id, rng) {
                plan.intents.push(intent);
            }
        }

        for &id in &active {
            let Ok(meta) = ctx.matrix.metadata(id) else { continue };
            if meta.scale != ctx.current_scale && Some(id) != responder {
                plan.intents.push(MutationIntent::Quantize {
                    loop_id: id,
                    scale: ctx.current_scale.to_string(),
                });
            }
        }

        debug!(
            "{} tick planned: scale {:?}, {} raw intents",
            self.mode.label(),
            plan.scale_change,
            plan.intents.len()
        );
        plan
    }

    /// Random scale that is not current and not recently used, optionally
    /// restricted to one family. Falls back to ignoring history when every
    /// candidate is recent.
    fn pick_fresh_scale(&self, ctx: &PlanContext, family: Option<ScaleFamily>, rng: &mut SeqRng) -> Option<String> {
        let scales = ctx.matrix.scales();
        let pool: Vec<&str> = match family {
            Some(f) => scales.names_in_family(f),
            None => scales.names().collect(),
        };
        let not_current: Vec<&str> = pool.into_iter().filter(|&n| n != ctx.current_scale).collect();
        let fresh: Vec<&str> = not_current
            .iter()
            .copied()
            .filter(|&n| !self.recent_scales.iter().any(|r| r.as_str() == n))
            .collect();
        let choice = rng.choose(&fresh).or_else(|| rng.choose(&not_current));
        choice.map(|s| s.to_string())
    }

    fn remember_scale(&mut self, scale: &str, history: usize) {
        self.recent_scales.push_back(scale.to_string());
        while self.recent_scales.len() > history {
            self.recent_scales.pop_front();
        }
    }

    /// Pair two active loops and re-harmonize the responder toward the
    /// caller. Returns the responder.
    fn plan_call_response(
        &mut self,
        ctx: &PlanContext,
        active: &[LoopId],
        plan: &mut MutationPlan,
        rng: &mut SeqRng,
    ) -> Option<LoopId> {
        if active.len() < 2 {
            return None;
        }
        let picks = rng.sample_distinct(active.len(), 2);
        let (caller, responder) = (active[picks[0]], active[picks[1]]);
        let caller_scale = ctx.matrix.metadata(caller).ok()?.scale.clone();
        let responder_scale = ctx.matrix.metadata(responder).ok()?.scale.clone();

        let related = ctx.matrix.scales().related(&caller_scale).ok()?;
        let options: Vec<&str> = related.iter().copied().filter(|&s| s != responder_scale).collect();
        let target = rng.choose(&options).or_else(|| related.first())?.to_string();

        debug!("call-response: {caller} calls, {responder} answers in {target}");
        self.remember_scale(&target, ctx.params.scale_history);
        self.last_pair = Some((caller, responder));
        plan.intents.push(MutationIntent::MetadataUpdate {
            loop_id: responder,
            patch: MetadataPatch::scale(&target),
        });
        plan.intents.push(MutationIntent::Regenerate {
            loop_id: responder,
            pattern: None,
        });
        Some(responder)
    }

    /// `max(1, round(n * intensity))` distinct active loops.
    fn select_loops(&self, active: &[LoopId], intensity: f32, rng: &mut SeqRng) -> Vec<LoopId> {
        if active.is_empty() {
            return Vec::new();
        }
        let n = active.len();
        let count = ((n as f32 * clamp_unit(intensity)).round() as usize).clamp(1, n);
        let mut picks = rng.sample_distinct(n, count);
        picks.sort_unstable();
        picks.into_iter().map(|i| active[i]).collect()
    }

    fn choose_mutation(&self, ctx: &PlanContext, id: LoopId, rng: &mut SeqRng) -> Option<MutationIntent> {
        let meta = ctx.matrix.metadata(id).ok()?;
        let params = ctx.params;
        let density_weight = if meta.density_mode == DensityMode::Auto {
            params.density_weight
        } else {
            0.0
        };
        let weights = [params.regenerate_weight, density_weight, params.transpose_weight];
        let intent = match rng.weighted_index(&weights) {
            Some(1) => {
                let current = meta.effective_density();
                let nudged = current + (ctx.density_target - current) * params.density_nudge;
                let jitter = rng.range_f32(-DENSITY_JITTER, DENSITY_JITTER);
                MutationIntent::DensityAdjust {
                    loop_id: id,
                    target: clamp_unit(nudged + jitter),
                }
            }
            Some(2) => {
                let span = params.transpose_span.max(1);
                let magnitude = rng.range_i32_inclusive(1, span);
                let degrees = if rng.random_bool(0.5) { magnitude } else { -magnitude };
                MutationIntent::Transpose { loop_id: id, degrees }
            }
            _ => MutationIntent::Regenerate {
                loop_id: id,
                pattern: None,
            },
        };
        Some(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::LoopMetadata;
    use crate::scale::ScaleBook;

    fn matrix(active: usize) -> NotesMatrix {
        let mut m = NotesMatrix::new(ScaleBook::builtin(), 5);
        for i in 0..active {
            let meta = LoopMetadata {
                is_active: true,
                scale: "minor".into(),
                ..LoopMetadata::default()
            };
            m.initialize_loop(LoopId(i), meta).unwrap();
        }
        m
    }

    fn ctx<'a>(m: &'a NotesMatrix, scale: &'a str, params: &'a EvolutionParams) -> PlanContext<'a> {
        PlanContext {
            matrix: m,
            current_scale: scale,
            params,
            intensity: params.intensity,
            density_target: 0.5,
        }
    }

    #[test]
    fn test_gate_fires_once_per_measure() {
        let mut ev = EvolutionState::default();
        ev.enable(0);
        let measures = 6;
        let fired: Vec<u64> = (0..16 * measures).filter_map(|s| ev.gate(s, 16, 1)).collect();
        assert_eq!(fired, (0..measures).collect::<Vec<_>>());
        // Re-delivering the same boundary step does not fire again.
        assert_eq!(ev.gate(16 * (measures - 1), 16, 1), None);
    }

    #[test]
    fn test_gate_respects_interval() {
        let mut ev = EvolutionState::default();
        ev.enable(0);
        let fired: Vec<u64> = (0..16 * 7).filter_map(|s| ev.gate(s, 16, 3)).collect();
        assert_eq!(fired, vec![0, 3, 6]);
    }

    #[test]
    fn test_gate_first_fire_after_enable_mid_run() {
        let mut ev = EvolutionState::default();
        assert_eq!(ev.gate(0, 4, 1), None);
        ev.enable(0);
        assert_eq!(ev.gate(9, 4, 1), None);
        assert_eq!(ev.gate(12, 4, 1), Some(3));
        assert_eq!(ev.gate(16, 4, 1), Some(4));
    }

    #[test]
    fn test_gate_disabled_and_rewind() {
        let mut ev = EvolutionState::default();
        ev.enable(0);
        assert_eq!(ev.gate(32, 16, 4), Some(2));
        assert_eq!(ev.gate(48, 16, 4), None);
        // Transport jumped back to the top.
        assert_eq!(ev.gate(0, 16, 4), Some(0));
        ev.disable();
        assert_eq!(ev.gate(64, 16, 4), None);
    }

    #[test]
    fn test_momentum_ramps_and_caps() {
        let params = EvolutionParams {
            momentum_ramp_ms: 1000,
            momentum_max_intensity: 0.9,
            ..EvolutionParams::default()
        };
        let mut ev = EvolutionState::new(EvolutionMode::Momentum);
        ev.enable(500);
        assert_eq!(ev.effective_intensity(0.4, &params, 500), 0.4);
        assert!((ev.effective_intensity(0.4, &params, 1000) - 0.65).abs() < 1e-6);
        assert!((ev.effective_intensity(0.4, &params, 9000) - 0.9).abs() < 1e-6);
        ev.mode = EvolutionMode::Classic;
        assert_eq!(ev.effective_intensity(0.4, &params, 9000), 0.4);
    }

    #[test]
    fn test_selection_size_follows_intensity() {
        let m = matrix(4);
        let params = EvolutionParams {
            scale_change_chance: 0.0,
            intensity: 0.5,
            ..EvolutionParams::default()
        };
        let mut ev = EvolutionState::default();
        let mut rng = SeqRng::new(9);
        for _ in 0..20 {
            let plan = ev.plan_tick(&ctx(&m, "minor", &params), &mut rng);
            assert!(plan.scale_change.is_none());
            assert_eq!(plan.targeted_loops().len(), 2);
            assert_eq!(plan.intents.len(), 2);
        }
        let low = EvolutionParams {
            intensity: 0.0,
            ..params
        };
        let plan = ev.plan_tick(&ctx(&m, "minor", &low), &mut rng);
        assert_eq!(plan.intents.len(), 1);
    }

    #[test]
    fn test_classic_avoids_recent_scales() {
        let m = matrix(2);
        let params = EvolutionParams {
            scale_change_chance: 1.0,
            scale_history: 3,
            ..EvolutionParams::default()
        };
        let mut ev = EvolutionState::default();
        let mut rng = SeqRng::new(21);
        let mut current = "minor".to_string();
        let mut history: Vec<String> = Vec::new();
        for _ in 0..40 {
            let plan = ev.plan_tick(&ctx(&m, &current, &params), &mut rng);
            let next = plan.scale_change.unwrap();
            assert_ne!(next, current);
            assert!(!history.iter().rev().take(3).any(|h| *h == next), "{next} repeated too soon");
            history.push(next.clone());
            current = next;
        }
    }

    #[test]
    fn test_tension_release_alternates_families() {
        let m = matrix(2);
        let params = EvolutionParams::default();
        let mut ev = EvolutionState::new(EvolutionMode::TensionRelease);
        let mut rng = SeqRng::new(4);
        let book = ScaleBook::builtin();
        let mut current = "minor".to_string();
        let mut families = Vec::new();
        for _ in 0..6 {
            let plan = ev.plan_tick(&ctx(&m, &current, &params), &mut rng);
            let next = plan.scale_change.unwrap();
            families.push(book.family(&next).unwrap());
            current = next;
        }
        use ScaleFamily::*;
        assert_eq!(families, vec![Dissonant, Consonant, Dissonant, Consonant, Dissonant, Consonant]);
    }

    #[test]
    fn test_scale_lock_suppresses_scale_decisions() {
        let m = matrix(3);
        let params = EvolutionParams {
            scale_change_chance: 1.0,
            ..EvolutionParams::default()
        };
        let mut rng = SeqRng::new(2);
        for mode in EvolutionMode::ALL {
            let mut ev = EvolutionState::new(mode);
            ev.scale_locked = true;
            let plan = ev.plan_tick(&ctx(&m, "minor", &params), &mut rng);
            assert!(plan.scale_change.is_none());
            assert!(
                !plan
                    .intents
                    .iter()
                    .any(|i| matches!(i, MutationIntent::MetadataUpdate { .. }))
            );
        }
    }

    #[test]
    fn test_call_response_reharmonizes_responder() {
        let m = matrix(3);
        let params = EvolutionParams::default();
        let mut ev = EvolutionState::new(EvolutionMode::CallResponse);
        let mut rng = SeqRng::new(17);
        let plan = ev.plan_tick(&ctx(&m, "minor", &params), &mut rng);
        assert!(plan.scale_change.is_none());
        let (caller, responder) = ev.last_pair.unwrap();
        assert_ne!(caller, responder);

        let related = m.scales().related("minor").unwrap();
        let update = plan.intents.iter().find_map(|i| match i {
            MutationIntent::MetadataUpdate { loop_id, patch } if *loop_id == responder => patch.scale.clone(),
            _ => None,
        });
        let target = update.unwrap();
        assert!(related.contains(&target.as_str()), "{target} not related to minor");
        assert!(plan.intents.contains(&MutationIntent::Regenerate {
            loop_id: responder,
            pattern: None
        }));
    }

    #[test]
    fn test_stray_loops_get_quantized() {
        let mut m = matrix(3);
        m.update_metadata(LoopId(2), &MetadataPatch::scale("dorian")).unwrap();
        let params = EvolutionParams {
            scale_change_chance: 0.0,
            ..EvolutionParams::default()
        };
        let mut ev = EvolutionState::default();
        let plan = ev.plan_tick(&ctx(&m, "minor", &params), &mut SeqRng::new(1));
        assert!(plan.intents.contains(&MutationIntent::Quantize {
            loop_id: LoopId(2),
            scale: "minor".into()
        }));
    }

    #[test]
    fn test_manual_loops_never_get_density_intents() {
        let mut m = matrix(2);
        for i in 0..2 {
            let patch = MetadataPatch {
                density_mode: Some(DensityMode::Manual),
                ..Default::default()
            };
            m.update_metadata(LoopId(i), &patch).unwrap();
        }
        let params = EvolutionParams {
            scale_change_chance: 0.0,
            intensity: 1.0,
            regenerate_weight: 0.0,
            density_weight: 1.0,
            transpose_weight: 0.0,
            ..EvolutionParams::default()
        };
        let mut ev = EvolutionState::default();
        let mut rng = SeqRng::new(8);
        for _ in 0..10 {
            let plan = ev.plan_tick(&ctx(&m, "minor", &params), &mut rng);
            assert!(
                plan.intents
                    .iter()
                    .all(|i| matches!(i, MutationIntent::Regenerate { .. }))
            );
        }
    }

    #[test]
    fn test_mode_labels_round_trip() {
        for mode in EvolutionMode::ALL {
            assert_eq!(EvolutionMode::from_label(mode.label()), Some(mode));
        }
        assert_eq!(EvolutionMode::from_label("jazz"), None);
    }
}
