// Top-level sequencer state and transport entry point.
//
// `Sequencer` is the single owner of everything mutable: the notes matrix,
// the energy manager, the evolution state, the live global parameters, the
// current global scale and the master PRNG. Nothing in the crate holds a
// global; every component gets what it needs passed in from here.
//
// Three ways in:
//
// - `on_step(step, now_ms)`: called by the external transport once per audio
//   step. Forwards the step to the evolution gate; on a measure boundary
//   that the gate lets through, runs one evolution tick (see below).
// - `apply_command(EngineCommand)` and the matching methods: direct
//   requests from the UI/config layer. Numeric payloads are clamped here.
// - `import_state` / `load_json`: wholesale replacement from persistence.
//
// ## Evolution tick
//
//   1. Compute the mode-adjusted intensity and the adaptive density target.
//   2. `EvolutionState::plan_tick` builds a raw plan (evolution.rs).
//   3. `intent::coalesce` vetoes locked loops, merges, collapses.
//   4. `intent::validate` resolves every scale name the plan mentions; a
//      failure aborts the tick before any write.
//   5. The plan is applied: scale change first, then metadata, density,
//      quantize, regenerate, transpose.
//   6. `EnergyManager::check_and_balance`, then rows of loops whose density
//      was lowered are thinned to match.
//
// Steps 5 and 6 run inside one matrix batch, so observers see one change
// notice per tick.
//
// ## Regeneration
//
// Every regeneration forks a child stream from the master PRNG, picks a
// generator from the loop's pattern probabilities (unless one was requested),
// runs it, passes the row through the counterpoint resolver when enabled and
// other loops are sounding, and writes it back with `set_loop_notes`, which
// enforces the silence invariant.
//
// ## Scale changes
//
// `update_scale` to the current scale returns immediately: no quantization,
// no writes, no logging. Otherwise the new scale is resolved first (unknown
// names are an error, nothing changes), every loop's quantized row is
// computed, and only then are the rows committed in one batch. A scale
// change planned by evolution skips locked loops; they keep their own scale
// until the user changes it. Blank slots pick up the new scale as well.

use crate::command::EngineCommand;
use crate::config::{EnergyParams, EngineConfig, clamp_unit};
use crate::counterpoint::apply_counterpoint;
use crate::energy::{BalanceReport, EnergyManager, EnergySnapshot};
use crate::error::Result;
use crate::evolution::{EvolutionMode, EvolutionState, PlanContext};
use crate::generate::{GenerationSpec, GeneratorOptions, NoteRow, PatternKind, generate};
use crate::intent::{MutationIntent, MutationPlan, coalesce, validate};
use crate::matrix::{
    AudioParams, DensityMode, LoopId, LoopMetadata, MAX_LOOPS, MetadataPatch, NotesMatrix, Observer,
};
use crate::scale::{ScaleBook, clamp_note, clamp_range, pitch_name};
use driftloom_prng::SeqRng;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Longest evolve interval a caller can set, in measures.
pub const MAX_EVOLVE_INTERVAL: u64 = 64;
/// Register spread for default loop base notes wraps within two octaves.
const BASE_NOTE_WRAP: i32 = 24;

/// The global parameters a UI adjusts live. Clamped on every write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalParams {
    pub evolve_interval_measures: u64,
    pub evolve_intensity: f32,
    pub max_sonic_energy: f32,
    pub energy_reduction_factor: f32,
    pub global_density_bias: f32,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl GlobalParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        GlobalParams {
            evolve_interval_measures: config.evolution.interval_measures,
            evolve_intensity: config.evolution.intensity,
            max_sonic_energy: config.energy.max_sonic_energy,
            energy_reduction_factor: config.energy.reduction_factor,
            global_density_bias: config.global_density_bias,
        }
        .sanitized()
    }

    pub fn sanitized(mut self) -> Self {
        self.evolve_interval_measures = self.evolve_interval_measures.clamp(1, MAX_EVOLVE_INTERVAL);
        self.evolve_intensity = clamp_unit(self.evolve_intensity);
        self.max_sonic_energy = if self.max_sonic_energy.is_finite() {
            self.max_sonic_energy.max(0.0)
        } else {
            0.0
        };
        self.energy_reduction_factor = if self.energy_reduction_factor.is_nan() {
            0.5
        } else {
            self.energy_reduction_factor.clamp(0.01, 0.99)
        };
        self.global_density_bias = clamp_unit(self.global_density_bias);
        self
    }
}

/// Non-loop state carried through export/import.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalState {
    pub current_scale: String,
    pub params: GlobalParams,
    pub evolution: EvolutionState,
    pub now_ms: u64,
}

impl Default for GlobalState {
    fn default() -> Self {
        GlobalState {
            current_scale: EngineConfig::default().default_scale,
            params: GlobalParams::default(),
            evolution: EvolutionState::default(),
            now_ms: 0,
        }
    }
}

/// Everything persistence needs. Missing fields fill in from defaults, so
/// partial and legacy documents load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSnapshot {
    pub notes: BTreeMap<LoopId, NoteRow>,
    pub metadata: BTreeMap<LoopId, LoopMetadata>,
    pub global: GlobalState,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// What one evolution tick did.
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub measure: u64,
    pub scale_change: Option<String>,
    /// The coalesced intents, as applied.
    pub intents: Vec<MutationIntent>,
    /// Loops whose rows or metadata the plan wrote.
    pub touched: Vec<LoopId>,
    pub balance: BalanceReport,
}

pub struct Sequencer {
    config: EngineConfig,
    params: GlobalParams,
    matrix: NotesMatrix,
    energy: EnergyManager,
    evolution: EvolutionState,
    rng: SeqRng,
    current_scale: String,
    now_ms: u64,
    /// Per-loop quantizations performed so far.
    quantizations: u64,
}

impl Sequencer {
    /// A sequencer with the built-in scale table and no loops.
    pub fn new(config: EngineConfig, seed: u64) -> Result<Self> {
        Self::with_scales(config, ScaleBook::builtin(), seed)
    }

    pub fn with_scales(config: EngineConfig, scales: ScaleBook, seed: u64) -> Result<Self> {
        let config = config.sanitized();
        scales.get(&config.default_scale)?;
        let mut rng = SeqRng::new(seed);
        let mut matrix = NotesMatrix::new(scales, rng.next_u64());
        matrix.set_default_scale(&config.default_scale)?;
        Ok(Sequencer {
            params: GlobalParams::from_config(&config),
            evolution: EvolutionState::new(config.evolution.mode),
            current_scale: config.default_scale.clone(),
            config,
            matrix,
            energy: EnergyManager::new(),
            rng,
            now_ms: 0,
            quantizations: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn params(&self) -> &GlobalParams {
        &self.params
    }

    pub fn matrix(&self) -> &NotesMatrix {
        &self.matrix
    }

    pub fn evolution(&self) -> &EvolutionState {
        &self.evolution
    }

    pub fn current_scale(&self) -> &str {
        &self.current_scale
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn quantizations(&self) -> u64 {
        self.quantizations
    }

    pub fn ticks_applied(&self) -> u64 {
        self.evolution.ticks_applied
    }

    pub fn subscribe(&mut self, observer: Observer) {
        self.matrix.subscribe(observer);
    }

    // -----------------------------------------------------------------------
    // Read side (audio playback boundary)
    // -----------------------------------------------------------------------

    pub fn get_loop_notes(&self, id: LoopId) -> Result<&[Option<u8>]> {
        self.matrix.loop_notes(id)
    }

    pub fn get_effective_density(&self, id: LoopId) -> Result<f32> {
        self.matrix.effective_density(id)
    }

    /// Current energy, from cache when still valid.
    pub fn energy_snapshot(&mut self) -> EnergySnapshot {
        let params = self.energy_params();
        self.energy.snapshot(&self.matrix, &params, self.now_ms)
    }

    fn energy_params(&self) -> EnergyParams {
        EnergyParams {
            max_sonic_energy: self.params.max_sonic_energy,
            reduction_factor: self.params.energy_reduction_factor,
            ..self.config.energy.clone()
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Metadata a fresh loop gets from the configured defaults. Base notes
    /// step up by `base_note_spread` per loop id, wrapping within two
    /// octaves.
    pub fn default_loop_metadata(&self, id: LoopId) -> LoopMetadata {
        let d = &self.config.loops;
        let offset = (id.0 as i32 * d.base_note_spread as i32) % BASE_NOTE_WRAP;
        let base = clamp_note(d.base_note as i32 + offset);
        let half = d.range_half_width as i32;
        let (lo, hi) = clamp_range(base as i32 - half, base as i32 + half);
        let auto_density = EnergyManager::adaptive_density_target(&self.config.energy, self.params.global_density_bias);
        LoopMetadata {
            is_active: true,
            length: d.length,
            scale: self.current_scale.clone(),
            base_note: base,
            note_range_min: lo,
            note_range_max: hi,
            density_mode: DensityMode::Auto,
            manual_density: d.density,
            auto_density,
            pattern_probabilities: d.pattern_probabilities,
            audio: AudioParams {
                volume: d.volume,
                ..AudioParams::default()
            },
            ..LoopMetadata::default()
        }
    }

    /// Initialize `id` from the configured defaults and generate its first
    /// pattern.
    pub fn add_loop(&mut self, id: LoopId) -> Result<()> {
        self.matrix.check(id)?;
        let meta = self.default_loop_metadata(id);
        self.initialize_loop(id, meta)?;
        self.regenerate(id, None)?;
        Ok(())
    }

    /// Set a loop's metadata. An already-initialized loop keeps its notes.
    pub fn initialize_loop(&mut self, id: LoopId, meta: LoopMetadata) -> Result<()> {
        self.matrix.initialize_loop(id, meta)?;
        self.energy.invalidate();
        Ok(())
    }

    pub fn set_loop_active(&mut self, id: LoopId, active: bool) -> Result<()> {
        self.matrix.set_loop_active(id, active)?;
        self.energy.invalidate();
        Ok(())
    }

    pub fn update_loop_metadata(&mut self, id: LoopId, patch: &MetadataPatch) -> Result<()> {
        self.matrix.update_metadata(id, patch)?;
        self.energy.invalidate();
        Ok(())
    }

    /// Switch density mode. Unlocked loops are regenerated at the new
    /// effective density.
    pub fn set_loop_density_mode(&mut self, id: LoopId, mode: DensityMode) -> Result<()> {
        let patch = MetadataPatch {
            density_mode: Some(mode),
            ..Default::default()
        };
        self.matrix.update_metadata(id, &patch)?;
        self.regenerate_for_density(id)
    }

    /// Set the manual density (clamped to [0, 1]). Regenerates the loop if
    /// it is in manual mode and unlocked.
    pub fn set_manual_density(&mut self, id: LoopId, density: f32) -> Result<()> {
        let patch = MetadataPatch {
            manual_density: Some(density),
            ..Default::default()
        };
        self.matrix.update_metadata(id, &patch)?;
        if self.matrix.metadata(id)?.density_mode == DensityMode::Manual {
            self.regenerate_for_density(id)?;
        }
        self.energy.invalidate();
        Ok(())
    }

    fn regenerate_for_density(&mut self, id: LoopId) -> Result<()> {
        if self.matrix.metadata(id)?.is_locked() {
            debug!("{id} is locked; density change leaves its notes alone");
        } else {
            self.regenerate(id, None)?;
        }
        self.energy.invalidate();
        Ok(())
    }

    /// Regenerate one loop on user request. Works on locked loops.
    pub fn regenerate_loop(&mut self, id: LoopId, pattern: Option<PatternKind>) -> Result<PatternKind> {
        let kind = self.regenerate(id, pattern)?;
        self.energy.invalidate();
        Ok(kind)
    }

    /// Regenerate every active, unlocked loop in one batch. A failure on one
    /// loop does not stop the others; the first error is returned after all
    /// loops were attempted.
    pub fn regenerate_all(&mut self) -> Result<Vec<LoopId>> {
        let targets: Vec<LoopId> = self
            .matrix
            .active_loops()
            .into_iter()
            .filter(|&id| self.matrix.metadata(id).is_ok_and(|m| !m.is_locked()))
            .collect();
        let result = self.batched(|seq| {
            let mut first_error = None;
            for &id in &targets {
                if let Err(e) = seq.regenerate(id, None) {
                    warn!("regenerating {id} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        });
        self.energy.invalidate();
        result.map(|()| targets)
    }

    fn regenerate(&mut self, id: LoopId, pattern: Option<PatternKind>) -> Result<PatternKind> {
        let meta = self.matrix.metadata(id)?.clone();
        let intervals = self.matrix.scales().get(&meta.scale)?.to_vec();
        let kind = match pattern {
            Some(kind) => kind,
            None => meta.pattern_probabilities.choose(&mut self.rng),
        };
        let options = GeneratorOptions::defaults_for(kind, self.config.max_tail);
        let spec = GenerationSpec {
            length: meta.length,
            intervals: &intervals,
            base_note: meta.base_note,
            range_min: meta.note_range_min,
            range_max: meta.note_range_max,
            density: meta.effective_density(),
        };
        let mut stream = self.rng.fork();
        let mut row = generate(&spec, &options, &mut stream);

        if self.config.counterpoint_enabled && meta.is_active {
            let others = self.matrix.active_rows_except(id);
            let moved = apply_counterpoint(
                &mut row,
                &others,
                &intervals,
                meta.base_note,
                meta.note_range_min,
                meta.note_range_max,
            );
            if moved > 0 {
                debug!("counterpoint moved {moved} notes of {id}");
            }
        }

        self.matrix.set_loop_notes(id, &row, Some(kind.label()))?;
        Ok(kind)
    }

    // -----------------------------------------------------------------------
    // Scale
    // -----------------------------------------------------------------------

    /// Change the global scale, re-quantizing every loop, locked ones
    /// included. Returns whether anything changed. All-or-nothing: an
    /// unknown scale leaves every loop as it was.
    pub fn update_scale(&mut self, scale: &str) -> Result<bool> {
        if scale == self.current_scale {
            return Ok(false);
        }
        self.batched(|seq| seq.change_scale(scale, true))?;
        self.energy.invalidate();
        Ok(true)
    }

    /// Caller checked that `scale` differs from the current one. Locked
    /// loops are re-quantized only when `include_locked` is set, which the
    /// user path does and evolution never does.
    fn change_scale(&mut self, scale: &str, include_locked: bool) -> Result<Vec<LoopId>> {
        self.matrix.scales().get(scale)?;
        let mut ids = Vec::new();
        for id in self.matrix.initialized_loops() {
            if include_locked || !self.matrix.metadata(id)?.is_locked() {
                ids.push(id);
            }
        }
        let mut rows = Vec::with_capacity(ids.len());
        for &id in &ids {
            rows.push((id, self.matrix.quantized_row(id, scale)?));
        }
        for (id, row) in &rows {
            self.matrix.commit_row(*id, row, Some(scale), "quantize")?;
            self.quantizations += 1;
        }
        info!("scale {} -> {scale}, {} loops re-quantized", self.current_scale, ids.len());
        self.matrix.set_default_scale(scale)?;
        self.current_scale = scale.to_string();
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Global parameters
    // -----------------------------------------------------------------------

    pub fn set_evolve_interval(&mut self, measures: u64) {
        self.params.evolve_interval_measures = measures.clamp(1, MAX_EVOLVE_INTERVAL);
    }

    pub fn set_evolve_intensity(&mut self, intensity: f32) {
        self.params.evolve_intensity = clamp_unit(intensity);
    }

    pub fn set_max_sonic_energy(&mut self, energy: f32) {
        self.params = GlobalParams {
            max_sonic_energy: energy,
            ..self.params.clone()
        }
        .sanitized();
    }

    pub fn set_energy_reduction_factor(&mut self, factor: f32) {
        self.params = GlobalParams {
            energy_reduction_factor: factor,
            ..self.params.clone()
        }
        .sanitized();
    }

    /// Set the global density bias and push the new adaptive target into
    /// every unlocked auto-mode loop, regenerating the ones that changed.
    pub fn set_global_density_bias(&mut self, bias: f32) -> Result<()> {
        self.params.global_density_bias = clamp_unit(bias);
        let params = self.energy_params();
        let changed = self
            .energy
            .apply_adaptive_density(&mut self.matrix, &params, self.params.global_density_bias)?;
        self.batched(|seq| {
            for &id in &changed {
                seq.regenerate(id, None)?;
            }
            Ok(())
        })
    }

    pub fn set_evolution_enabled(&mut self, enabled: bool) {
        if enabled {
            self.evolution.enable(self.now_ms);
        } else {
            self.evolution.disable();
        }
    }

    pub fn set_evolution_mode(&mut self, mode: EvolutionMode) {
        self.evolution.mode = mode;
    }

    pub fn set_scale_locked(&mut self, locked: bool) {
        self.evolution.scale_locked = locked;
    }

    pub fn apply_command(&mut self, command: EngineCommand) -> Result<()> {
        match command {
            EngineCommand::SetLoopActive { loop_id, active } => self.set_loop_active(loop_id, active)?,
            EngineCommand::UpdateLoopMetadata { loop_id, patch } => self.update_loop_metadata(loop_id, &patch)?,
            EngineCommand::RegenerateLoop { loop_id, pattern } => {
                self.regenerate_loop(loop_id, pattern)?;
            }
            EngineCommand::RegenerateAll => {
                self.regenerate_all()?;
            }
            EngineCommand::UpdateScale { scale } => {
                self.update_scale(&scale)?;
            }
            EngineCommand::SetLoopDensityMode { loop_id, mode } => self.set_loop_density_mode(loop_id, mode)?,
            EngineCommand::SetManualDensity { loop_id, density } => self.set_manual_density(loop_id, density)?,
            EngineCommand::SetEvolveInterval { measures } => self.set_evolve_interval(measures),
            EngineCommand::SetEvolveIntensity { intensity } => self.set_evolve_intensity(intensity),
            EngineCommand::SetMaxSonicEnergy { energy } => self.set_max_sonic_energy(energy),
            EngineCommand::SetEnergyReductionFactor { factor } => self.set_energy_reduction_factor(factor),
            EngineCommand::SetGlobalDensityBias { bias } => self.set_global_density_bias(bias)?,
            EngineCommand::SetEvolutionEnabled { enabled } => self.set_evolution_enabled(enabled),
            EngineCommand::SetEvolutionMode { mode } => self.set_evolution_mode(mode),
            EngineCommand::SetScaleLocked { locked } => self.set_scale_locked(locked),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transport and evolution
    // -----------------------------------------------------------------------

    /// Called by the transport once per step. Returns a report when an
    /// evolution tick ran.
    pub fn on_step(&mut self, step: u64, now_ms: u64) -> Result<Option<TickReport>> {
        self.now_ms = now_ms;
        self.matrix.set_clock(now_ms);
        let gate = self.evolution.gate(
            step,
            self.config.steps_per_measure,
            self.params.evolve_interval_measures,
        );
        match gate {
            Some(measure) => self.run_tick(measure).map(Some),
            None => Ok(None),
        }
    }

    fn run_tick(&mut self, measure: u64) -> Result<TickReport> {
        let energy_params = self.energy_params();
        let intensity = self
            .evolution
            .effective_intensity(self.params.evolve_intensity, &self.config.evolution, self.now_ms);
        let density_target = EnergyManager::adaptive_density_target(&energy_params, self.params.global_density_bias);

        let raw = {
            let ctx = PlanContext {
                matrix: &self.matrix,
                current_scale: &self.current_scale,
                params: &self.config.evolution,
                intensity,
                density_target,
            };
            self.evolution.plan_tick(&ctx, &mut self.rng)
        };
        let plan = coalesce(raw, &self.current_scale, &self.matrix);
        validate(&plan, &self.matrix)?;

        let (touched, balance) = self.batched(|seq| {
            let touched = seq.apply_plan(&plan)?;
            let balance = seq.balance(&energy_params)?;
            Ok((touched, balance))
        })?;
        self.evolution.ticks_applied += 1;

        info!(
            "measure {measure}: evolution tick {} applied {} intents to {} loops",
            self.evolution.ticks_applied,
            plan.intents.len(),
            touched.len()
        );
        Ok(TickReport {
            measure,
            scale_change: plan.scale_change,
            intents: plan.intents,
            touched,
            balance,
        })
    }

    /// Apply a coalesced, validated plan. Caller opens the batch.
    fn apply_plan(&mut self, plan: &MutationPlan) -> Result<Vec<LoopId>> {
        let mut touched = BTreeSet::new();
        if let Some(scale) = &plan.scale_change {
            touched.extend(self.change_scale(scale, false)?);
        }
        for intent in &plan.intents {
            match intent {
                MutationIntent::MetadataUpdate { loop_id, patch } => {
                    self.matrix.update_metadata(*loop_id, patch)?;
                    touched.insert(*loop_id);
                }
                MutationIntent::DensityAdjust { loop_id, target } => {
                    if self.matrix.metadata(*loop_id)?.density_mode != DensityMode::Auto {
                        debug!("ignoring density intent for manual {loop_id}");
                        continue;
                    }
                    self.matrix.set_auto_density(*loop_id, *target)?;
                    self.regenerate(*loop_id, None)?;
                    touched.insert(*loop_id);
                }
                MutationIntent::Quantize { loop_id, scale } => {
                    self.matrix.quantize_loop(*loop_id, scale)?;
                    self.quantizations += 1;
                    touched.insert(*loop_id);
                }
                MutationIntent::Regenerate { loop_id, pattern } => {
                    self.regenerate(*loop_id, *pattern)?;
                    touched.insert(*loop_id);
                }
                MutationIntent::RegenerateAll => {
                    for id in self.matrix.active_loops() {
                        if self.matrix.metadata(id)?.is_locked() {
                            continue;
                        }
                        self.regenerate(id, None)?;
                        touched.insert(id);
                    }
                }
                MutationIntent::Transpose { loop_id, degrees } => {
                    self.matrix.transpose_loop(*loop_id, *degrees)?;
                    touched.insert(*loop_id);
                }
            }
        }
        self.energy.invalidate();
        Ok(touched.into_iter().collect())
    }

    fn balance(&mut self, params: &EnergyParams) -> Result<BalanceReport> {
        let report = self.energy.check_and_balance(&mut self.matrix, params, self.now_ms)?;
        if !report.density_reduced.is_empty() {
            let reduced = report.density_reduced.clone();
            self.batched(|seq| {
                for id in reduced {
                    let removed = seq.matrix.thin_to_density(id)?;
                    if removed > 0 {
                        debug!("thinned {removed} notes from {id}");
                    }
                }
                Ok(())
            })?;
        }
        Ok(report)
    }

    /// Run `f` inside one matrix batch; the batch closes even on error.
    fn batched<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.matrix.begin_batch();
        let out = f(self);
        self.matrix.end_batch();
        out
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn export_state(&self) -> EngineSnapshot {
        let mut snapshot = EngineSnapshot {
            global: GlobalState {
                current_scale: self.current_scale.clone(),
                params: self.params.clone(),
                evolution: self.evolution.clone(),
                now_ms: self.now_ms,
            },
            ..Default::default()
        };
        for id in self.matrix.initialized_loops() {
            if let (Ok(notes), Ok(meta)) = (self.matrix.loop_notes(id), self.matrix.metadata(id)) {
                snapshot.notes.insert(id, notes.to_vec());
                snapshot.metadata.insert(id, meta.clone());
            }
        }
        snapshot
    }

    /// Replace the whole engine state. Every loop id and scale name is
    /// checked before anything is written; loops with notes but no metadata
    /// get defaults sized to their notes.
    pub fn import_state(&mut self, snapshot: EngineSnapshot) -> Result<()> {
        let EngineSnapshot {
            mut notes,
            metadata,
            global,
        } = snapshot;
        let scales = self.matrix.scales();
        scales.get(&global.current_scale)?;

        let mut loops: BTreeMap<LoopId, (LoopMetadata, NoteRow)> = BTreeMap::new();
        for (id, meta) in metadata {
            self.matrix.check(id)?;
            scales.get(&meta.scale)?;
            let row = notes.remove(&id).unwrap_or_default();
            loops.insert(id, (meta, row));
        }
        for (id, row) in notes {
            self.matrix.check(id)?;
            let meta = LoopMetadata {
                length: row.len(),
                scale: global.current_scale.clone(),
                ..LoopMetadata::default()
            };
            loops.insert(id, (meta, row));
        }

        self.batched(|seq| {
            seq.matrix.set_default_scale(&global.current_scale)?;
            for i in 0..MAX_LOOPS {
                let id = LoopId(i);
                match loops.remove(&id) {
                    Some((meta, row)) => seq.matrix.load_loop(id, meta, &row)?,
                    None => seq.matrix.clear_loop(id)?,
                }
            }
            Ok(())
        })?;

        self.params = global.params.sanitized();
        self.evolution = global.evolution;
        self.current_scale = global.current_scale;
        self.now_ms = global.now_ms;
        self.matrix.set_clock(self.now_ms);
        self.energy.invalidate();
        info!("imported state: {} loops, scale {}", self.matrix.initialized_loops().len(), self.current_scale);
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        self.export_state().to_json()
    }

    pub fn load_json(&mut self, json: &str) -> Result<()> {
        self.import_state(EngineSnapshot::from_json(json)?)
    }

    /// One text line per active loop: settings, then the row as note names.
    pub fn summary(&self) -> String {
        let energy = EnergyManager::compute_energy(&self.matrix, &self.energy_params());
        let mut out = String::new();
        let _ = writeln!(
            out,
            "scale {} | evolution {} ({}) | energy {:.2} / {:.2}",
            self.current_scale,
            if self.evolution.enabled { "on" } else { "off" },
            self.evolution.mode.label(),
            energy.total,
            self.params.max_sonic_energy
        );
        for id in self.matrix.active_loops() {
            let (Ok(meta), Ok(row)) = (self.matrix.metadata(id), self.matrix.loop_notes(id)) else {
                continue;
            };
            let mode = match meta.density_mode {
                DensityMode::Auto => "auto",
                DensityMode::Manual => "manual",
            };
            let lock = if meta.is_locked() { " locked" } else { "" };
            let _ = write!(
                out,
                "{:>2} {:<16} {:>2} steps d={:.2} {}{} vol={:.2} |",
                id.0,
                meta.scale,
                meta.length,
                meta.effective_density(),
                mode,
                lock,
                meta.audio.volume
            );
            for cell in row {
                match cell {
                    Some(n) => {
                        let _ = write!(out, " {:<3}", pitch_name(*n));
                    }
                    None => out.push_str(" .  "),
                }
            }
            out.push('\n');
        }
        out
    }
}
