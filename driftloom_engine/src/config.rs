// Data-driven engine configuration.
//
// Every tunable the engine reads lives in `EngineConfig`, loadable from JSON
// so a composition's character can be reworked without recompiling. Engine
// logic never hardcodes these numbers; it reads them from here.
//
// Parameters are grouped into nested sub-structs: `LoopDefaults` (what a
// freshly initialized loop looks like), `EvolutionParams` (tick cadence,
// creative-mode policies, mutation mix) and `EnergyParams` (sonic energy
// ceiling and adaptive density window). All fields carry `#[serde(default)]`
// so partial JSON files fill the gaps from `Default`.
//
// The subset a UI adjusts live (`GlobalParams`) is copied into the sequencer
// at construction and clamped on every write; see engine.rs.

use crate::error::Result;
use crate::evolution::EvolutionMode;
use crate::generate::PatternProbabilities;
use crate::scale::{NOTE_CEIL, NOTE_FLOOR};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Defaults applied by `Sequencer::add_loop`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDefaults {
    /// Steps per loop cycle for new loops.
    pub length: usize,
    /// Root of loop 0. Each further loop is raised by `base_note_spread`
    /// semitones, wrapping within two octaves, so loops start in distinct
    /// registers.
    pub base_note: u8,
    pub base_note_spread: u8,
    /// Half-width of the note window around each loop's base note.
    pub range_half_width: u8,
    pub density: f32,
    pub volume: f32,
    pub pattern_probabilities: PatternProbabilities,
}

impl Default for LoopDefaults {
    fn default() -> Self {
        LoopDefaults {
            length: 16,
            base_note: 48,
            base_note_spread: 7,
            range_half_width: 12,
            density: 0.5,
            volume: 0.8,
            pattern_probabilities: PatternProbabilities::default(),
        }
    }
}

/// Evolution orchestrator tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionParams {
    pub mode: EvolutionMode,
    /// Measures between evolution ticks.
    pub interval_measures: u64,
    /// Fraction of active loops mutated per tick (0..=1).
    pub intensity: f32,
    /// Chance per tick of a global scale change in classic/momentum mode.
    pub scale_change_chance: f64,
    /// How many recent scales are excluded from the next pick.
    pub scale_history: usize,
    /// Milliseconds for momentum intensity to ramp from `intensity` to
    /// `momentum_max_intensity`.
    pub momentum_ramp_ms: u64,
    pub momentum_max_intensity: f32,
    /// Relative weights of the per-loop mutation kinds.
    pub regenerate_weight: f32,
    pub density_weight: f32,
    pub transpose_weight: f32,
    /// Largest transposition, in scale degrees, either direction.
    pub transpose_span: i32,
    /// Fraction of the distance to the energy target a density nudge covers.
    pub density_nudge: f32,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        EvolutionParams {
            mode: EvolutionMode::Classic,
            interval_measures: 2,
            intensity: 0.4,
            scale_change_chance: 0.25,
            scale_history: 3,
            momentum_ramp_ms: 120_000,
            momentum_max_intensity: 0.9,
            regenerate_weight: 0.5,
            density_weight: 0.3,
            transpose_weight: 0.2,
            transpose_span: 2,
            density_nudge: 0.5,
        }
    }
}

/// Energy manager tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyParams {
    /// Ceiling on the summed energy of all active loops.
    pub max_sonic_energy: f32,
    /// Multiplier applied per balancing pass.
    pub reduction_factor: f32,
    /// Loop length at which the length-normalization term equals 1.
    pub reference_length: usize,
    /// Window the global density bias maps onto.
    pub min_dynamic_density: f32,
    pub max_dynamic_density: f32,
    /// Balancing never pushes a loop's volume below this.
    pub min_balanced_volume: f32,
    /// Balancing gives up after this many passes.
    pub max_balance_passes: usize,
    /// Lifetime of a cached energy snapshot.
    pub cache_ttl_ms: u64,
}

impl Default for EnergyParams {
    fn default() -> Self {
        EnergyParams {
            max_sonic_energy: 3.0,
            reduction_factor: 0.8,
            reference_length: 16,
            min_dynamic_density: 0.15,
            max_dynamic_density: 0.85,
            min_balanced_volume: 0.05,
            max_balance_passes: 16,
            cache_ttl_ms: 250,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transport steps in one measure. Evolution fires only on multiples.
    pub steps_per_measure: u64,
    /// Scale every loop starts in.
    pub default_scale: String,
    /// Cross-loop collision avoidance after regeneration.
    pub counterpoint_enabled: bool,
    /// Upper bound for the traversal generator's random tail length.
    pub max_tail: usize,
    /// Initial global density bias (0..=1).
    pub global_density_bias: f32,
    pub loops: LoopDefaults,
    pub evolution: EvolutionParams,
    pub energy: EnergyParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            steps_per_measure: 16,
            default_scale: "minor".to_string(),
            counterpoint_enabled: true,
            max_tail: 5,
            global_density_bias: 0.5,
            loops: LoopDefaults::default(),
            evolution: EvolutionParams::default(),
            energy: EnergyParams::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Read and parse a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Clamp values that would break engine arithmetic (zero-length
    /// measures, inverted density windows, out-of-domain notes).
    pub fn sanitized(mut self) -> Self {
        self.steps_per_measure = self.steps_per_measure.max(1);
        self.max_tail = self.max_tail.min(32);
        self.global_density_bias = clamp_unit(self.global_density_bias);

        let l = &mut self.loops;
        l.length = l.length.max(1);
        l.base_note = l.base_note.clamp(NOTE_FLOOR, NOTE_CEIL);
        l.density = clamp_unit(l.density);
        l.volume = clamp_unit(l.volume);

        let ev = &mut self.evolution;
        ev.interval_measures = ev.interval_measures.max(1);
        ev.intensity = clamp_unit(ev.intensity);
        ev.momentum_max_intensity = clamp_unit(ev.momentum_max_intensity);
        ev.scale_change_chance = ev.scale_change_chance.clamp(0.0, 1.0);
        ev.transpose_span = ev.transpose_span.max(1);
        ev.density_nudge = clamp_unit(ev.density_nudge);

        let en = &mut self.energy;
        en.reference_length = en.reference_length.max(1);
        en.reduction_factor = en.reduction_factor.clamp(0.01, 0.99);
        en.min_dynamic_density = clamp_unit(en.min_dynamic_density);
        en.max_dynamic_density = clamp_unit(en.max_dynamic_density).max(en.min_dynamic_density);
        en.min_balanced_volume = clamp_unit(en.min_balanced_volume);
        en.max_sonic_energy = en.max_sonic_energy.max(0.0);
        self
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
pub fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let restored = EngineConfig::from_json(&json).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "steps_per_measure": 12,
            "evolution": { "interval_measures": 4, "mode": "TensionRelease" },
            "energy": { "max_sonic_energy": 1.5 }
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.steps_per_measure, 12);
        assert_eq!(config.evolution.interval_measures, 4);
        assert_eq!(config.evolution.mode, EvolutionMode::TensionRelease);
        assert_eq!(config.evolution.scale_history, 3);
        assert_eq!(config.energy.max_sonic_energy, 1.5);
        assert_eq!(config.energy.reference_length, 16);
        assert_eq!(config.default_scale, "minor");
    }

    #[test]
    fn sanitize_repairs_degenerate_values() {
        let json = r#"{
            "steps_per_measure": 0,
            "loops": { "length": 0, "density": 3.0, "base_note": 5 },
            "energy": { "min_dynamic_density": 0.8, "max_dynamic_density": 0.2 }
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.steps_per_measure, 1);
        assert_eq!(config.loops.length, 1);
        assert_eq!(config.loops.density, 1.0);
        assert_eq!(config.loops.base_note, NOTE_FLOOR);
        assert!(config.energy.max_dynamic_density >= config.energy.min_dynamic_density);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(EngineConfig::from_json("{ not json").is_err());
    }
}
