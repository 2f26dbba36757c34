// Requests from the UI/config layer.
//
// Everything outside the engine that wants to change sequencer state sends
// an `EngineCommand` to `Sequencer::apply_command` (see engine.rs). The
// enum is serde-derived so a front-end can ship commands as JSON. Each
// variant maps to exactly one `Sequencer` method; numeric payloads are
// clamped there, not here.
//
// Evolution writes the matrix through mutation intents (intent.rs), never
// through commands.

use crate::evolution::EvolutionMode;
use crate::generate::PatternKind;
use crate::matrix::{DensityMode, LoopId, MetadataPatch};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineCommand {
    SetLoopActive {
        loop_id: LoopId,
        active: bool,
    },
    UpdateLoopMetadata {
        loop_id: LoopId,
        patch: MetadataPatch,
    },
    /// Works on locked loops too: a direct user request.
    RegenerateLoop {
        loop_id: LoopId,
        pattern: Option<PatternKind>,
    },
    RegenerateAll,
    UpdateScale {
        scale: String,
    },
    SetLoopDensityMode {
        loop_id: LoopId,
        mode: DensityMode,
    },
    SetManualDensity {
        loop_id: LoopId,
        density: f32,
    },
    SetEvolveInterval {
        measures: u64,
    },
    SetEvolveIntensity {
        intensity: f32,
    },
    SetMaxSonicEnergy {
        energy: f32,
    },
    SetEnergyReductionFactor {
        factor: f32,
    },
    SetGlobalDensityBias {
        bias: f32,
    },
    SetEvolutionEnabled {
        enabled: bool,
    },
    SetEvolutionMode {
        mode: EvolutionMode,
    },
    SetScaleLocked {
        locked: bool,
    },
}

impl EngineCommand {
    /// The loop this command targets, if any.
    pub fn loop_id(&self) -> Option<LoopId> {
        match self {
            EngineCommand::SetLoopActive { loop_id, .. }
            | EngineCommand::UpdateLoopMetadata { loop_id, .. }
            | EngineCommand::RegenerateLoop { loop_id, .. }
            | EngineCommand::SetLoopDensityMode { loop_id, .. }
            | EngineCommand::SetManualDensity { loop_id, .. } => Some(*loop_id),
            _ => None,
        }
    }
}
