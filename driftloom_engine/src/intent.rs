// Mutation intents and plan coalescing.
//
// An evolution tick never writes the matrix directly. It produces a raw
// `MutationPlan`: an optional global scale change plus a list of per-loop
// `MutationIntent`s. `coalesce` reduces that plan before anything is applied:
//
// 1. A scale change to the current scale is dropped before anything else
//    looks at it.
// 2. Intents for loops with no metadata are skipped (logged); intents for
//    locked loops are vetoed.
// 3. With a global scale change pending, per-loop quantize intents are
//    dropped; the global re-quantization supersedes them.
// 4. Same-loop intents merge: metadata patches field by field (last writer
//    wins), density targets and quantize targets last-writer-wins,
//    transpositions sum, repeated regenerates collapse to one.
// 5. Regenerates covering more than half the active loops collapse into a
//    single `RegenerateAll`.
//
// The coalesced plan is then validated (every scale name it mentions must
// resolve) so application can be all-or-nothing.

use crate::error::Result;
use crate::generate::PatternKind;
use crate::matrix::{LoopId, MetadataPatch, NotesMatrix};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One proposed change. Produced, coalesced, applied, discarded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationIntent {
    /// Regenerate one loop; `pattern` of `None` draws from the loop's
    /// pattern probabilities.
    Regenerate {
        loop_id: LoopId,
        pattern: Option<PatternKind>,
    },
    MetadataUpdate {
        loop_id: LoopId,
        patch: MetadataPatch,
    },
    /// Move an auto-mode loop's density to `target` and regenerate it.
    DensityAdjust { loop_id: LoopId, target: f32 },
    Quantize { loop_id: LoopId, scale: String },
    Transpose { loop_id: LoopId, degrees: i32 },
    /// Regenerate every active, unlocked loop.
    RegenerateAll,
}

impl MutationIntent {
    pub fn loop_id(&self) -> Option<LoopId> {
        match self {
            MutationIntent::Regenerate { loop_id, .. }
            | MutationIntent::MetadataUpdate { loop_id, .. }
            | MutationIntent::DensityAdjust { loop_id, .. }
            | MutationIntent::Quantize { loop_id, .. }
            | MutationIntent::Transpose { loop_id, .. } => Some(*loop_id),
            MutationIntent::RegenerateAll => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MutationIntent::Regenerate { .. } => "regenerate",
            MutationIntent::MetadataUpdate { .. } => "metadata",
            MutationIntent::DensityAdjust { .. } => "density",
            MutationIntent::Quantize { .. } => "quantize",
            MutationIntent::Transpose { .. } => "transpose",
            MutationIntent::RegenerateAll => "regenerate-all",
        }
    }
}

/// A tick's worth of intents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationPlan {
    pub scale_change: Option<String>,
    pub intents: Vec<MutationIntent>,
}

impl MutationPlan {
    pub fn is_empty(&self) -> bool {
        self.scale_change.is_none() && self.intents.is_empty()
    }

    /// Loops named by any intent, ascending.
    pub fn targeted_loops(&self) -> Vec<LoopId> {
        let mut ids: Vec<LoopId> = self.intents.iter().filter_map(MutationIntent::loop_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Per-loop accumulator used while coalescing.
#[derive(Default)]
struct LoopIntents {
    patch: Option<MetadataPatch>,
    density: Option<f32>,
    quantize: Option<String>,
    regenerate: Option<Option<PatternKind>>,
    transpose: i32,
}

/// Reduce a raw plan to the set of changes that will actually be applied.
pub fn coalesce(raw: MutationPlan, current_scale: &str, matrix: &NotesMatrix) -> MutationPlan {
    let scale_change = raw.scale_change.filter(|s| s != current_scale);

    let mut per_loop: BTreeMap<LoopId, LoopIntents> = BTreeMap::new();
    let mut regenerate_all = false;

    for intent in raw.intents {
        let Some(id) = intent.loop_id() else {
            regenerate_all = true;
            continue;
        };
        let meta = match matrix.metadata(id) {
            Ok(meta) if matrix.is_initialized(id) => meta,
            _ => {
                warn!("skipping {} intent for {id}: no loop metadata", intent.label());
                continue;
            }
        };
        if meta.is_locked() {
            debug!("vetoing {} intent for locked {id}", intent.label());
            continue;
        }

        let entry = per_loop.entry(id).or_default();
        match intent {
            MutationIntent::MetadataUpdate { patch, .. } => {
                entry.patch.get_or_insert_with(MetadataPatch::default).merge(patch);
            }
            MutationIntent::DensityAdjust { target, .. } => entry.density = Some(target),
            MutationIntent::Quantize { scale, .. } => {
                if scale_change.is_some() {
                    debug!("dropping quantize for {id}: superseded by global scale change");
                } else {
                    entry.quantize = Some(scale);
                }
            }
            MutationIntent::Regenerate { pattern, .. } => entry.regenerate = Some(pattern),
            MutationIntent::Transpose { degrees, .. } => entry.transpose += degrees,
            MutationIntent::RegenerateAll => {}
        }
    }

    let active = matrix.active_loops();
    let regenerating = per_loop
        .iter()
        .filter(|(id, e)| e.regenerate.is_some() && active.contains(id))
        .count();
    if !active.is_empty() && regenerating * 2 > active.len() {
        debug!("collapsing {regenerating} of {} regenerates into regenerate-all", active.len());
        regenerate_all = true;
    }

    // Ordered so that every metadata and density change lands before any
    // regeneration reads it.
    let mut intents = Vec::new();
    for (&loop_id, entry) in &mut per_loop {
        if let Some(patch) = entry.patch.take().filter(|p| !p.is_empty()) {
            intents.push(MutationIntent::MetadataUpdate { loop_id, patch });
        }
    }
    for (&loop_id, entry) in &per_loop {
        if let Some(target) = entry.density {
            intents.push(MutationIntent::DensityAdjust { loop_id, target });
        }
    }
    for (&loop_id, entry) in &mut per_loop {
        if let Some(scale) = entry.quantize.take() {
            intents.push(MutationIntent::Quantize { loop_id, scale });
        }
    }
    if regenerate_all {
        intents.push(MutationIntent::RegenerateAll);
    } else {
        for (&loop_id, entry) in &per_loop {
            if let Some(pattern) = entry.regenerate {
                intents.push(MutationIntent::Regenerate { loop_id, pattern });
            }
        }
    }
    for (&loop_id, entry) in &per_loop {
        if entry.transpose != 0 {
            intents.push(MutationIntent::Transpose {
                loop_id,
                degrees: entry.transpose,
            });
        }
    }

    MutationPlan { scale_change, intents }
}

/// Check that every scale name in `plan` resolves.
pub fn validate(plan: &MutationPlan, matrix: &NotesMatrix) -> Result<()> {
    let scales = matrix.scales();
    if let Some(scale) = &plan.scale_change {
        scales.get(scale)?;
    }
    for intent in &plan.intents {
        match intent {
            MutationIntent::Quantize { scale, .. } => {
                scales.get(scale)?;
            }
            MutationIntent::MetadataUpdate { patch, .. } => {
                if let Some(scale) = &patch.scale {
                    scales.get(scale)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::matrix::{GenerationMode, LoopMetadata};
    use crate::scale::ScaleBook;

    fn matrix(active: usize) -> NotesMatrix {
        let mut m = NotesMatrix::new(ScaleBook::builtin(), 11);
        for i in 0..active {
            let meta = LoopMetadata {
                is_active: true,
                ..LoopMetadata::default()
            };
            m.initialize_loop(LoopId(i), meta).unwrap();
        }
        m
    }

    fn regen(i: usize) -> MutationIntent {
        MutationIntent::Regenerate {
            loop_id: LoopId(i),
            pattern: None,
        }
    }

    #[test]
    fn test_same_scale_change_is_dropped() {
        let m = matrix(2);
        let raw = MutationPlan {
            scale_change: Some("minor".into()),
            intents: vec![],
        };
        let plan = coalesce(raw, "minor", &m);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_locked_loops_are_vetoed() {
        let mut m = matrix(4);
        let patch = MetadataPatch {
            generation_mode: Some(GenerationMode::Locked),
            ..Default::default()
        };
        m.update_metadata(LoopId(1), &patch).unwrap();
        let raw = MutationPlan {
            scale_change: None,
            intents: vec![
                regen(1),
                MutationIntent::Transpose {
                    loop_id: LoopId(1),
                    degrees: 2,
                },
                MutationIntent::DensityAdjust {
                    loop_id: LoopId(0),
                    target: 0.3,
                },
            ],
        };
        let plan = coalesce(raw, "minor", &m);
        assert_eq!(plan.targeted_loops(), vec![LoopId(0)]);
    }

    #[test]
    fn test_missing_loops_are_skipped() {
        let m = matrix(2);
        let raw = MutationPlan {
            scale_change: None,
            intents: vec![regen(5), regen(0)],
        };
        let plan = coalesce(raw, "minor", &m);
        assert_eq!(plan.intents, vec![regen(0)]);
    }

    #[test]
    fn test_majority_regenerate_collapses() {
        let m = matrix(4);
        let raw = MutationPlan {
            scale_change: None,
            intents: vec![regen(0), regen(1), regen(2)],
        };
        let plan = coalesce(raw, "minor", &m);
        assert_eq!(plan.intents, vec![MutationIntent::RegenerateAll]);

        // Exactly half does not collapse.
        let raw = MutationPlan {
            scale_change: None,
            intents: vec![regen(0), regen(1), regen(1)],
        };
        let plan = coalesce(raw, "minor", &m);
        assert_eq!(plan.intents, vec![regen(0), regen(1)]);
    }

    #[test]
    fn test_metadata_updates_merge_per_loop() {
        let m = matrix(2);
        let first = MetadataPatch {
            volume: Some(0.2),
            pan: Some(0.1),
            ..Default::default()
        };
        let second = MetadataPatch {
            volume: Some(0.6),
            ..Default::default()
        };
        let raw = MutationPlan {
            scale_change: None,
            intents: vec![
                MutationIntent::MetadataUpdate {
                    loop_id: LoopId(0),
                    patch: first,
                },
                MutationIntent::MetadataUpdate {
                    loop_id: LoopId(0),
                    patch: second,
                },
            ],
        };
        let plan = coalesce(raw, "minor", &m);
        let expected = MetadataPatch {
            volume: Some(0.6),
            pan: Some(0.1),
            ..Default::default()
        };
        assert_eq!(
            plan.intents,
            vec![MutationIntent::MetadataUpdate {
                loop_id: LoopId(0),
                patch: expected
            }]
        );
    }

    #[test]
    fn test_scale_change_drops_quantize() {
        let m = matrix(2);
        let quantize = MutationIntent::Quantize {
            loop_id: LoopId(1),
            scale: "minor".into(),
        };
        let raw = MutationPlan {
            scale_change: Some("dorian".into()),
            intents: vec![quantize.clone()],
        };
        let plan = coalesce(raw, "minor", &m);
        assert_eq!(plan.scale_change.as_deref(), Some("dorian"));
        assert!(plan.intents.is_empty());

        // Without a scale change the quantize survives.
        let raw = MutationPlan {
            scale_change: Some("minor".into()),
            intents: vec![quantize.clone()],
        };
        let plan = coalesce(raw, "minor", &m);
        assert_eq!(plan.intents, vec![quantize]);
    }

    #[test]
    fn test_order_puts_changes_before_regeneration() {
        let m = matrix(4);
        let raw = MutationPlan {
            scale_change: None,
            intents: vec![
                MutationIntent::Transpose {
                    loop_id: LoopId(2),
                    degrees: 1,
                },
                regen(0),
                MutationIntent::DensityAdjust {
                    loop_id: LoopId(1),
                    target: 0.4,
                },
                MutationIntent::Transpose {
                    loop_id: LoopId(2),
                    degrees: 2,
                },
            ],
        };
        let plan = coalesce(raw, "minor", &m);
        let labels: Vec<&str> = plan.intents.iter().map(MutationIntent::label).collect();
        assert_eq!(labels, vec!["density", "regenerate", "transpose"]);
        assert!(plan.intents.contains(&MutationIntent::Transpose {
            loop_id: LoopId(2),
            degrees: 3
        }));
    }

    #[test]
    fn test_validate_rejects_unknown_scales() {
        let m = matrix(1);
        let plan = MutationPlan {
            scale_change: Some("nonexistent".into()),
            intents: vec![],
        };
        assert!(matches!(validate(&plan, &m), Err(EngineError::UnknownScale { .. })));
        let plan = MutationPlan {
            scale_change: None,
            intents: vec![MutationIntent::MetadataUpdate {
                loop_id: LoopId(0),
                patch: MetadataPatch::scale("bogus"),
            }],
        };
        assert!(validate(&plan, &m).is_err());
        let plan = MutationPlan {
            scale_change: Some("dorian".into()),
            intents: vec![regen(0)],
        };
        assert!(validate(&plan, &m).is_ok());
    }

    #[test]
    fn test_intent_json_shape() {
        let intent = MutationIntent::Transpose {
            loop_id: LoopId(3),
            degrees: -2,
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert_eq!(json, r#"{"Transpose":{"loop_id":3,"degrees":-2}}"#);
    }
}
