// Sonic energy: a scalar estimate of how busy and loud the active loops are.
//
// Each active loop contributes
//
//     effective_density * volume * (reference_length / length)
//
// so a short loop, repeating more often per unit time, counts for more than a
// long one at the same density and volume. The total is compared against a
// ceiling; `check_and_balance` scales every active loop's volume down by the
// reduction factor, plus the auto density of unlocked auto-mode loops, one
// pass at a time until the total fits. Manual densities are never touched.
//
// Snapshots are memoized. A cached snapshot is served only while the matrix
// revision it was computed from is still current AND it is younger than the
// TTL. Any matrix write bumps the revision, so a density or volume change is
// never served stale; `invalidate` drops the cache outright.

use crate::config::{EnergyParams, clamp_unit};
use crate::error::Result;
use crate::matrix::{DensityMode, LoopId, NotesMatrix};
use log::{debug, info};
use std::collections::BTreeMap;

/// Per-loop energy and the total across active loops.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnergySnapshot {
    pub contributions: BTreeMap<LoopId, f32>,
    pub total: f32,
}

/// What a balancing run changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BalanceReport {
    pub before: f32,
    pub after: f32,
    pub passes: usize,
    /// Loops whose auto density was lowered. Their rows may now hold more
    /// notes than the density allows.
    pub density_reduced: Vec<LoopId>,
}

#[derive(Clone, Debug)]
struct CachedSnapshot {
    revision: u64,
    computed_at_ms: u64,
    snapshot: EnergySnapshot,
}

#[derive(Clone, Debug, Default)]
pub struct EnergyManager {
    cache: Option<CachedSnapshot>,
    hits: u64,
    computations: u64,
}

impl EnergyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh energy computation, bypassing the cache.
    pub fn compute_energy(matrix: &NotesMatrix, params: &EnergyParams) -> EnergySnapshot {
        let mut snapshot = EnergySnapshot::default();
        for id in matrix.active_loops() {
            let Ok(meta) = matrix.metadata(id) else { continue };
            let norm = params.reference_length as f32 / meta.length.max(1) as f32;
            let energy = meta.effective_density() * meta.audio.volume * norm;
            snapshot.contributions.insert(id, energy);
            snapshot.total += energy;
        }
        snapshot
    }

    /// Energy snapshot, served from cache when still valid.
    pub fn snapshot(&mut self, matrix: &NotesMatrix, params: &EnergyParams, now_ms: u64) -> EnergySnapshot {
        if let Some(cached) = &self.cache {
            let fresh = now_ms.saturating_sub(cached.computed_at_ms) < params.cache_ttl_ms;
            if cached.revision == matrix.revision() && fresh {
                self.hits += 1;
                return cached.snapshot.clone();
            }
        }
        let snapshot = Self::compute_energy(matrix, params);
        self.computations += 1;
        self.cache = Some(CachedSnapshot {
            revision: matrix.revision(),
            computed_at_ms: now_ms,
            snapshot: snapshot.clone(),
        });
        snapshot
    }

    /// Drop the cached snapshot.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits
    }

    pub fn computations(&self) -> u64 {
        self.computations
    }

    /// Map a global bias in [0, 1] linearly onto the dynamic density window.
    pub fn adaptive_density_target(params: &EnergyParams, global_bias: f32) -> f32 {
        let bias = clamp_unit(global_bias);
        params.min_dynamic_density + bias * (params.max_dynamic_density - params.min_dynamic_density)
    }

    /// Write the adaptive target into every unlocked auto-mode loop.
    /// Returns the loops whose density actually changed.
    pub fn apply_adaptive_density(
        &mut self,
        matrix: &mut NotesMatrix,
        params: &EnergyParams,
        global_bias: f32,
    ) -> Result<Vec<LoopId>> {
        let target = Self::adaptive_density_target(params, global_bias);
        let mut changed = Vec::new();
        for id in matrix.initialized_loops() {
            let meta = matrix.metadata(id)?;
            if meta.density_mode != DensityMode::Auto || meta.is_locked() {
                continue;
            }
            if (meta.auto_density - target).abs() > f32::EPSILON {
                matrix.set_auto_density(id, target)?;
                changed.push(id);
            }
        }
        if !changed.is_empty() {
            self.invalidate();
            debug!("adaptive density {target:.2} applied to {} loops", changed.len());
        }
        Ok(changed)
    }

    /// Scale active loops down until total energy fits under the ceiling.
    ///
    /// Each pass multiplies every active loop's volume by the reduction
    /// factor (floored at `min_balanced_volume`) and, for unlocked auto-mode
    /// loops, the auto density too (floored at `min_dynamic_density`). Stops
    /// when the total fits, when a pass changes nothing, or after
    /// `max_balance_passes`.
    pub fn check_and_balance(
        &mut self,
        matrix: &mut NotesMatrix,
        params: &EnergyParams,
        now_ms: u64,
    ) -> Result<BalanceReport> {
        let before = self.snapshot(matrix, params, now_ms).total;
        let mut report = BalanceReport {
            before,
            after: before,
            ..Default::default()
        };
        if before <= params.max_sonic_energy {
            return Ok(report);
        }

        let factor = params.reduction_factor;
        while report.after > params.max_sonic_energy && report.passes < params.max_balance_passes {
            let mut changed = false;
            for id in matrix.active_loops() {
                let meta = matrix.metadata(id)?;
                let volume = meta.audio.volume;
                let scale_density = meta.density_mode == DensityMode::Auto && !meta.is_locked();
                let density = meta.auto_density;

                let new_volume = (volume * factor).max(params.min_balanced_volume).min(volume);
                if new_volume < volume {
                    matrix.set_volume(id, new_volume)?;
                    changed = true;
                }
                if scale_density {
                    let new_density = (density * factor).max(params.min_dynamic_density).min(density);
                    if new_density < density {
                        matrix.set_auto_density(id, new_density)?;
                        if !report.density_reduced.contains(&id) {
                            report.density_reduced.push(id);
                        }
                        changed = true;
                    }
                }
            }
            if !changed {
                debug!("energy balancing: every loop is at its floor");
                break;
            }
            report.passes += 1;
            report.after = Self::compute_energy(matrix, params).total;
        }

        self.invalidate();
        info!(
            "energy balanced {:.2} -> {:.2} (ceiling {:.2}) in {} passes",
            report.before, report.after, params.max_sonic_energy, report.passes
        );
        Ok(report)
    }
}
