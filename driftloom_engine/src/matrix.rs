// The notes matrix: the authoritative per-loop state store.
//
// A fixed `MAX_LOOPS x MAX_STEPS` grid of `Option<u8>` cells (MIDI note or
// rest) plus one `LoopMetadata` per row. Only the first `length` cells of a
// row are meaningful; every read path slices to that length and trailing
// cells are kept as rests.
//
// All writes go through methods on `NotesMatrix`. Each write:
// - clamps its inputs to the documented ranges,
// - enforces the silence invariant (a loop's active range always holds at
//   least one note; a write that would silence it gets one fallback note,
//   a random in-scale pitch at step 0),
// - bumps the revision counter, stamps `last_modified`, and
// - notifies observers, unless a batch is open. Closing the outermost batch
//   sends exactly one notice covering every loop touched inside it.
//
// Batching only defers notification. The final state is identical with or
// without it.
//
// The matrix owns the scale book (fallback and resize notes need to resolve
// a loop's scale) and a private `SeqRng` for those two random choices.
//
// See also: generate.rs (row producers), energy.rs (writes `auto_density`
// and balanced volumes), engine.rs (the only owner).

use crate::config::clamp_unit;
use crate::error::{EngineError, Result};
use crate::generate::{NoteRow, PatternProbabilities, rest_row};
use crate::placement::pulse_count;
use crate::scale::{ScaleBook, clamp_note, clamp_range, possible_notes, snap_to, transpose_degrees};
use driftloom_prng::SeqRng;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Number of loop slots.
pub const MAX_LOOPS: usize = 8;
/// Longest loop, in steps.
pub const MAX_STEPS: usize = 64;

const DEFAULT_SCALE: &str = "minor";

/// Index of a loop slot, `0..MAX_LOOPS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(pub usize);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop {}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DensityMode {
    /// Density is driven by the energy manager.
    #[default]
    Auto,
    /// Density is the user's `manual_density`; never touched automatically.
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenerationMode {
    #[default]
    Auto,
    /// Evolution and density-driven regeneration never touch this loop.
    /// Direct user regeneration still works.
    Locked,
}

/// Per-loop mix settings, passed through to the audio layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    pub volume: f32,
    /// -1 (left) to 1 (right).
    pub pan: f32,
    pub delay_send: f32,
    pub reverb_send: f32,
}

impl Default for AudioParams {
    fn default() -> Self {
        AudioParams {
            volume: 0.8,
            pan: 0.0,
            delay_send: 0.0,
            reverb_send: 0.2,
        }
    }
}

impl AudioParams {
    fn sanitize(&mut self) {
        self.volume = clamp_unit(self.volume);
        self.pan = if self.pan.is_nan() { 0.0 } else { self.pan.clamp(-1.0, 1.0) };
        self.delay_send = clamp_unit(self.delay_send);
        self.reverb_send = clamp_unit(self.reverb_send);
    }
}

/// Everything the engine knows about a loop besides its notes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopMetadata {
    pub is_active: bool,
    /// Steps per cycle, `1..=MAX_STEPS`.
    pub length: usize,
    /// Scale name, resolved through the scale book at use.
    pub scale: String,
    pub base_note: u8,
    pub note_range_min: u8,
    pub note_range_max: u8,
    pub density_mode: DensityMode,
    pub manual_density: f32,
    pub auto_density: f32,
    pub pattern_probabilities: PatternProbabilities,
    pub generation_mode: GenerationMode,
    pub audio: AudioParams,
    /// What last wrote this loop ("euclidean", "quantize", ...).
    pub last_pattern: Option<String>,
    /// Engine clock (ms) of the last write.
    pub last_modified: u64,
}

impl Default for LoopMetadata {
    fn default() -> Self {
        LoopMetadata {
            is_active: false,
            length: 16,
            scale: DEFAULT_SCALE.to_string(),
            base_note: 48,
            note_range_min: 36,
            note_range_max: 60,
            density_mode: DensityMode::Auto,
            manual_density: 0.5,
            auto_density: 0.5,
            pattern_probabilities: PatternProbabilities::default(),
            generation_mode: GenerationMode::Auto,
            audio: AudioParams::default(),
            last_pattern: None,
            last_modified: 0,
        }
    }
}

impl LoopMetadata {
    /// `manual_density` in manual mode, `auto_density` otherwise. Always
    /// derived from the stored fields, never cached.
    pub fn effective_density(&self) -> f32 {
        match self.density_mode {
            DensityMode::Manual => self.manual_density,
            DensityMode::Auto => self.auto_density,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.generation_mode == GenerationMode::Locked
    }

    /// Clamp every numeric field into its documented range.
    pub fn sanitize(&mut self) {
        self.length = self.length.clamp(1, MAX_STEPS);
        self.base_note = clamp_note(self.base_note as i32);
        let (lo, hi) = clamp_range(self.note_range_min as i32, self.note_range_max as i32);
        self.note_range_min = lo;
        self.note_range_max = hi;
        self.manual_density = clamp_unit(self.manual_density);
        self.auto_density = clamp_unit(self.auto_density);
        self.pattern_probabilities = self.pattern_probabilities.sanitized();
        self.audio.sanitize();
    }
}

/// A partial metadata update. `None` leaves a field alone.
///
/// There is no `auto_density` field: that value belongs to the energy
/// manager and evolution density nudges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataPatch {
    pub is_active: Option<bool>,
    pub length: Option<usize>,
    pub scale: Option<String>,
    pub base_note: Option<u8>,
    pub note_range_min: Option<u8>,
    pub note_range_max: Option<u8>,
    pub density_mode: Option<DensityMode>,
    pub manual_density: Option<f32>,
    pub pattern_probabilities: Option<PatternProbabilities>,
    pub generation_mode: Option<GenerationMode>,
    pub volume: Option<f32>,
    pub pan: Option<f32>,
    pub delay_send: Option<f32>,
    pub reverb_send: Option<f32>,
}

impl MetadataPatch {
    pub fn scale(name: &str) -> Self {
        MetadataPatch {
            scale: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// Fold a later patch into this one; fields the later patch sets win.
    pub fn merge(&mut self, later: MetadataPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if later.$field.is_some() { self.$field = later.$field; })*
            };
        }
        take!(
            is_active,
            length,
            scale,
            base_note,
            note_range_min,
            note_range_max,
            density_mode,
            manual_density,
            pattern_probabilities,
            generation_mode,
            volume,
            pan,
            delay_send,
            reverb_send
        );
    }

    pub fn is_empty(&self) -> bool {
        *self == MetadataPatch::default()
    }
}

/// Sent to observers after a write (or once per batch).
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeNotice {
    pub revision: u64,
    pub loops: BTreeSet<LoopId>,
}

pub type Observer = Box<dyn FnMut(&ChangeNotice)>;

#[derive(Clone, Debug)]
struct LoopSlot {
    meta: LoopMetadata,
    /// Always `MAX_STEPS` long; cells at or past `meta.length` are rests.
    notes: NoteRow,
    initialized: bool,
    /// Count of notes in the active range.
    filled: usize,
}

impl LoopSlot {
    fn blank(scale: &str) -> Self {
        LoopSlot {
            meta: LoopMetadata {
                scale: scale.to_string(),
                ..LoopMetadata::default()
            },
            notes: rest_row(MAX_STEPS),
            initialized: false,
            filled: 0,
        }
    }

    fn active_row(&self) -> &[Option<u8>] {
        &self.notes[..self.meta.length]
    }

    fn recount(&mut self) {
        let len = self.meta.length;
        for cell in &mut self.notes[len..] {
            *cell = None;
        }
        self.filled = self.notes[..len].iter().filter(|n| n.is_some()).count();
    }
}

pub struct NotesMatrix {
    slots: Vec<LoopSlot>,
    scales: ScaleBook,
    /// Scale given to slots that were never initialized.
    default_scale: String,
    rng: SeqRng,
    revision: u64,
    clock_ms: u64,
    batch_depth: usize,
    pending: BTreeSet<LoopId>,
    observers: Vec<Observer>,
    notifications: u64,
}

impl fmt::Debug for NotesMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotesMatrix")
            .field("revision", &self.revision)
            .field("batch_depth", &self.batch_depth)
            .field("observers", &self.observers.len())
            .field("loops", &self.initialized_loops())
            .finish()
    }
}

impl NotesMatrix {
    /// Blank slots start in "minor" when the book has it, else in the
    /// book's first scale. `set_default_scale` overrides that.
    pub fn new(scales: ScaleBook, seed: u64) -> Self {
        let default_scale = if scales.contains(DEFAULT_SCALE) {
            DEFAULT_SCALE.to_string()
        } else {
            scales.names().next().unwrap_or(DEFAULT_SCALE).to_string()
        };
        NotesMatrix {
            slots: (0..MAX_LOOPS).map(|_| LoopSlot::blank(&default_scale)).collect(),
            scales,
            default_scale,
            rng: SeqRng::new(seed),
            revision: 0,
            clock_ms: 0,
            batch_depth: 0,
            pending: BTreeSet::new(),
            observers: Vec::new(),
            notifications: 0,
        }
    }

    pub fn scales(&self) -> &ScaleBook {
        &self.scales
    }

    pub fn default_scale(&self) -> &str {
        &self.default_scale
    }

    /// Set the scale for blank slots, including the ones already blank.
    pub fn set_default_scale(&mut self, scale: &str) -> Result<()> {
        self.scales.get(scale)?;
        self.default_scale = scale.to_string();
        for slot in self.slots.iter_mut().filter(|s| !s.initialized) {
            slot.meta.scale = scale.to_string();
        }
        Ok(())
    }

    /// Monotonic write counter. Bumped by every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Observer notifications sent so far.
    pub fn notification_count(&self) -> u64 {
        self.notifications
    }

    /// Set the clock used for `last_modified` stamps.
    pub fn set_clock(&mut self, now_ms: u64) {
        self.clock_ms = now_ms;
    }

    pub fn subscribe(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Validate a loop id against the slot count.
    pub fn check(&self, id: LoopId) -> Result<usize> {
        if id.0 < MAX_LOOPS {
            Ok(id.0)
        } else {
            Err(EngineError::LoopOutOfRange {
                loop_id: id.0,
                max: MAX_LOOPS,
            })
        }
    }

    /// `check`, plus the loop's scale must resolve. Writes that can inject a
    /// fallback note call this before touching the slot.
    fn check_writable(&self, id: LoopId) -> Result<usize> {
        let i = self.check(id)?;
        self.scales.get(&self.slots[i].meta.scale)?;
        Ok(i)
    }

    pub fn is_initialized(&self, id: LoopId) -> bool {
        id.0 < MAX_LOOPS && self.slots[id.0].initialized
    }

    pub fn metadata(&self, id: LoopId) -> Result<&LoopMetadata> {
        let i = self.check(id)?;
        Ok(&self.slots[i].meta)
    }

    /// The loop's row, sliced to its length.
    pub fn loop_notes(&self, id: LoopId) -> Result<&[Option<u8>]> {
        let i = self.check(id)?;
        Ok(self.slots[i].active_row())
    }

    pub fn effective_density(&self, id: LoopId) -> Result<f32> {
        Ok(self.metadata(id)?.effective_density())
    }

    /// Fraction of the active range holding notes.
    pub fn observed_density(&self, id: LoopId) -> Result<f32> {
        let i = self.check(id)?;
        let slot = &self.slots[i];
        Ok(slot.filled as f32 / slot.meta.length as f32)
    }

    pub fn initialized_loops(&self) -> Vec<LoopId> {
        (0..MAX_LOOPS)
            .filter(|&i| self.slots[i].initialized)
            .map(LoopId)
            .collect()
    }

    pub fn active_loops(&self) -> Vec<LoopId> {
        (0..MAX_LOOPS)
            .filter(|&i| self.slots[i].initialized && self.slots[i].meta.is_active)
            .map(LoopId)
            .collect()
    }

    /// Rows of every active loop other than `exclude`.
    pub fn active_rows_except(&self, exclude: LoopId) -> Vec<&[Option<u8>]> {
        self.active_loops()
            .into_iter()
            .filter(|&id| id != exclude)
            .map(|id| self.slots[id.0].active_row())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------

    /// Suppress per-write notifications until the matching `end_batch`.
    /// Nested batches only notify when the outermost one closes.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    pub fn end_batch(&mut self) {
        if self.batch_depth == 0 {
            debug!("end_batch without begin_batch");
            return;
        }
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            self.notify();
        }
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    /// Run `f` inside a batch.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.begin_batch();
        let out = f(self);
        self.end_batch();
        out
    }

    fn notify(&mut self) {
        let notice = ChangeNotice {
            revision: self.revision,
            loops: std::mem::take(&mut self.pending),
        };
        for observer in self.observers.iter_mut() {
            observer(&notice);
        }
        self.notifications += 1;
    }

    /// Record a write to slot `i`.
    fn touch(&mut self, i: usize, label: Option<&str>) {
        self.revision += 1;
        let slot = &mut self.slots[i];
        slot.meta.last_modified = self.clock_ms;
        if let Some(label) = label {
            slot.meta.last_pattern = Some(label.to_string());
        }
        self.pending.insert(LoopId(i));
        if self.batch_depth == 0 {
            self.notify();
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Set a loop's metadata. A loop that was already initialized keeps its
    /// notes (resized to the new length); a fresh loop starts as rests.
    pub fn initialize_loop(&mut self, id: LoopId, config: LoopMetadata) -> Result<()> {
        let i = self.check(id)?;
        let mut meta = config;
        meta.sanitize();
        self.scales.get(&meta.scale)?;

        let slot = &mut self.slots[i];
        if slot.initialized {
            let new_len = meta.length;
            meta.length = slot.meta.length;
            slot.meta = meta;
            self.resize_slot(i, new_len)?;
        } else {
            slot.meta = meta;
            slot.notes = rest_row(MAX_STEPS);
            slot.initialized = true;
            slot.recount();
            if slot.meta.is_active {
                self.ensure_audible(i)?;
            }
        }
        self.touch(i, None);
        Ok(())
    }

    /// Replace a loop's row. The loop's length follows `notes.len()`
    /// (clamped to `1..=MAX_STEPS`); notes are clamped into the domain range.
    pub fn set_loop_notes(&mut self, id: LoopId, notes: &[Option<u8>], label: Option<&str>) -> Result<()> {
        let i = self.check_writable(id)?;
        let len = notes.len().clamp(1, MAX_STEPS);
        let slot = &mut self.slots[i];
        slot.initialized = true;
        slot.meta.length = len;
        slot.notes = rest_row(MAX_STEPS);
        for (cell, note) in slot.notes.iter_mut().zip(notes.iter().take(len)) {
            *cell = note.map(|n| clamp_note(n as i32));
        }
        slot.recount();
        self.ensure_audible(i)?;
        self.touch(i, label);
        Ok(())
    }

    /// Write one cell. Steps outside the loop's length are ignored.
    pub fn set_loop_note(&mut self, id: LoopId, step: usize, note: Option<u8>) -> Result<()> {
        let i = self.check_writable(id)?;
        let slot = &mut self.slots[i];
        if step >= slot.meta.length {
            debug!("{id}: ignoring write to step {step} past length {}", slot.meta.length);
            return Ok(());
        }
        slot.initialized = true;
        slot.notes[step] = note.map(|n| clamp_note(n as i32));
        slot.recount();
        self.ensure_audible(i)?;
        self.touch(i, None);
        Ok(())
    }

    pub fn clear_loop_note(&mut self, id: LoopId, step: usize) -> Result<()> {
        self.set_loop_note(id, step, None)
    }

    /// Change a loop's length. Existing cells are kept; new steps each get
    /// a note with probability equal to the loop's effective density.
    pub fn resize_loop(&mut self, id: LoopId, new_length: usize) -> Result<()> {
        let i = self.check_writable(id)?;
        if self.resize_slot(i, new_length)? {
            self.touch(i, None);
        }
        Ok(())
    }

    fn resize_slot(&mut self, i: usize, new_length: usize) -> Result<bool> {
        let new_length = new_length.clamp(1, MAX_STEPS);
        let old_length = self.slots[i].meta.length;
        if new_length == old_length {
            return Ok(false);
        }
        if new_length > old_length {
            let meta = &self.slots[i].meta;
            let density = meta.effective_density() as f64;
            let pool = possible_notes(
                self.scales.get(&meta.scale)?,
                meta.base_note,
                meta.note_range_min,
                meta.note_range_max,
            );
            for step in old_length..new_length {
                let note = if !pool.is_empty() && self.rng.random_bool(density) {
                    self.rng.choose(&pool).copied()
                } else {
                    None
                };
                self.slots[i].notes[step] = note;
            }
        }
        self.slots[i].meta.length = new_length;
        self.slots[i].recount();
        self.ensure_audible(i)?;
        Ok(true)
    }

    pub fn set_loop_active(&mut self, id: LoopId, active: bool) -> Result<()> {
        let i = self.check_writable(id)?;
        self.slots[i].initialized = true;
        self.slots[i].meta.is_active = active;
        if active {
            self.ensure_audible(i)?;
        }
        self.touch(i, None);
        Ok(())
    }

    /// Apply a partial update. The scale name is validated before anything
    /// is written, so an unknown scale leaves the loop untouched.
    pub fn update_metadata(&mut self, id: LoopId, patch: &MetadataPatch) -> Result<()> {
        let i = self.check(id)?;
        let scale = patch.scale.as_deref().unwrap_or(self.slots[i].meta.scale.as_str());
        self.scales.get(scale)?;

        let meta = &mut self.slots[i].meta;
        if let Some(v) = patch.is_active {
            meta.is_active = v;
        }
        if let Some(v) = &patch.scale {
            meta.scale = v.clone();
        }
        if let Some(v) = patch.base_note {
            meta.base_note = v;
        }
        if let Some(v) = patch.note_range_min {
            meta.note_range_min = v;
        }
        if let Some(v) = patch.note_range_max {
            meta.note_range_max = v;
        }
        if let Some(v) = patch.density_mode {
            meta.density_mode = v;
        }
        if let Some(v) = patch.manual_density {
            meta.manual_density = v;
        }
        if let Some(v) = patch.pattern_probabilities {
            meta.pattern_probabilities = v;
        }
        if let Some(v) = patch.generation_mode {
            meta.generation_mode = v;
        }
        if let Some(v) = patch.volume {
            meta.audio.volume = v;
        }
        if let Some(v) = patch.pan {
            meta.audio.pan = v;
        }
        if let Some(v) = patch.delay_send {
            meta.audio.delay_send = v;
        }
        if let Some(v) = patch.reverb_send {
            meta.audio.reverb_send = v;
        }
        meta.sanitize();
        self.slots[i].initialized = true;

        if let Some(len) = patch.length {
            self.resize_slot(i, len)?;
        }
        if self.slots[i].meta.is_active {
            self.ensure_audible(i)?;
        }
        self.touch(i, None);
        Ok(())
    }

    pub(crate) fn set_auto_density(&mut self, id: LoopId, density: f32) -> Result<()> {
        let i = self.check(id)?;
        self.slots[i].meta.auto_density = clamp_unit(density);
        self.touch(i, None);
        Ok(())
    }

    pub(crate) fn set_volume(&mut self, id: LoopId, volume: f32) -> Result<()> {
        let i = self.check(id)?;
        self.slots[i].meta.audio.volume = clamp_unit(volume);
        self.touch(i, None);
        Ok(())
    }

    /// Row the loop would have after snapping every note into `scale`.
    /// Nothing is written.
    pub fn quantized_row(&self, id: LoopId, scale: &str) -> Result<NoteRow> {
        let i = self.check(id)?;
        let meta = &self.slots[i].meta;
        let pool = possible_notes(
            self.scales.get(scale)?,
            meta.base_note,
            meta.note_range_min,
            meta.note_range_max,
        );
        Ok(self.slots[i]
            .active_row()
            .iter()
            .map(|n| n.map(|n| snap_to(&pool, n)))
            .collect())
    }

    /// Snap the loop's notes into `scale` and adopt it as the loop's scale.
    pub fn quantize_loop(&mut self, id: LoopId, scale: &str) -> Result<()> {
        let row = self.quantized_row(id, scale)?;
        self.commit_row(id, &row, Some(scale), "quantize")
    }

    /// Write a precomputed row, optionally switching the scale name. The
    /// row length must match the loop's length; the scale must resolve.
    pub(crate) fn commit_row(&mut self, id: LoopId, row: &[Option<u8>], scale: Option<&str>, label: &str) -> Result<()> {
        let i = self.check(id)?;
        if let Some(scale) = scale {
            self.scales.get(scale)?;
            self.slots[i].meta.scale = scale.to_string();
        }
        let len = self.slots[i].meta.length;
        for (step, cell) in self.slots[i].notes[..len].iter_mut().enumerate() {
            *cell = row.get(step).copied().flatten();
        }
        self.slots[i].recount();
        self.ensure_audible(i)?;
        self.touch(i, Some(label));
        Ok(())
    }

    /// Move every note `degrees` scale steps, reflecting at the range edges.
    pub fn transpose_loop(&mut self, id: LoopId, degrees: i32) -> Result<()> {
        let i = self.check(id)?;
        let meta = &self.slots[i].meta;
        let pool = possible_notes(
            self.scales.get(&meta.scale)?,
            meta.base_note,
            meta.note_range_min,
            meta.note_range_max,
        );
        if pool.is_empty() {
            debug!("{id}: nothing in range to transpose onto");
            return Ok(());
        }
        let row: NoteRow = self.slots[i]
            .active_row()
            .iter()
            .map(|n| n.map(|n| transpose_degrees(&pool, n, degrees)))
            .collect();
        self.commit_row(id, &row, None, "transpose")
    }

    /// Drop random notes until the count fits the effective density.
    /// Returns how many notes were removed.
    pub fn thin_to_density(&mut self, id: LoopId) -> Result<usize> {
        let i = self.check(id)?;
        let slot = &self.slots[i];
        let target = pulse_count(slot.meta.length, slot.meta.effective_density(), false);
        let mut filled: Vec<usize> = (0..slot.meta.length)
            .filter(|&s| slot.notes[s].is_some())
            .collect();
        if filled.len() <= target {
            return Ok(0);
        }
        self.rng.shuffle(&mut filled);
        let surplus = filled.len() - target;
        for &step in &filled[..surplus] {
            self.slots[i].notes[step] = None;
        }
        self.slots[i].recount();
        self.ensure_audible(i)?;
        self.touch(i, None);
        Ok(surplus)
    }

    /// Overwrite metadata and notes wholesale (state import). Metadata is
    /// sanitized and its scale validated before anything is written.
    pub(crate) fn load_loop(&mut self, id: LoopId, meta: LoopMetadata, notes: &[Option<u8>]) -> Result<()> {
        let i = self.check(id)?;
        let mut meta = meta;
        meta.sanitize();
        self.scales.get(&meta.scale)?;
        let slot = &mut self.slots[i];
        slot.meta = meta;
        slot.initialized = true;
        slot.notes = rest_row(MAX_STEPS);
        for (cell, note) in slot.notes.iter_mut().zip(notes.iter().take(MAX_STEPS)) {
            *cell = note.map(|n| clamp_note(n as i32));
        }
        slot.recount();
        let stamp = slot.meta.last_modified;
        if slot.meta.is_active {
            self.ensure_audible(i)?;
        }
        self.touch(i, None);
        self.slots[i].meta.last_modified = stamp;
        Ok(())
    }

    /// Return a slot to its never-initialized state.
    pub(crate) fn clear_loop(&mut self, id: LoopId) -> Result<()> {
        let i = self.check(id)?;
        if self.slots[i].initialized {
            self.slots[i] = LoopSlot::blank(&self.default_scale);
            self.touch(i, None);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Silence invariant
    // -----------------------------------------------------------------------

    /// Pick a note for a loop that must not be silent: a random in-scale
    /// note in range, or the base note clamped into range if none fits.
    fn fallback_note(&mut self, i: usize) -> Result<u8> {
        let meta = &self.slots[i].meta;
        let pool = possible_notes(
            self.scales.get(&meta.scale)?,
            meta.base_note,
            meta.note_range_min,
            meta.note_range_max,
        );
        let fallback = meta.base_note.clamp(meta.note_range_min, meta.note_range_max);
        Ok(self.rng.choose(&pool).copied().unwrap_or(fallback))
    }

    /// Inject a fallback note at step 0 if the loop's active range is
    /// empty. Returns whether a note was injected.
    fn ensure_audible(&mut self, i: usize) -> Result<bool> {
        if self.slots[i].filled > 0 {
            return Ok(false);
        }
        let note = self.fallback_note(i)?;
        debug!("loop {i}: silent row, injecting fallback note {note}");
        self.slots[i].notes[0] = Some(note);
        self.slots[i].recount();
        Ok(true)
    }
}
