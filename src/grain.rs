//! The grain pool: spawning, rendering and soft-killing of active grains.

use crate::{buffer::SourceBuffer, envelope::HannWindow, loudness::LoudnessMap};

// -------------------------------------------------------------------------------------------------

/// Spawn parameters for a single grain, resolved by the engine from the cursor's block snapshot.
#[derive(Debug, Clone, Copy)]
pub struct GrainSpawn {
    /// Owning cursor index.
    pub cursor_id: u8,
    /// Start position in the source in fractional frames.
    pub source_phase: f64,
    /// Source frames consumed per output frame.
    pub increment: f32,
    /// Envelope length in output frames.
    pub env_frames: u32,
    /// Equal-power pan coefficients.
    pub pan_l: f32,
    pub pan_r: f32,
    /// Loudness compensation gain.
    pub gain_comp: f32,
}

// -------------------------------------------------------------------------------------------------

/// Fixed-capacity pool of live grains in struct-of-arrays layout.
///
/// Grains are appended by the spawner and freed by the renderer via swap-remove once their
/// envelope completes, so allocation and deletion are both O(1) and the pool never allocates
/// after construction. When the pool is full, spawns are dropped silently; the scheduler's
/// backpressure keeps that path rare.
pub struct GrainPool {
    cursor_id: Box<[u8]>,
    phase: Box<[f64]>,
    inc: Box<[f32]>,
    env_pos: Box<[u32]>,
    env_len: Box<[u32]>,
    pan_l: Box<[f32]>,
    pan_r: Box<[f32]>,
    gain_comp: Box<[f32]>,
    len: usize,
}

impl GrainPool {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 1);
        Self {
            cursor_id: vec![0; capacity].into_boxed_slice(),
            phase: vec![0.0; capacity].into_boxed_slice(),
            inc: vec![0.0; capacity].into_boxed_slice(),
            env_pos: vec![0; capacity].into_boxed_slice(),
            env_len: vec![0; capacity].into_boxed_slice(),
            pan_l: vec![0.0; capacity].into_boxed_slice(),
            pan_r: vec![0.0; capacity].into_boxed_slice(),
            gain_comp: vec![0.0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cursor_id.len()
    }

    /// Number of currently live grains.
    pub fn active(&self) -> usize {
        self.len
    }

    /// Number of live grains owned by the given cursor.
    pub fn active_for_cursor(&self, cursor: usize) -> usize {
        self.cursor_id[..self.len]
            .iter()
            .filter(|id| **id as usize == cursor)
            .count()
    }

    /// Append a grain. Returns false when the pool is full and the spawn was dropped.
    pub fn spawn(&mut self, spawn: GrainSpawn) -> bool {
        if self.len >= self.capacity() {
            return false;
        }
        let index = self.len;
        self.cursor_id[index] = spawn.cursor_id;
        self.phase[index] = spawn.source_phase;
        self.inc[index] = spawn.increment;
        self.env_pos[index] = 0;
        self.env_len[index] = spawn.env_frames.max(1);
        self.pan_l[index] = spawn.pan_l;
        self.pan_r[index] = spawn.pan_r;
        self.gain_comp[index] = spawn.gain_comp;
        self.len += 1;
        true
    }

    fn swap_remove(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let last = self.len - 1;
        self.cursor_id[index] = self.cursor_id[last];
        self.phase[index] = self.phase[last];
        self.inc[index] = self.inc[last];
        self.env_pos[index] = self.env_pos[last];
        self.env_len[index] = self.env_len[last];
        self.pan_l[index] = self.pan_l[last];
        self.pan_r[index] = self.pan_r[last];
        self.gain_comp[index] = self.gain_comp[last];
        self.len = last;
    }

    /// Playback increment of a live grain, for inspection in tests.
    #[cfg(test)]
    pub(crate) fn increment_of(&self, index: usize) -> f32 {
        self.inc[index]
    }

    /// Truncate the remaining envelope of all grains of `cursor` to at most `tail_frames`,
    /// so they ramp out within the tail instead of being cut.
    pub fn soft_kill(&mut self, cursor: usize, tail_frames: u32) {
        for index in 0..self.len {
            if self.cursor_id[index] as usize == cursor {
                let truncated = self.env_pos[index].saturating_add(tail_frames.max(1));
                self.env_len[index] = self.env_len[index].min(truncated);
            }
        }
    }

    /// Render all live grains into the per-cursor buses for output frames `[from, to)`.
    ///
    /// Each bus is a planar stereo pair covering the whole block; grain output accumulates
    /// into the bus of its owning cursor with envelope, loudness compensation and the cursor's
    /// smoothed gain applied. Completed grains are freed in place via swap-remove.
    #[allow(clippy::too_many_arguments)]
    pub fn render(
        &mut self,
        source: &SourceBuffer,
        window: &HannWindow,
        cursor_gains: &[f32],
        buses: &mut [(Vec<f32>, Vec<f32>)],
        from: usize,
        to: usize,
    ) {
        let mut index = 0;
        while index < self.len {
            let finished = self.render_one(source, window, cursor_gains, buses, from, to, index);
            if finished {
                self.swap_remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Render the most recently spawned grain for the block remainder `[from, to)`, freeing
    /// it right away when its envelope already completes within the block.
    #[allow(clippy::too_many_arguments)]
    pub fn render_newest(
        &mut self,
        source: &SourceBuffer,
        window: &HannWindow,
        cursor_gains: &[f32],
        buses: &mut [(Vec<f32>, Vec<f32>)],
        from: usize,
        to: usize,
    ) {
        debug_assert!(self.len > 0);
        let index = self.len - 1;
        if self.render_one(source, window, cursor_gains, buses, from, to, index) {
            self.swap_remove(index);
        }
    }

    /// Render a single grain, returning true when its envelope completed.
    #[allow(clippy::too_many_arguments)]
    fn render_one(
        &mut self,
        source: &SourceBuffer,
        window: &HannWindow,
        cursor_gains: &[f32],
        buses: &mut [(Vec<f32>, Vec<f32>)],
        from: usize,
        to: usize,
        index: usize,
    ) -> bool {
        let cursor = self.cursor_id[index] as usize;
        let env_len = self.env_len[index];
        let mut env_pos = self.env_pos[index];
        let mut phase = self.phase[index];
        let increment = self.inc[index] as f64;
        let gain = self.gain_comp[index] * cursor_gains[cursor];
        let (pan_l, pan_r) = (self.pan_l[index], self.pan_r[index]);
        let (bus_l, bus_r) = &mut buses[cursor];

        let frames = (env_len - env_pos).min((to - from) as u32) as usize;
        for frame in from..from + frames {
            let envelope = window.value_at(env_pos, env_len) * gain;
            let (left, right) = source.frame_at(phase);
            bus_l[frame] += left * envelope * pan_l;
            bus_r[frame] += right * envelope * pan_r;
            phase += increment;
            env_pos += 1;
        }
        self.phase[index] = phase;
        self.env_pos[index] = env_pos;
        env_pos >= env_len
    }
}

// -------------------------------------------------------------------------------------------------

/// Resolve a grain's start phase in source frames from the cursor position and spread jitter.
///
/// `jitter` is the already-drawn uniform offset in `[-spread, +spread]` seconds. The start is
/// clamped so the whole grain fits inside the source; sources shorter than the grain return
/// `None` and the spawn is skipped.
pub fn resolve_start_phase(
    source: &SourceBuffer,
    position: f64,
    jitter_seconds: f64,
    duration_seconds: f64,
) -> Option<f64> {
    let source_duration = source.duration();
    if source.is_empty() || source_duration <= duration_seconds {
        return None;
    }
    let start_seconds =
        (position * source_duration + jitter_seconds).clamp(0.0, source_duration - duration_seconds);
    Some(start_seconds * source.sample_rate() as f64)
}

/// Loudness compensation gain for a grain starting at the given phase, or unity without a map.
pub fn resolve_gain_comp(
    map: Option<&LoudnessMap>,
    source: &SourceBuffer,
    start_phase: f64,
) -> f32 {
    match map {
        Some(map) => map.compensation_at(start_phase / source.sample_rate() as f64),
        None => 1.0,
    }
}

// -------------------------------------------------------------------------------------------------
