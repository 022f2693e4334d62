//! Look-ahead true-peak limiter on the summed master bus.

use crate::{config::LimiterConfig, utils::linear_to_db};

// -------------------------------------------------------------------------------------------------

/// Per-block limiter telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterTelemetry {
    /// Estimated true-peak after gain, in dBFS.
    pub tp_db: f32,
    /// Gain reduction in dB, always <= 0.
    pub gr_db: f32,
}

// -------------------------------------------------------------------------------------------------

/// Stereo look-ahead limiter with a 2× linear true-peak estimate.
///
/// Input is sanitized, trimmed, written into a delay ring and emitted `lookahead` frames late
/// with the limiting gain applied. The gain envelope attacks instantly to the gain needed to
/// hold the block's true-peak below the ceiling and recovers exponentially. Inter-sample peaks
/// are estimated by considering the linear midpoint of every adjacent sample pair, which
/// catches the worst of what plain sample peaks miss at a fraction of a real upsampler's cost.
///
/// The ring is sized at construction for `lookahead + max_block + extra` frames; a larger host
/// block grows it on the audio thread. That growth allocates and is logged once: callers should
/// warm up with the largest block they intend to use.
pub struct Limiter {
    lookahead: usize,
    ceiling: f32,
    master_trim: f32,
    release_coef: f32,
    extra_frames: usize,
    ring_l: Vec<f32>,
    ring_r: Vec<f32>,
    write_idx: usize,
    env: f32,
    resize_logged: bool,
}

impl Limiter {
    /// Peak threshold below which the block counts as silent and needs no gain.
    const SILENCE_THRESHOLD: f32 = 1e-12;
    /// Magnitudes below this flush to zero during sanitization.
    const DENORMAL_THRESHOLD: f32 = 1e-24;
    /// Magnitudes above this clamp during sanitization.
    const CLAMP_LIMIT: f32 = 1e6;

    pub fn new(sample_rate: u32, config: &LimiterConfig, max_block_frames: usize) -> Self {
        debug_assert!(sample_rate > 0);
        let lookahead = (config.lookahead_ms / 1000.0 * sample_rate as f32).round() as usize;
        let release_seconds = config.release_ms / 1000.0;
        let release_coef = (-1.0 / (sample_rate as f32 * release_seconds)).exp();
        let ring_frames = lookahead + max_block_frames + config.extra_frames;
        Self {
            lookahead,
            ceiling: config.ceiling,
            master_trim: config.master_trim,
            release_coef,
            extra_frames: config.extra_frames,
            ring_l: vec![0.0; ring_frames],
            ring_r: vec![0.0; ring_frames],
            write_idx: 0,
            env: 1.0,
            resize_logged: false,
        }
    }

    /// The delay this limiter introduces, in frames.
    pub fn latency(&self) -> usize {
        self.lookahead
    }

    /// Process one stereo block in place, returning this block's telemetry.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) -> LimiterTelemetry {
        debug_assert_eq!(left.len(), right.len());
        let frames = left.len();
        if frames == 0 {
            return LimiterTelemetry {
                tp_db: linear_to_db(0.0),
                gr_db: 0.0,
            };
        }

        // sanitize and trim before anything reads the samples
        for sample in left.iter_mut().chain(right.iter_mut()) {
            *sample = Self::sanitize(*sample) * self.master_trim;
        }

        let true_peak = Self::estimate_true_peak(left).max(Self::estimate_true_peak(right));
        let needed = if true_peak > Self::SILENCE_THRESHOLD {
            (self.ceiling / true_peak).min(1.0)
        } else {
            1.0
        };

        self.ensure_ring_capacity(frames);
        let capacity = self.ring_l.len();
        let write_start = self.write_idx;
        for (offset, (l, r)) in left.iter().zip(right.iter()).enumerate() {
            let index = (write_start + offset) % capacity;
            self.ring_l[index] = *l;
            self.ring_r[index] = *r;
        }
        self.write_idx = (write_start + frames) % capacity;

        // instant attack, exponential release; the attack branch also holds on equality so a
        // sustained overload pins the envelope instead of creeping back up between blocks
        if needed <= self.env {
            self.env = needed;
        } else {
            self.env = 1.0 - (1.0 - self.env) * self.release_coef;
        }

        // emit the delayed ring content with the gain applied
        let read_start = (write_start + capacity - self.lookahead) % capacity;
        for (offset, (l, r)) in left.iter_mut().zip(right.iter_mut()).enumerate() {
            let index = (read_start + offset) % capacity;
            *l = self.ring_l[index] * self.env;
            *r = self.ring_r[index] * self.env;
        }

        LimiterTelemetry {
            tp_db: linear_to_db(true_peak * self.env),
            gr_db: linear_to_db(self.env),
        }
    }

    #[inline]
    fn sanitize(sample: f32) -> f32 {
        if !sample.is_finite() {
            0.0
        } else if sample.abs() < Self::DENORMAL_THRESHOLD {
            0.0
        } else {
            sample.clamp(-Self::CLAMP_LIMIT, Self::CLAMP_LIMIT)
        }
    }

    /// 2× true-peak estimate: the peak over all samples and all adjacent-pair midpoints.
    #[inline]
    fn estimate_true_peak(channel: &[f32]) -> f32 {
        let mut peak = 0.0f32;
        for pair in channel.windows(2) {
            peak = peak.max(pair[0].abs());
            peak = peak.max(0.5 * (pair[0] + pair[1]).abs());
        }
        if let Some(last) = channel.last() {
            peak = peak.max(last.abs());
        }
        peak
    }

    /// Grow the delay ring when a block exceeds the allocated slack, preserving the most
    /// recent `lookahead` frames of history.
    fn ensure_ring_capacity(&mut self, block_frames: usize) {
        let required = self.lookahead + block_frames + self.extra_frames;
        let capacity = self.ring_l.len();
        if required <= capacity {
            return;
        }
        // growth is documented as not realtime-safe for this single block
        crate::permit_alloc(|| {
            if !self.resize_logged {
                log::warn!(
                    "Limiter ring grows from {capacity} to {} frames; \
                     warm up with the largest expected block to avoid this",
                    required.max(2 * capacity)
                );
                self.resize_logged = true;
            }
            let new_capacity = required.max(2 * capacity);
            let mut new_l = vec![0.0; new_capacity];
            let mut new_r = vec![0.0; new_capacity];
            for offset in 0..self.lookahead.min(capacity) {
                let source = (self.write_idx + capacity - 1 - offset) % capacity;
                let target = self.lookahead - 1 - offset;
                new_l[target] = self.ring_l[source];
                new_r[target] = self.ring_r[source];
            }
            self.ring_l = new_l;
            self.ring_r = new_r;
            self.write_idx = self.lookahead;
        });
    }
}

// -------------------------------------------------------------------------------------------------
