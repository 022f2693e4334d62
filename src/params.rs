//! The parameter plane shared between the control thread and the realtime engine.

use std::{ops::RangeInclusive, sync::atomic::{AtomicU32, Ordering}};

use strum::IntoEnumIterator;

use crate::{dsp::biquad::FilterSlope, CURSOR_COUNT};

// -------------------------------------------------------------------------------------------------

/// All per-cursor parameter fields, in plane storage order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[repr(usize)]
pub enum ParamField {
    /// Grain attack portion in seconds.
    Attack,
    /// Grain release portion in seconds.
    Release,
    /// Multiplier scaling `attack + release` into the grain duration.
    GrainSize,
    /// Mean grain spawn rate in grains per second.
    Density,
    /// Uniform jitter of the grain start around the cursor, in ± seconds.
    Spread,
    /// Stereo position in `[-1, 1]`, applied with the equal-power law.
    Pan,
    /// Base playback rate relative to the source.
    Pitch,
    /// Lowpass cutoff: plain Hz, or a normalized `[0, 1]` value mapped onto the audible range.
    Cutoff,
    /// Normalized resonance, log-mapped to a Q of `[0.3, 12]`.
    Q,
    /// Normalized pre-filter drive, mapped to a `tanh` gain of `[1, 10]`.
    Drive,
    /// Filter slope in dB/octave: 12 or 24.
    Slope,
    /// Cutoff LFO rate in Hz.
    LfoFreq,
    /// Cutoff LFO depth in `[0, 1]`.
    LfoDepth,
    /// Cursor auto-advance in source-normalized positions per second.
    ScanSpeed,
    /// Per-cursor linear output gain.
    Gain,
}

impl ParamField {
    pub const COUNT: usize = 15;

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    /// Domain finite values are clamped into. Non-finite values never enter the engine:
    /// the block snapshot substitutes the last known good value instead.
    fn valid_range(self) -> RangeInclusive<f32> {
        match self {
            Self::Attack | Self::Release | Self::Spread => 0.0..=60.0,
            Self::GrainSize => 1e-3..=100.0,
            Self::Density => 0.0..=10_000.0,
            Self::Pan => -1.0..=1.0,
            Self::Pitch => 1e-3..=64.0,
            Self::Cutoff => 0.0..=100_000.0,
            Self::Q | Self::Drive | Self::LfoDepth => 0.0..=1.0,
            Self::Slope => 12.0..=24.0,
            Self::LfoFreq => 0.0..=1_000.0,
            Self::ScanSpeed => -100.0..=100.0,
            Self::Gain => 0.0..=16.0,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// A plain record of one cursor's parameter fields.
///
/// This is the wire form used for wholesale parameter refreshes over the message inbox and as
/// the per-field "last good" shadow the block snapshot falls back to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorParamValues {
    pub attack: f32,
    pub release: f32,
    pub grain_size: f32,
    pub density: f32,
    pub spread: f32,
    pub pan: f32,
    pub pitch: f32,
    pub cutoff: f32,
    pub q: f32,
    pub drive: f32,
    pub slope: f32,
    pub lfo_freq: f32,
    pub lfo_depth: f32,
    pub scan_speed: f32,
    pub gain: f32,
}

impl Default for CursorParamValues {
    fn default() -> Self {
        Self {
            attack: 0.05,
            release: 0.05,
            grain_size: 1.0,
            density: 10.0,
            spread: 0.0,
            pan: 0.0,
            pitch: 1.0,
            cutoff: 1.0,
            q: 0.5,
            drive: 0.0,
            slope: 12.0,
            lfo_freq: 0.0,
            lfo_depth: 0.0,
            scan_speed: 0.0,
            gain: 1.0,
        }
    }
}

impl CursorParamValues {
    pub fn get(&self, field: ParamField) -> f32 {
        match field {
            ParamField::Attack => self.attack,
            ParamField::Release => self.release,
            ParamField::GrainSize => self.grain_size,
            ParamField::Density => self.density,
            ParamField::Spread => self.spread,
            ParamField::Pan => self.pan,
            ParamField::Pitch => self.pitch,
            ParamField::Cutoff => self.cutoff,
            ParamField::Q => self.q,
            ParamField::Drive => self.drive,
            ParamField::Slope => self.slope,
            ParamField::LfoFreq => self.lfo_freq,
            ParamField::LfoDepth => self.lfo_depth,
            ParamField::ScanSpeed => self.scan_speed,
            ParamField::Gain => self.gain,
        }
    }

    pub fn set(&mut self, field: ParamField, value: f32) {
        match field {
            ParamField::Attack => self.attack = value,
            ParamField::Release => self.release = value,
            ParamField::GrainSize => self.grain_size = value,
            ParamField::Density => self.density = value,
            ParamField::Spread => self.spread = value,
            ParamField::Pan => self.pan = value,
            ParamField::Pitch => self.pitch = value,
            ParamField::Cutoff => self.cutoff = value,
            ParamField::Q => self.q = value,
            ParamField::Drive => self.drive = value,
            ParamField::Slope => self.slope = value,
            ParamField::LfoFreq => self.lfo_freq = value,
            ParamField::LfoDepth => self.lfo_depth = value,
            ParamField::ScanSpeed => self.scan_speed = value,
            ParamField::Gain => self.gain = value,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Wait-free shared storage of `3 × ParamField::COUNT` floats.
///
/// The control thread writes fields individually, the audio thread takes a per-field snapshot
/// at block start. Values are stored as `f32` bit patterns in relaxed atomics: per-field tearing
/// is impossible, per-record atomicity is intentionally not provided. The block snapshot
/// validates every field for finiteness and substitutes its last good value otherwise, so a
/// torn or garbage write can never push NaN into the signal path.
pub struct ParameterPlane {
    cells: Box<[AtomicU32]>,
}

impl Default for ParameterPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterPlane {
    pub fn new() -> Self {
        let defaults = CursorParamValues::default();
        let mut cells = Vec::with_capacity(CURSOR_COUNT * ParamField::COUNT);
        for _ in 0..CURSOR_COUNT {
            for field in ParamField::iter() {
                cells.push(AtomicU32::new(defaults.get(field).to_bits()));
            }
        }
        Self {
            cells: cells.into_boxed_slice(),
        }
    }

    #[inline]
    fn cell(&self, cursor: usize, field: ParamField) -> &AtomicU32 {
        debug_assert!(cursor < CURSOR_COUNT);
        &self.cells[cursor * ParamField::COUNT + field.index()]
    }

    /// Write a single field. Callable from any thread.
    pub fn set(&self, cursor: usize, field: ParamField, value: f32) {
        self.cell(cursor, field).store(value.to_bits(), Ordering::Relaxed);
    }

    /// Read a single field. Callable from any thread.
    pub fn get(&self, cursor: usize, field: ParamField) -> f32 {
        f32::from_bits(self.cell(cursor, field).load(Ordering::Relaxed))
    }

    /// Write a whole cursor record field by field.
    pub fn set_all(&self, cursor: usize, values: &CursorParamValues) {
        for field in ParamField::iter() {
            self.set(cursor, field, values.get(field));
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// One cursor's validated, typed parameter snapshot for the current block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorParams {
    pub attack: f32,
    pub release: f32,
    pub grain_size: f32,
    pub density: f32,
    pub spread: f32,
    pub pan: f32,
    pub pitch: f32,
    pub cutoff: f32,
    pub q: f32,
    pub drive: f32,
    pub slope: FilterSlope,
    pub lfo_freq: f32,
    pub lfo_depth: f32,
    pub scan_speed: f32,
    pub gain: f32,
}

impl Default for CursorParams {
    fn default() -> Self {
        let mut shadow = CursorParamValues::default();
        let values = shadow;
        Self::from_values(&values, &mut shadow)
    }
}

impl CursorParams {
    /// Grain duration floor in seconds.
    const MIN_GRAIN_DURATION: f32 = 0.002;

    /// Take a validated per-field snapshot of one cursor's plane record.
    ///
    /// Finite out-of-range values are clamped, non-finite values are replaced with the field's
    /// last good value. `shadow` is updated with whatever each field resolved to.
    pub fn snapshot(
        plane: &ParameterPlane,
        cursor: usize,
        shadow: &mut CursorParamValues,
    ) -> Self {
        let mut values = *shadow;
        for field in ParamField::iter() {
            let raw = plane.get(cursor, field);
            if raw.is_finite() {
                let range = field.valid_range();
                values.set(field, raw.clamp(*range.start(), *range.end()));
            }
        }
        Self::from_values(&values, shadow)
    }

    fn from_values(values: &CursorParamValues, shadow: &mut CursorParamValues) -> Self {
        *shadow = *values;
        Self {
            attack: values.attack,
            release: values.release,
            grain_size: values.grain_size,
            density: values.density,
            spread: values.spread,
            pan: values.pan,
            pitch: values.pitch,
            cutoff: values.cutoff,
            q: values.q,
            drive: values.drive,
            slope: FilterSlope::from_db_per_octave(values.slope),
            lfo_freq: values.lfo_freq,
            lfo_depth: values.lfo_depth,
            scan_speed: values.scan_speed,
            gain: values.gain,
        }
    }

    /// Grain duration in seconds, floored so zero-length envelopes can't occur.
    #[inline]
    pub fn grain_duration(&self) -> f32 {
        ((self.attack + self.release) * self.grain_size).max(Self::MIN_GRAIN_DURATION)
    }

    /// Resonance log-mapped from its normalized `[0, 1]` range onto `[0.3, 12]`.
    #[inline]
    pub fn q_mapped(&self) -> f32 {
        const Q_MIN: f32 = 0.3;
        const Q_MAX: f32 = 12.0;
        Q_MIN * (Q_MAX / Q_MIN).powf(self.q)
    }

    /// Pre-filter drive gain mapped from its normalized `[0, 1]` range onto `[1, 10]`.
    #[inline]
    pub fn drive_mapped(&self) -> f32 {
        1.0 + 9.0 * self.drive
    }

    /// Base cutoff in Hz for the given sample rate.
    ///
    /// Values `<= 1` are treated as normalized and mapped exponentially onto `[20, 0.45·sr]`,
    /// larger values are taken as plain Hz. Both forms are clamped into the stable filter range.
    #[inline]
    pub fn cutoff_hz(&self, sample_rate: u32) -> f32 {
        let max_cutoff = 0.45 * sample_rate as f32;
        let hz = if self.cutoff <= 1.0 {
            20.0 * (max_cutoff / 20.0).powf(self.cutoff)
        } else {
            self.cutoff
        };
        hz.clamp(20.0, max_cutoff)
    }
}

// -------------------------------------------------------------------------------------------------
