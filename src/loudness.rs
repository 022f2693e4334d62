//! Windowed RMS summary of the source, used for grain gain compensation.

use crate::{buffer::SourceBuffer, Error};

// -------------------------------------------------------------------------------------------------

/// Per-window RMS map of a source buffer.
///
/// The map is computed offline on the control thread and is read-only during playback. The grain
/// spawner uses it to boost grains landing in quiet regions and attenuate loud ones, so cursor
/// movement doesn't change the perceived output level as drastically as the raw material does.
pub struct LoudnessMap {
    rms: Vec<f32>,
    window_frames: usize,
    sample_rate: u32,
}

impl LoudnessMap {
    /// Spawn gain target the compensation steers the windowed RMS towards.
    const COMP_TARGET: f32 = 0.12;
    /// Compensation exponent. 1 would fully normalize, 0 disables compensation.
    const COMP_EXPONENT: f32 = 0.6;
    /// RMS floor to keep silent windows from exploding the compensation gain.
    const COMP_EPSILON: f32 = 1e-4;

    /// Analyze channel 0 of the given source with the given RMS window size in frames.
    pub fn analyze(source: &SourceBuffer, window_frames: usize) -> Result<Self, Error> {
        if window_frames == 0 {
            return Err(Error::ParameterError(
                "Loudness window size must be > 0 frames".to_string(),
            ));
        }
        let samples = source.channel(0);
        let window_count = samples.len().div_ceil(window_frames);
        let mut rms = Vec::with_capacity(window_count);
        for window in samples.chunks(window_frames) {
            let energy: f32 = window.iter().map(|s| s * s).sum();
            rms.push((energy / window.len() as f32).sqrt());
        }
        Ok(Self {
            rms,
            window_frames,
            sample_rate: source.sample_rate(),
        })
    }

    /// Create a map from precomputed RMS values, e.g. received over the message inbox.
    pub fn from_rms(rms: Vec<f32>, window_frames: usize, sample_rate: u32) -> Result<Self, Error> {
        if window_frames == 0 || sample_rate == 0 {
            return Err(Error::ParameterError(
                "Loudness map window size and sample rate must be > 0".to_string(),
            ));
        }
        if rms.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::ParameterError(
                "Loudness map RMS values must be finite and >= 0".to_string(),
            ));
        }
        Ok(Self {
            rms,
            window_frames,
            sample_rate,
        })
    }

    pub fn window_count(&self) -> usize {
        self.rms.len()
    }

    /// RMS of the window containing the given source time in seconds.
    #[inline]
    pub fn rms_at(&self, seconds: f64) -> f32 {
        if self.rms.is_empty() {
            return 0.0;
        }
        let frame = (seconds * self.sample_rate as f64).max(0.0) as usize;
        let window = (frame / self.window_frames).min(self.rms.len() - 1);
        self.rms[window]
    }

    /// Loudness compensation gain for a grain starting at the given source time.
    #[inline]
    pub fn compensation_at(&self, seconds: f64) -> f32 {
        let rms = self.rms_at(seconds).max(Self::COMP_EPSILON);
        (Self::COMP_TARGET / rms).powf(Self::COMP_EXPONENT)
    }
}

// -------------------------------------------------------------------------------------------------
