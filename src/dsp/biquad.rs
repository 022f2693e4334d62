//! RBJ lowpass biquads and the per-cursor filter channel.

use std::f64;

// -------------------------------------------------------------------------------------------------

/// Lowpass slope of a [`FilterChannel`]: one or two cascaded biquad stages.
#[derive(
    Default,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[repr(u8)]
pub enum FilterSlope {
    /// Single biquad, 12 dB/octave.
    #[default]
    #[strum(serialize = "12 dB")]
    Db12,
    /// Two cascaded biquads, 24 dB/octave.
    #[strum(serialize = "24 dB")]
    Db24,
}

impl FilterSlope {
    /// Snap a dB/octave figure to the nearest supported slope.
    pub fn from_db_per_octave(db: f32) -> Self {
        if db >= 18.0 {
            Self::Db24
        } else {
            Self::Db12
        }
    }

    pub fn stages(self) -> usize {
        match self {
            Self::Db12 => 1,
            Self::Db24 => 2,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Normalized RBJ lowpass coefficients for a [`BiquadLowpass`].
///
/// Coefficients are recomputed only when cutoff or Q actually change, so unchanged blocks pay
/// a comparison instead of transcendentals. Cutoff is clamped to `[15, 0.45·sr]` and Q to
/// `>= 0.25`, which keeps the filter BIBO-stable for every reachable parameter combination.
#[derive(Debug, Clone, PartialEq)]
pub struct BiquadCoefficients {
    sample_rate: u32,
    cutoff: f32,
    q: f32,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl BiquadCoefficients {
    const MIN_CUTOFF: f32 = 15.0;
    const MAX_CUTOFF_RATIO: f32 = 0.45;
    const MIN_Q: f32 = 0.25;

    pub fn new(sample_rate: u32, cutoff: f32, q: f32) -> Self {
        debug_assert!(sample_rate > 0);
        let mut coefficients = Self {
            sample_rate,
            cutoff: 0.0,
            q: 0.0,
            b0: 0.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        };
        coefficients.set(cutoff, q);
        coefficients
    }

    /// Update cutoff (Hz) and Q, recomputing coefficients only when either value changed.
    pub fn set(&mut self, cutoff: f32, q: f32) {
        let max_cutoff = Self::MAX_CUTOFF_RATIO * self.sample_rate as f32;
        let cutoff = cutoff.clamp(Self::MIN_CUTOFF, max_cutoff);
        let q = q.max(Self::MIN_Q);
        if cutoff == self.cutoff && q == self.q {
            return;
        }
        self.cutoff = cutoff;
        self.q = q;

        let w0 = f64::consts::TAU * cutoff as f64 / self.sample_rate as f64;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q as f64);
        let a0 = 1.0 + alpha;

        self.b1 = (1.0 - cos_w0) / a0;
        self.b0 = self.b1 * 0.5;
        self.b2 = self.b0;
        self.a1 = -2.0 * cos_w0 / a0;
        self.a2 = (1.0 - alpha) / a0;
    }

    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    pub fn q(&self) -> f32 {
        self.q
    }
}

// -------------------------------------------------------------------------------------------------

/// Single-channel lowpass biquad in transposed direct-form II topology.
#[derive(Default, Debug, Clone)]
pub struct BiquadLowpass {
    z1: f64,
    z2: f64,
}

impl BiquadLowpass {
    /// Tiny DC offset summed into every input sample to flush denormals out of the state.
    const ANTI_DENORMAL: f64 = 1e-24;

    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the filter on a single sample.
    #[inline]
    pub fn process_sample(&mut self, coefficients: &BiquadCoefficients, input: f64) -> f64 {
        let input = input + Self::ANTI_DENORMAL;
        let output = coefficients.b0 * input + self.z1;
        self.z1 = coefficients.b1 * input - coefficients.a1 * output + self.z2;
        self.z2 = coefficients.b2 * input - coefficients.a2 * output;
        output
    }

    /// Reset filter state, e.g. when the audio callback restarts.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

// -------------------------------------------------------------------------------------------------

/// One cursor's stereo filter path: a 12 or 24 dB/octave lowpass cascade with per-block
/// parameter smoothing and an optional `tanh` drive stage in front.
///
/// Parameters change at most once per block. Cutoff and Q targets are approached with a
/// one-pole smoother so knob jumps and LFO steps don't zipper, then the shared coefficients
/// are recomputed once. No allocation happens after construction.
pub struct FilterChannel {
    sample_rate: u32,
    smoothing_tau: f32,
    coefficients: BiquadCoefficients,
    // [stage][channel]
    stages: [[BiquadLowpass; 2]; 2],
    slope: FilterSlope,
    smoothed_cutoff: f32,
    smoothed_q: f32,
}

impl FilterChannel {
    /// Create a filter channel with the given smoothing time constant in seconds.
    pub fn new(sample_rate: u32, smoothing_tau: f32) -> Self {
        let initial_cutoff = BiquadCoefficients::MAX_CUTOFF_RATIO * sample_rate as f32;
        let initial_q = 0.707;
        Self {
            sample_rate,
            smoothing_tau,
            coefficients: BiquadCoefficients::new(sample_rate, initial_cutoff, initial_q),
            stages: Default::default(),
            slope: FilterSlope::Db12,
            smoothed_cutoff: initial_cutoff,
            smoothed_q: initial_q,
        }
    }

    /// Filter a stereo bus in place.
    ///
    /// `cutoff` and `q` are this block's targets (the engine applies LFO modulation to the
    /// cutoff before calling), `drive` is the linear pre-filter gain, active above 1.
    pub fn process(
        &mut self,
        bus_l: &mut [f32],
        bus_r: &mut [f32],
        cutoff: f32,
        q: f32,
        drive: f32,
        slope: FilterSlope,
    ) {
        debug_assert_eq!(bus_l.len(), bus_r.len());
        let frames = bus_l.len();
        if frames == 0 {
            return;
        }

        if slope != self.slope {
            // the idle stage holds stale state from the last time it ran
            self.slope = slope;
            for channel_state in &mut self.stages[1] {
                channel_state.reset();
            }
        }

        // per-block one-pole smoothing towards the parameter targets
        let k = 1.0 - (-(frames as f32 / self.sample_rate as f32) / self.smoothing_tau).exp();
        self.smoothed_cutoff += (cutoff - self.smoothed_cutoff) * k;
        self.smoothed_q += (q - self.smoothed_q) * k;
        self.coefficients.set(self.smoothed_cutoff, self.smoothed_q);

        if drive > 1.0 {
            let drive = drive as f64;
            for sample in bus_l.iter_mut().chain(bus_r.iter_mut()) {
                *sample = (*sample as f64 * drive).tanh() as f32;
            }
        }

        let stages = slope.stages();
        for (channel, bus) in [bus_l, bus_r].into_iter().enumerate() {
            for sample in bus.iter_mut() {
                let mut value = *sample as f64;
                for stage in 0..stages {
                    value = self.stages[stage][channel].process_sample(&self.coefficients, value);
                }
                *sample = value as f32;
            }
        }
    }

    /// Reset all filter state.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            for channel_state in stage {
                channel_state.reset();
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
