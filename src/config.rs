use crate::Error;

// -------------------------------------------------------------------------------------------------

/// Configuration for the engine's look-ahead true-peak limiter.
#[derive(Clone, Debug, PartialEq)]
pub struct LimiterConfig {
    /// Look-ahead time in milliseconds.
    pub lookahead_ms: f32,
    /// Linear output ceiling the true-peak estimate is held below.
    pub ceiling: f32,
    /// Gain recovery time in milliseconds.
    pub release_ms: f32,
    /// Linear gain applied before peak detection.
    pub master_trim: f32,
    /// Extra ring slack in frames beyond `lookahead + max_block`.
    pub extra_frames: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 3.0,
            ceiling: 0.98,
            release_ms: 50.0,
            master_trim: 0.80,
            extra_frames: 256,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Construction configuration for a [`GranularEngine`](crate::GranularEngine).
///
/// All options except `sample_rate` have usable defaults. Validation happens once in
/// [`GranularEngine::new`](crate::GranularEngine::new): an invalid config is fatal and
/// the engine refuses to start.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Output sample rate in Hz. Must be > 0.
    pub sample_rate: u32,
    /// Capacity of the grain pool. Must be >= 1.
    pub max_grains: usize,
    /// Size of the Hann envelope lookup table. Must be >= 2.
    pub env_table_size: usize,
    /// Time constant of the per-block filter parameter smoothers in milliseconds.
    pub filter_tau_ms: f32,
    /// Look-ahead limiter settings.
    pub limiter: LimiterConfig,
    /// Envelope tail length granted to soft-killed grains in milliseconds.
    pub kill_tail_ms: f32,
    /// Time constant of the per-cursor output gain smoother in milliseconds.
    pub gain_tau_ms: f32,
    /// Cap on grain spawns per cursor per block. `None` derives `max(24, 32·sr/48000)`.
    pub max_spawn_per_block: Option<usize>,
}

impl EngineConfig {
    /// Create a config with the given sample rate and defaults for everything else.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            max_grains: 1024,
            env_table_size: 1024,
            filter_tau_ms: 25.0,
            limiter: LimiterConfig::default(),
            kill_tail_ms: 28.0,
            gain_tau_ms: 20.0,
            max_spawn_per_block: None,
        }
    }

    /// The effective per-cursor spawn cap per block.
    pub fn spawn_cap(&self) -> usize {
        self.max_spawn_per_block
            .unwrap_or_else(|| (32 * self.sample_rate as usize / 48000).max(24))
    }

    /// Validate the config. Returns a fatal [`Error::ConfigError`] when the engine
    /// cannot safely run with these settings.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sample_rate == 0 {
            return Err(Error::ConfigError(
                "Sample rate must be > 0".to_string(), //
            ));
        }
        if self.max_grains < 1 {
            return Err(Error::ConfigError(
                "Grain pool capacity must be >= 1".to_string(),
            ));
        }
        if self.env_table_size < 2 {
            return Err(Error::ConfigError(
                "Envelope table size must be >= 2".to_string(),
            ));
        }
        if !self.filter_tau_ms.is_finite() || self.filter_tau_ms <= 0.0 {
            return Err(Error::ConfigError(
                "Filter smoothing time must be > 0 ms".to_string(),
            ));
        }
        if !self.gain_tau_ms.is_finite() || self.gain_tau_ms <= 0.0 {
            return Err(Error::ConfigError(
                "Gain smoothing time must be > 0 ms".to_string(),
            ));
        }
        if !self.kill_tail_ms.is_finite() || self.kill_tail_ms < 0.0 {
            return Err(Error::ConfigError(
                "Kill tail must be >= 0 ms".to_string(), //
            ));
        }
        let limiter = &self.limiter;
        if !limiter.lookahead_ms.is_finite() || limiter.lookahead_ms < 0.0 {
            return Err(Error::ConfigError(
                "Limiter lookahead must be >= 0 ms".to_string(),
            ));
        }
        if !limiter.ceiling.is_finite() || limiter.ceiling <= 0.0 {
            return Err(Error::ConfigError(
                "Limiter ceiling must be > 0".to_string(),
            ));
        }
        if !limiter.release_ms.is_finite() || limiter.release_ms <= 0.0 {
            return Err(Error::ConfigError(
                "Limiter release must be > 0 ms".to_string(),
            ));
        }
        if !limiter.master_trim.is_finite() || limiter.master_trim <= 0.0 {
            return Err(Error::ConfigError(
                "Limiter master trim must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(EngineConfig::new(48000).validate().is_ok());
        assert!(EngineConfig::new(0).validate().is_err());

        let mut config = EngineConfig::new(44100);
        config.max_grains = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new(44100);
        config.limiter.ceiling = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn spawn_cap() {
        assert_eq!(EngineConfig::new(48000).spawn_cap(), 32);
        assert_eq!(EngineConfig::new(96000).spawn_cap(), 64);
        // floored at 24 for low sample rates
        assert_eq!(EngineConfig::new(8000).spawn_cap(), 24);

        let mut config = EngineConfig::new(48000);
        config.max_spawn_per_block = Some(4);
        assert_eq!(config.spawn_cap(), 4);
    }
}
