use std::sync::LazyLock;

// -------------------------------------------------------------------------------------------------

pub(crate) const MINUS_INF_IN_DB: f32 = -200.0f32;

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
macro_rules! assert_eq_with_epsilon {
    ($x:expr, $y:expr, $d:expr) => {
        if ($x - $y).abs() > $d {
            panic!("assertion failed: {} != {} (epsilon {})", $x, $y, $d);
        }
    };
}

// -------------------------------------------------------------------------------------------------

pub fn linear_to_db(value: f32) -> f32 {
    static LIN_TO_DB_FACTOR: LazyLock<f32> = LazyLock::new(|| 20.0f32 / 10.0f32.ln());
    if value == 1.0 {
        return 0.0; // avoid rounding errors at exactly 0 dB
    } else if value > 1e-12f32 {
        return value.ln() * *LIN_TO_DB_FACTOR;
    }
    MINUS_INF_IN_DB
}

// -------------------------------------------------------------------------------------------------

pub fn db_to_linear(value: f32) -> f32 {
    static DB_TO_LIN_FACTOR: LazyLock<f32> = LazyLock::new(|| 10.0f32.ln() / 20.0f32);
    if value == 0.0f32 {
        return 1.0f32; // avoid rounding errors at exactly 0 dB
    } else if value > MINUS_INF_IN_DB {
        return (value * *DB_TO_LIN_FACTOR).exp();
    }
    0.0f32
}

// -------------------------------------------------------------------------------------------------

/// Equal-power panning factors for a panning position in range `[-1, 1]`.
///
/// Returns `(cos θ, sin θ)` with `θ = (pan + 1)·π/4`, so `l² + r² = 1` holds for all positions
/// and a centered pan yields `√½` on both channels.
pub fn panning_factors(pan: f32) -> (f32, f32) {
    let theta = (pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
    (theta.cos(), theta.sin())
}

// -------------------------------------------------------------------------------------------------
