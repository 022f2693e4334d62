//! DSP building blocks of the render path.

pub mod biquad;
pub mod limiter;
