//! **grainflow** is a real-time polyphonic granular synthesizer engine for Rust. It continuously
//! resynthesizes a stereo source buffer by emitting short, overlapping, Hann-windowed grains
//! from three independent playhead cursors, and is designed to run inside a realtime audio
//! callback without allocating, blocking or faulting.
//!
//! ### Overview
//!
//! - **[`GranularEngine`]** is the audio-thread half: it renders fixed-size blocks on demand,
//!   mixing up to [`EngineConfig::max_grains`] concurrent grains from a Poisson-scheduled,
//!   backpressured spawner per cursor. Each cursor owns a lowpass filter with LFO-modulated
//!   cutoff and a polyphonic held-note set with round-robin pitch assignment; the summed output
//!   passes through a 2× true-peak look-ahead limiter.
//!
//! - **[`EngineController`]** is the control-thread half: it writes the wait-free parameter
//!   plane, feeds the message inbox (buffer swaps, note on/off, soft-kill, play/pause) and
//!   polls throttled telemetry (cursor positions, limiter true-peak and gain reduction).
//!
//! - **[`SourceBuffer`]** holds the decoded material grains are sampled from, and
//!   **[`LoudnessMap`]** its per-window RMS summary used to compensate quiet regions at
//!   grain spawn time. Both are swapped atomically at block boundaries; retired buffers are
//!   reclaimed on the control thread, never freed by the audio callback.
//!
//! ### Getting started
//!
//! ```rust,no_run
//! use grainflow::{EngineConfig, GranularEngine, ParamField, SourceBuffer, Error};
//!
//! fn main() -> Result<(), Error> {
//!     let (mut engine, controller) = GranularEngine::new(EngineConfig::new(48000))?;
//!
//!     // load some material and let cursor A scan through it
//!     let samples = vec![0.0f32; 48000];
//!     controller.set_buffer(SourceBuffer::from_mono(samples, 48000)?)?;
//!     controller.set_param(0, ParamField::Density, 25.0)?;
//!     controller.set_param(0, ParamField::ScanSpeed, 0.1)?;
//!     controller.set_playing(true)?;
//!
//!     // inside the audio callback:
//!     let (mut left, mut right) = (vec![0.0f32; 128], vec![0.0f32; 128]);
//!     engine.process(&mut left, &mut right);
//!     Ok(())
//! }
//! ```

// -------------------------------------------------------------------------------------------------

// private mods (partly re-exported)

mod buffer;
mod config;
mod engine;
mod envelope;
mod error;
mod grain;
mod loudness;
mod messages;
mod notes;
mod params;
mod scheduler;

// public, flat re-exports (common types)

pub use buffer::SourceBuffer;
pub use config::{EngineConfig, LimiterConfig};
pub use dsp::biquad::FilterSlope;
pub use engine::{CursorActivity, GranularEngine};
pub use error::Error;
pub use loudness::LoudnessMap;
pub use messages::{EngineController, EngineEvent, EngineMessage};
pub use params::{CursorParamValues, ParamField};

// public mods

pub mod dsp;
pub mod utils;

// -------------------------------------------------------------------------------------------------

/// Number of independent playhead cursors.
pub const CURSOR_COUNT: usize = 3;

// -------------------------------------------------------------------------------------------------

/// Run the given function under an allocation guard when the `assert-allocs` feature is
/// enabled, so accidental allocations in the realtime path panic in tests and debug setups.
pub(crate) fn assert_no_alloc<T, F: FnOnce() -> T>(func: F) -> T {
    #[cfg(feature = "assert-allocs")]
    return assert_no_alloc::assert_no_alloc::<T, F>(func);

    #[cfg(not(feature = "assert-allocs"))]
    return func();
}

/// Exempt a known, documented allocation (the limiter's rare ring growth) from the guard.
#[inline]
pub(crate) fn permit_alloc<T, F: FnOnce() -> T>(func: F) -> T {
    #[cfg(feature = "assert-allocs")]
    return assert_no_alloc::permit_alloc::<T, F>(func);

    #[cfg(not(feature = "assert-allocs"))]
    return func();
}
