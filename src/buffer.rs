//! Source audio storage shared with the realtime engine.

use crate::Error;

// -------------------------------------------------------------------------------------------------

/// An immutable mono or stereo PCM buffer the engine samples grains from.
///
/// Channels are stored planar (one `Vec` per channel). The engine never mutates a source buffer;
/// replacement happens wholesale through the message inbox, where the retired buffer is handed
/// back to the control thread's collector. Mono sources feed both output channels.
pub struct SourceBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl SourceBuffer {
    /// Create a buffer from planar channel data (1 or 2 channels of equal length).
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, Error> {
        if channels.is_empty() || channels.len() > 2 {
            return Err(Error::ParameterError(format!(
                "Source buffers must have 1 or 2 channels, got {}",
                channels.len()
            )));
        }
        if channels.len() == 2 && channels[0].len() != channels[1].len() {
            return Err(Error::ParameterError(
                "Source buffer channels must have equal lengths".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(Error::ParameterError(
                "Source buffer sample rate must be > 0".to_string(),
            ));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Create a stereo buffer from separate left/right channel data.
    pub fn from_stereo(left: Vec<f32>, right: Vec<f32>, sample_rate: u32) -> Result<Self, Error> {
        Self::new(vec![left, right], sample_rate)
    }

    /// Create a mono buffer. Both output channels will read the same data.
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self, Error> {
        Self::new(vec![samples], sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Buffer length in frames.
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels[0].is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffer duration in seconds.
    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    /// Raw access to a channel's samples. Channel 0 feeds the loudness analysis.
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel.min(self.channels.len() - 1)]
    }

    /// Read a stereo frame at a fractional frame position with linear interpolation.
    ///
    /// The position wraps on the channel length, so grains reading past either end loop
    /// through the source. Mono buffers return the same sample on both channels.
    #[inline]
    pub fn frame_at(&self, position: f64) -> (f32, f32) {
        let frame_count = self.len();
        if frame_count == 0 {
            return (0.0, 0.0);
        }
        let wrapped = position.rem_euclid(frame_count as f64);
        // rem_euclid can round up to the length itself for tiny negative inputs
        let index = (wrapped as usize).min(frame_count - 1);
        let fraction = ((wrapped - index as f64) as f32).clamp(0.0, 1.0);
        let next = if index + 1 < frame_count { index + 1 } else { 0 };

        let left_channel = &self.channels[0];
        let left = left_channel[index] * (1.0 - fraction) + left_channel[next] * fraction;
        if self.channels.len() == 1 {
            (left, left)
        } else {
            let right_channel = &self.channels[1];
            let right = right_channel[index] * (1.0 - fraction) + right_channel[next] * fraction;
            (left, right)
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_validates_shape() {
        assert!(SourceBuffer::new(vec![], 44100).is_err());
        assert!(SourceBuffer::new(vec![vec![0.0; 8]; 3], 44100).is_err());
        assert!(SourceBuffer::from_stereo(vec![0.0; 8], vec![0.0; 7], 44100).is_err());
        assert!(SourceBuffer::from_mono(vec![0.0; 8], 0).is_err());
        assert!(SourceBuffer::from_mono(vec![0.0; 8], 44100).is_ok());
    }

    #[test]
    fn interpolated_reads() {
        let buffer =
            SourceBuffer::from_stereo(vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 1.0], 48000).unwrap();
        let (l, r) = buffer.frame_at(0.5);
        assert!((l - 0.5).abs() < 1e-6);
        assert!((r - 0.5).abs() < 1e-6);
        // exact frame positions read verbatim
        let (l, r) = buffer.frame_at(1.0);
        assert_eq!((l, r), (1.0, 0.0));
    }

    #[test]
    fn position_wraps_on_length() {
        let buffer = SourceBuffer::from_mono(vec![0.25, 0.5, 0.75], 48000).unwrap();
        let (l, _) = buffer.frame_at(3.0);
        assert_eq!(l, 0.25);
        let (l, _) = buffer.frame_at(-1.0);
        assert_eq!(l, 0.75);
        // interpolation across the wrap point blends last and first frame
        let (l, _) = buffer.frame_at(2.5);
        assert!((l - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mono_feeds_both_channels() {
        let buffer = SourceBuffer::from_mono(vec![0.3, 0.6], 48000).unwrap();
        let (l, r) = buffer.frame_at(0.0);
        assert_eq!(l, r);
    }
}
