//! Fixed-length PCM frame passed from capture to the session controller.

use std::time::Duration;

/// One block of mono signed 16-bit PCM.
///
/// Frames are moved, never shared: capture allocates one, the frame queue
/// hands it to exactly one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonically increasing per capture session, starting at 0.
    pub seq: u64,
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl Frame {
    pub fn new(seq: u64, samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            seq,
            samples,
            sample_rate,
        }
    }

    /// Build a frame from f32 samples in [-1.0, 1.0], clamping out-of-range values.
    pub fn from_f32(seq: u64, samples: &[f32], sample_rate: u32) -> Self {
        let samples = samples.iter().map(|&s| f32_to_i16(s)).collect();
        Self::new(seq, samples, sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode frames as a 16-bit mono PCM WAV file in memory.
pub fn encode_wav(frames: &[Frame], sample_rate: u32) -> crate::error::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| anyhow::anyhow!("wav writer: {e}"))?;
        for frame in frames {
            for &s in &frame.samples {
                writer
                    .write_sample(s)
                    .map_err(|e| anyhow::anyhow!("wav write: {e}"))?;
            }
        }
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("wav finalize: {e}"))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_follows_sample_rate() {
        let frame = Frame::new(0, vec![0; 512], 16_000);
        assert_eq!(frame.duration(), Duration::from_millis(32));
        assert!(!frame.is_empty());
    }

    #[test]
    fn f32_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn wav_encoding_carries_every_sample() {
        let frames = vec![
            Frame::new(0, vec![1, 2, 3], 16_000),
            Frame::new(1, vec![4, 5], 16_000),
        ];
        let bytes = encode_wav(&frames, 16_000).expect("encode");
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).expect("decode");
        assert_eq!(reader.spec().sample_rate, 16_000);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.expect("sample")).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
    }
}
