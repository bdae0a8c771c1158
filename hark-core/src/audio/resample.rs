//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Capture runs at the device's native rate (often 44.1 or 48 kHz) and is
//! converted to the frame rate on the capture thread. Reply clips go the
//! other way, from the synthesizer's rate to the output device's rate.
//!
//! When both rates match, `RateConverter` is a passthrough and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{HarkError, Result};

/// Input block size for clip conversion.
const CLIP_CHUNK: usize = 1024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Partial input carried between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Output samples per input sample.
    ratio: f64,
    /// `[1][output_frames_max]`
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `HarkError::Device` if rubato rejects the ratio or chunk size.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                ratio: 1.0,
                output_buf: Vec::new(),
            });
        }
        if from_rate == 0 || to_rate == 0 {
            return Err(HarkError::Device(format!(
                "cannot resample {from_rate} Hz to {to_rate} Hz"
            )));
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| HarkError::Device(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(from_rate, to_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            ratio,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Convert `samples`, returning whatever full chunks are ready.
    ///
    /// A remainder shorter than `chunk_size` is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Zero-pad and convert any buffered remainder.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            self.input_buf.clear();
            return Vec::new();
        }
        let pending = self.input_buf.len();
        let pad = vec![0f32; self.chunk_size - pending];
        let out = self.process(&pad);
        // Trim the output produced by padding.
        let keep = ((pending as f64) * self.ratio).round() as usize;
        out.into_iter().take(keep).collect()
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert a whole clip in one go.
pub fn resample_clip(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let mut rc = RateConverter::new(from_rate, to_rate, CLIP_CHUNK)?;
    let mut out = rc.process(samples);
    out.extend(rc.flush());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).expect("converter");
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_chunks_accumulate() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn clip_conversion_covers_the_tail() {
        // 1.5 chunks of 24 kHz audio up to 48 kHz
        let clip = vec![0.1f32; 1536];
        let out = resample_clip(&clip, 24_000, 48_000).expect("resample");
        assert!(
            (out.len() as isize - 3072).unsigned_abs() <= 16,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 16_000, 960).is_err());
    }
}
