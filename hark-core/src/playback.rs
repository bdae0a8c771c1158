//! Reply and cue playback.
//!
//! Playback is synchronous for the controller and independent of capture.
//! Byte clips are staged to a scoped temp file that is removed when the
//! call returns, whether playback succeeded or not.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::audio::resample::resample_clip;
use crate::audio::{DeviceRef, OutputBackend};
use crate::config::CueSounds;
use crate::error::{HarkError, Result};

/// Audio to play.
#[derive(Debug, Clone)]
pub enum Clip {
    /// WAV file contents.
    Bytes(Vec<u8>),
    /// Path to a WAV file.
    Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Activation,
    Ready,
    Sleep,
    Error,
}

impl Cue {
    fn path(self, cues: &CueSounds) -> Option<&Path> {
        match self {
            Cue::Activation => cues.activation.as_deref(),
            Cue::Ready => cues.ready.as_deref(),
            Cue::Sleep => cues.sleep.as_deref(),
            Cue::Error => cues.error.as_deref(),
        }
    }
}

pub struct AudioSink {
    backend: Arc<dyn OutputBackend>,
    candidates: Vec<DeviceRef>,
    attempts: u32,
    cues: CueSounds,
}

impl AudioSink {
    pub fn new(
        backend: Arc<dyn OutputBackend>,
        candidates: Vec<DeviceRef>,
        attempts: u32,
        cues: CueSounds,
    ) -> Self {
        let candidates = if candidates.is_empty() {
            vec![DeviceRef::Default]
        } else {
            candidates
        };
        Self {
            backend,
            candidates,
            attempts: attempts.max(1),
            cues,
        }
    }

    /// Play `clip` to completion.
    ///
    /// Device failures move on to the next candidate until the attempt
    /// budget is spent.
    ///
    /// # Errors
    /// `HarkError::Playback` when the clip cannot be decoded or every
    /// attempt failed.
    pub fn play(&self, clip: Clip) -> Result<()> {
        match clip {
            Clip::Path(path) => self.play_path(&path),
            Clip::Bytes(bytes) => {
                let staged = stage_clip(&bytes)?;
                let result = self.play_path(staged.path());
                // Dropping the handle removes the file.
                drop(staged);
                result
            }
        }
    }

    /// Play a configured cue. A missing or broken cue is logged and skipped.
    pub fn play_cue(&self, cue: Cue) {
        let Some(path) = cue.path(&self.cues) else {
            return;
        };
        if !path.exists() {
            warn!(?cue, path = %path.display(), "cue sound missing, skipped");
            return;
        }
        if let Err(e) = self.play(Clip::Path(path.to_path_buf())) {
            warn!(?cue, "cue playback failed: {e}");
        }
    }

    fn play_path(&self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .map_err(|e| HarkError::Playback(format!("cannot open {}: {e}", path.display())))?;
        let (samples, rate) = decode_wav(BufReader::new(file))?;

        let mut last_error = None;
        for attempt in 0..self.attempts as usize {
            let device = &self.candidates[attempt % self.candidates.len()];
            match self.play_on(device, &samples, rate) {
                Ok(()) => {
                    debug!(device = %device, attempt, "playback finished");
                    return Ok(());
                }
                Err(e) => {
                    warn!(device = %device, attempt, "playback failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(HarkError::Playback(format!(
            "all {} attempts failed, last error: {}",
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn play_on(&self, device: &DeviceRef, samples: &[f32], rate: u32) -> Result<()> {
        let out_rate = self.backend.output_rate(device)?;
        let converted = resample_clip(samples, rate, out_rate)?;
        self.backend.play(device, &converted, out_rate)
    }
}

/// Write `bytes` to a fresh temp file that is deleted on drop.
pub fn stage_clip(bytes: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix("hark-reply-")
        .suffix(".wav")
        .tempfile()?;
    staged.write_all(bytes)?;
    staged.flush()?;
    Ok(staged)
}

/// Decode a PCM or float WAV into mono f32 and its sample rate.
pub fn decode_wav<R: Read>(reader: R) -> Result<(Vec<f32>, u32)> {
    let reader =
        hound::WavReader::new(reader).map_err(|e| HarkError::Playback(format!("bad WAV: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| HarkError::Playback(format!("bad WAV data: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| HarkError::Playback(format!("bad WAV data: {e}")))?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|f| f.iter().sum::<f32>() / f.len() as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use parking_lot::Mutex;

    fn wav_bytes(samples: &[i16], rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut w = hound::WavWriter::new(&mut cursor, spec).expect("writer");
            for &s in samples {
                w.write_sample(s).expect("sample");
            }
            w.finalize().expect("finalize");
        }
        cursor.into_inner()
    }

    /// Fails on the listed devices, records what it played.
    #[derive(Default)]
    struct FlakyOutput {
        failing: Vec<DeviceRef>,
        played: Mutex<Vec<(DeviceRef, usize)>>,
        attempts: Mutex<usize>,
    }

    impl OutputBackend for FlakyOutput {
        fn output_rate(&self, _device: &DeviceRef) -> Result<u32> {
            Ok(16_000)
        }

        fn play(&self, device: &DeviceRef, samples: &[f32], _rate: u32) -> Result<()> {
            *self.attempts.lock() += 1;
            if self.failing.contains(device) {
                return Err(HarkError::Device(format!("{device} busy")));
            }
            self.played.lock().push((device.clone(), samples.len()));
            Ok(())
        }
    }

    #[test]
    fn decodes_stereo_to_mono() {
        let bytes = wav_bytes(&[16_384, 0, -16_384, 0], 22_050, 2);
        let (samples, rate) = decode_wav(std::io::Cursor::new(bytes)).expect("decode");
        assert_eq!(rate, 22_050);
        assert_eq!(samples.len(), 2);
        assert_relative_eq!(samples[0], 0.25, epsilon = 1e-4);
        assert_relative_eq!(samples[1], -0.25, epsilon = 1e-4);
    }

    #[test]
    fn rejects_non_wav_bytes() {
        let err = decode_wav(std::io::Cursor::new(b"ID3 not a wav".to_vec()))
            .err()
            .expect("decode fails");
        assert!(matches!(err, HarkError::Playback(_)));
    }

    #[test]
    fn falls_back_to_next_output_device() {
        let backend = Arc::new(FlakyOutput {
            failing: vec![DeviceRef::Name("HDMI".into())],
            ..Default::default()
        });
        let sink = AudioSink::new(
            backend.clone(),
            vec![DeviceRef::Name("HDMI".into()), DeviceRef::Default],
            2,
            CueSounds::default(),
        );
        sink.play(Clip::Bytes(wav_bytes(&[100; 1600], 16_000, 1)))
            .expect("second device plays");
        assert_eq!(*backend.attempts.lock(), 2);
        assert_eq!(backend.played.lock().as_slice(), &[(DeviceRef::Default, 1600)]);
    }

    #[test]
    fn exhausting_attempts_is_a_playback_error() {
        let backend = Arc::new(FlakyOutput {
            failing: vec![DeviceRef::Default],
            ..Default::default()
        });
        let sink = AudioSink::new(backend.clone(), vec![DeviceRef::Default], 3, CueSounds::default());
        let err = sink
            .play(Clip::Bytes(wav_bytes(&[1; 160], 16_000, 1)))
            .err()
            .expect("playback fails");
        assert!(matches!(err, HarkError::Playback(_)));
        assert_eq!(*backend.attempts.lock(), 3);
    }

    #[test]
    fn staged_clip_is_removed_on_drop() {
        let staged = stage_clip(&wav_bytes(&[0; 16], 16_000, 1)).expect("stage");
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        drop(staged);
        assert!(!path.exists());
    }

    #[test]
    fn missing_cue_is_skipped() {
        let backend = Arc::new(FlakyOutput::default());
        let cues = CueSounds {
            ready: Some(PathBuf::from("/nonexistent/hark/ready.wav")),
            ..Default::default()
        };
        let sink = AudioSink::new(backend.clone(), Vec::new(), 1, cues);
        sink.play_cue(Cue::Ready);
        sink.play_cue(Cue::Sleep);
        assert_eq!(*backend.attempts.lock(), 0);
    }
}
