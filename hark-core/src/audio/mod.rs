//! Audio capture and output backends.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not allocate after warm-up, block on a lock or perform I/O. It
//! only writes mono f32 into an SPSC ring producer.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms. [`AudioSource`] therefore
//! opens the stream *inside* its capture thread and drops it there on every
//! exit path. A sync oneshot reports the open result back to `start()`.
//!
//! ```text
//! device callback ─push_slice─► ring ─► capture thread ─► resample ─► Framer ─► frame queue
//! ```

pub mod device;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffering::{
    create_audio_ring, frame_channel, AudioConsumer, AudioProducer, Consumer, Frame,
    FrameReceiver, FrameSender,
};
use crate::config::AudioConfig;
use crate::error::{HarkError, Result};

pub use device::{DeviceDescriptor, DeviceRef};
use resample::RateConverter;

/// Samples drained from the ring per iteration. 20 ms at 48 kHz.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty.
const SLEEP_EMPTY: Duration = Duration::from_millis(4);

/// How long `start()` waits for the device to open.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Last runtime error reported by a stream callback.
#[derive(Debug, Clone, Default)]
pub struct FaultSlot(Arc<Mutex<Option<String>>>);

impl FaultSlot {
    pub fn report(&self, message: impl Into<String>) {
        *self.0.lock() = Some(message.into());
    }

    pub fn take(&self) -> Option<String> {
        self.0.lock().take()
    }
}

/// A live input stream. Dropping it releases the device.
pub trait InputStream {
    /// Native sample rate the stream delivers.
    fn sample_rate(&self) -> u32;
}

/// Opens input devices. Called on the capture thread.
pub trait InputBackend: Send + Sync + 'static {
    /// Open `device` and start pushing mono f32 in [-1, 1] into `producer`.
    ///
    /// Runtime errors after a successful open go to `fault`.
    fn open(
        &self,
        device: &DeviceRef,
        producer: AudioProducer,
        fault: FaultSlot,
    ) -> Result<Box<dyn InputStream>>;
}

/// Plays PCM on an output device.
pub trait OutputBackend: Send + Sync + 'static {
    /// Native rate of `device`; clips are resampled to it before `play`.
    fn output_rate(&self, device: &DeviceRef) -> Result<u32>;

    /// Play mono f32 `samples` at `sample_rate` and block until done.
    fn play(&self, device: &DeviceRef, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// Reshapes a stream of f32 samples into fixed-size i16 [`Frame`]s.
pub struct Framer {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_seq: u64,
}

impl Framer {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            next_seq: 0,
        }
    }

    /// Append samples and return every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Frame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let frame = Frame::from_f32(
                self.next_seq,
                &self.pending[..self.frame_size],
                self.sample_rate,
            );
            self.next_seq += 1;
            self.pending.drain(..self.frame_size);
            frames.push(frame);
        }
        frames
    }
}

/// Continuous capture into a bounded frame queue.
///
/// Knows nothing about the session. `start()` hands back the receiving end
/// of the queue; `stop()` ends capture and releases the device.
pub struct AudioSource {
    backend: Arc<dyn InputBackend>,
    audio: AudioConfig,
    running: Arc<AtomicBool>,
    fault: FaultSlot,
    handle: Option<JoinHandle<()>>,
}

impl AudioSource {
    pub fn new(backend: Arc<dyn InputBackend>, audio: AudioConfig) -> Self {
        Self {
            backend,
            audio,
            running: Arc::new(AtomicBool::new(false)),
            fault: FaultSlot::default(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open `device` on a new capture thread.
    ///
    /// Blocks until the device is confirmed open or fails.
    ///
    /// # Errors
    /// - `HarkError::AlreadyRunning` if capture is active.
    /// - `HarkError::Device` / `HarkError::NoInputDevice` if the open fails.
    pub fn start(&mut self, device: &DeviceRef) -> Result<FrameReceiver> {
        if self.is_running() {
            return Err(HarkError::AlreadyRunning);
        }
        self.join_finished();
        let _ = self.fault.take();

        let (producer, consumer) = create_audio_ring();
        let (frame_tx, frame_rx) = frame_channel(self.audio.queue_capacity);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        self.running.store(true, Ordering::SeqCst);
        let backend = Arc::clone(&self.backend);
        let running = Arc::clone(&self.running);
        let fault = self.fault.clone();
        let audio = self.audio.clone();
        let device = device.clone();

        let spawned = thread::Builder::new()
            .name("hark-capture".into())
            .spawn(move || {
                // Opened here: the stream must be dropped on this thread.
                let stream = match backend.open(&device, producer, fault) {
                    Ok(stream) => stream,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let native_rate = stream.sample_rate();
                // A stream we cannot convert is an open failure, not a
                // silent capture thread exit.
                let resampler =
                    match RateConverter::new(native_rate, audio.sample_rate, DRAIN_CHUNK) {
                        Ok(r) => r,
                        Err(e) => {
                            drop(stream);
                            running.store(false, Ordering::SeqCst);
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = open_tx.send(Ok(native_rate));

                capture_loop(consumer, frame_tx, resampler, &audio, &running);

                drop(stream);
                running.store(false, Ordering::SeqCst);
                debug!(device = %device, "input device released");
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(HarkError::Io(e));
            }
        };
        self.handle = Some(handle);

        match open_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(rate)) => {
                info!(native_rate = rate, "capture started");
                Ok(frame_rx)
            }
            Ok(Err(e)) => {
                self.join_finished();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(HarkError::Device("input device did not open in time".into()))
            }
        }
    }

    /// Stop capture and wait for the device to be released.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.join_finished();
    }

    /// Runtime stream error reported since the last call, if any.
    pub fn take_fault(&self) -> Option<HarkError> {
        self.fault.take().map(HarkError::Device)
    }

    fn join_finished(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut consumer: AudioConsumer,
    frames: FrameSender,
    mut resampler: RateConverter,
    audio: &AudioConfig,
    running: &AtomicBool,
) {
    let mut framer = Framer::new(audio.frame_size, audio.sample_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];

    while running.load(Ordering::Relaxed) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(SLEEP_EMPTY);
            continue;
        }

        let converted = resampler.process(&raw[..n]);
        for frame in framer.push(&converted) {
            if !frames.push(frame) {
                debug!("frame receiver dropped, capture loop exiting");
                return;
            }
        }
    }
}

// ── cpal backends ───────────────────────────────────────────────────────────

/// Microphone input through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

/// Speaker output through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

#[cfg(feature = "audio-cpal")]
mod cpal_io {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
    use ringbuf::traits::{Consumer as _, Producer as _, Split};
    use ringbuf::HeapRb;
    use tracing::{debug, info, warn};

    use super::device::cpal_backend::{resolve, Direction};
    use super::*;

    struct CpalStream {
        _stream: Stream,
        sample_rate: u32,
    }

    impl InputStream for CpalStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
    }

    fn build_mono_input<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
        fault: FaultSlot,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = config.channels as usize;
        let mut mix: Vec<f32> = Vec::new();
        device.build_input_stream(
            config,
            move |data: &[T], _info| {
                let frames = data.len() / ch.max(1);
                mix.resize(frames, 0.0);
                for (f, slot) in mix.iter_mut().enumerate() {
                    let base = f * ch;
                    let mut sum = 0f32;
                    for c in 0..ch {
                        sum += data[base + c].to_sample::<f32>();
                    }
                    *slot = sum / ch as f32;
                }
                let written = producer.push_slice(&mix);
                if written < mix.len() {
                    warn!("capture ring full: dropped {} samples", mix.len() - written);
                }
            },
            move |err| fault.report(format!("input stream error: {err}")),
            None,
        )
    }

    impl InputBackend for CpalInput {
        fn open(
            &self,
            device: &DeviceRef,
            producer: AudioProducer,
            fault: FaultSlot,
        ) -> Result<Box<dyn InputStream>> {
            let dev = resolve(device, Direction::Input)?;
            let name = dev.name().unwrap_or_default();
            info!(device = name.as_str(), "opening input device");

            let supported = dev
                .default_input_config()
                .map_err(|e| HarkError::Device(e.to_string()))?;
            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels();
            info!(sample_rate, channels, "input config selected");

            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_mono_input::<f32>(&dev, &config, producer, fault),
                SampleFormat::I16 => build_mono_input::<i16>(&dev, &config, producer, fault),
                SampleFormat::U16 => build_mono_input::<u16>(&dev, &config, producer, fault),
                SampleFormat::I32 => build_mono_input::<i32>(&dev, &config, producer, fault),
                SampleFormat::U8 => build_mono_input::<u8>(&dev, &config, producer, fault),
                fmt => {
                    return Err(HarkError::Device(format!(
                        "unsupported sample format: {fmt:?}"
                    )))
                }
            }
            .map_err(|e| HarkError::Device(e.to_string()))?;

            stream
                .play()
                .map_err(|e| HarkError::Device(e.to_string()))?;

            Ok(Box::new(CpalStream {
                _stream: stream,
                sample_rate,
            }))
        }
    }

    /// Writes each mono sample to every channel of one interleaved frame,
    /// padding with silence. Returns true once `next` has run dry.
    fn fill_interleaved<T>(
        data: &mut [T],
        channels: usize,
        mut next: impl FnMut() -> Option<f32>,
    ) -> bool
    where
        T: SizedSample + FromSample<f32>,
    {
        let mut drained = false;
        for frame in data.chunks_mut(channels.max(1)) {
            let sample = next().unwrap_or_else(|| {
                drained = true;
                0.0
            });
            frame.fill(T::from_sample(sample));
        }
        drained
    }

    /// Mono f32 from `consumer`, duplicated across channels and converted to
    /// the device's sample type. Sets `finished` once the ring runs dry.
    fn build_output<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: ringbuf::HeapCons<f32>,
        finished: &Arc<AtomicBool>,
        fault: &FaultSlot,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels as usize;
        let finished = Arc::clone(finished);
        let fault = fault.clone();
        device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if fill_interleaved(data, channels, || consumer.try_pop()) {
                    finished.store(true, Ordering::Release);
                }
            },
            move |err| fault.report(format!("output stream error: {err}")),
            None,
        )
    }

    impl OutputBackend for CpalOutput {
        fn output_rate(&self, device: &DeviceRef) -> Result<u32> {
            let dev = resolve(device, Direction::Output)?;
            let supported = dev
                .default_output_config()
                .map_err(|e| HarkError::Device(e.to_string()))?;
            Ok(supported.sample_rate().0)
        }

        fn play(&self, device: &DeviceRef, samples: &[f32], sample_rate: u32) -> Result<()> {
            if samples.is_empty() {
                return Ok(());
            }
            let dev = resolve(device, Direction::Output)?;
            let supported = dev
                .default_output_config()
                .map_err(|e| HarkError::Device(e.to_string()))?;
            let config = StreamConfig {
                channels: supported.channels(),
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let (mut producer, consumer) = HeapRb::<f32>::new(samples.len()).split();
            producer.push_slice(samples);

            let finished = Arc::new(AtomicBool::new(false));
            let fault = FaultSlot::default();

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&dev, &config, consumer, &finished, &fault),
                SampleFormat::I16 => build_output::<i16>(&dev, &config, consumer, &finished, &fault),
                SampleFormat::U16 => build_output::<u16>(&dev, &config, consumer, &finished, &fault),
                SampleFormat::I32 => build_output::<i32>(&dev, &config, consumer, &finished, &fault),
                SampleFormat::U8 => build_output::<u8>(&dev, &config, consumer, &finished, &fault),
                fmt => {
                    return Err(HarkError::Device(format!(
                        "unsupported output sample format: {fmt:?}"
                    )))
                }
            }
            .map_err(|e| HarkError::Device(e.to_string()))?;
            stream
                .play()
                .map_err(|e| HarkError::Device(e.to_string()))?;

            let expected = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
            let limit = expected + Duration::from_millis(500);
            let started = Instant::now();
            while !finished.load(Ordering::Acquire) {
                if let Some(msg) = fault.take() {
                    return Err(HarkError::Device(msg));
                }
                if started.elapsed() > limit {
                    warn!("playback did not report completion in time");
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            // Let the last device buffer drain.
            std::thread::sleep(Duration::from_millis(80));
            drop(stream);
            debug!(samples = samples.len(), "playback complete");
            Ok(())
        }
    }

}

#[cfg(not(feature = "audio-cpal"))]
impl InputBackend for CpalInput {
    fn open(
        &self,
        _device: &DeviceRef,
        _producer: AudioProducer,
        _fault: FaultSlot,
    ) -> Result<Box<dyn InputStream>> {
        Err(HarkError::Device("compiled without audio-cpal feature".into()))
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl OutputBackend for CpalOutput {
    fn output_rate(&self, _device: &DeviceRef) -> Result<u32> {
        Err(HarkError::Device("compiled without audio-cpal feature".into()))
    }

    fn play(&self, _device: &DeviceRef, _samples: &[f32], _sample_rate: u32) -> Result<()> {
        Err(HarkError::Device("compiled without audio-cpal feature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{FrameRecv, Producer};
    use std::time::Instant;

    #[test]
    fn framer_emits_whole_frames_in_sequence() {
        let mut framer = Framer::new(4, 16_000);
        assert!(framer.push(&[0.1, 0.2, 0.3]).is_empty());
        let frames = framer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].seq, 0);
        assert_eq!(frames[1].seq, 1);
        assert_eq!(frames[0].samples.len(), 4);
    }

    /// Pushes a fixed block of samples once the stream opens.
    struct ToneInput {
        samples: usize,
    }

    struct ToneStream;

    impl InputStream for ToneStream {
        fn sample_rate(&self) -> u32 {
            16_000
        }
    }

    impl InputBackend for ToneInput {
        fn open(
            &self,
            _device: &DeviceRef,
            mut producer: AudioProducer,
            _fault: FaultSlot,
        ) -> Result<Box<dyn InputStream>> {
            producer.push_slice(&vec![0.25f32; self.samples]);
            Ok(Box::new(ToneStream))
        }
    }

    struct BrokenInput;

    impl InputBackend for BrokenInput {
        fn open(
            &self,
            device: &DeviceRef,
            _producer: AudioProducer,
            _fault: FaultSlot,
        ) -> Result<Box<dyn InputStream>> {
            Err(HarkError::Device(format!("{device} unplugged")))
        }
    }

    #[test]
    fn source_frames_backend_audio() {
        let audio = AudioConfig::default();
        let mut source = AudioSource::new(Arc::new(ToneInput { samples: 512 * 3 }), audio);
        let rx = source.start(&DeviceRef::Default).expect("start");
        assert!(source.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seqs = Vec::new();
        while seqs.len() < 3 && Instant::now() < deadline {
            if let FrameRecv::Frame(f) = rx.recv_timeout(Duration::from_millis(20)) {
                assert_eq!(f.len(), 512);
                seqs.push(f.seq);
            }
        }
        assert_eq!(seqs, vec![0, 1, 2]);

        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn open_failure_is_reported_and_not_running() {
        let mut source = AudioSource::new(Arc::new(BrokenInput), AudioConfig::default());
        let err = source.start(&DeviceRef::Index(7)).err().expect("open fails");
        assert!(err.is_device());
        assert!(!source.is_running());
    }

    struct ZeroRateInput;

    struct ZeroRateStream;

    impl InputStream for ZeroRateStream {
        fn sample_rate(&self) -> u32 {
            0
        }
    }

    impl InputBackend for ZeroRateInput {
        fn open(
            &self,
            _device: &DeviceRef,
            _producer: AudioProducer,
            _fault: FaultSlot,
        ) -> Result<Box<dyn InputStream>> {
            Ok(Box::new(ZeroRateStream))
        }
    }

    #[test]
    fn unconvertible_stream_rate_fails_the_open() {
        let mut source = AudioSource::new(Arc::new(ZeroRateInput), AudioConfig::default());
        let err = source.start(&DeviceRef::Default).err().expect("open fails");
        assert!(err.is_device());
        assert!(!source.is_running());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut source =
            AudioSource::new(Arc::new(ToneInput { samples: 0 }), AudioConfig::default());
        let _rx = source.start(&DeviceRef::Default).expect("start");
        assert!(matches!(
            source.start(&DeviceRef::Default),
            Err(HarkError::AlreadyRunning)
        ));
    }

    #[test]
    fn faults_are_taken_once() {
        let source = AudioSource::new(Arc::new(BrokenInput), AudioConfig::default());
        source.fault.report("stream died");
        assert!(matches!(source.take_fault(), Some(HarkError::Device(_))));
        assert!(source.take_fault().is_none());
    }
}
