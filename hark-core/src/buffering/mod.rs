//! Buffers between the audio callback, the capture thread and the controller.
//!
//! Two hops:
//!
//! 1. `ringbuf::HeapRb<f32>`: wait-free `push_slice` from the real-time
//!    device callback into the capture thread.
//! 2. [`frame_channel`]: bounded queue of [`Frame`]s from the capture thread
//!    to the single consumer. When full, the oldest frame is discarded so
//!    capture never blocks.

pub mod frame;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use ringbuf::{traits::Split, HeapRb};

pub use frame::Frame;
pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the device callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^18 f32 samples, about 5.4 s at 48 kHz. The capture thread drains it
/// every few milliseconds; frames back up in the frame queue instead.
pub const RING_CAPACITY: usize = 1 << 18;

pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Create the bounded frame queue.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let dropped = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    (
        FrameSender {
            tx,
            evict: rx.clone(),
            dropped: Arc::clone(&dropped),
            closed: Arc::clone(&closed),
        },
        FrameReceiver {
            rx,
            dropped,
            closed,
        },
    )
}

/// Sending side of the frame queue. Never blocks.
pub struct FrameSender {
    tx: Sender<Frame>,
    // Used only to evict the oldest frame when the queue is full.
    evict: Receiver<Frame>,
    dropped: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl FrameSender {
    /// Enqueue `frame`, evicting the oldest queued frame if necessary.
    ///
    /// Returns `false` once the receiver is gone.
    pub fn push(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(rejected)) => {
                    if self.evict.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = rejected;
                }
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving side of the frame queue, owned by the single consumer.
pub struct FrameReceiver {
    rx: Receiver<Frame>,
    dropped: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Outcome of a timed receive.
#[derive(Debug)]
pub enum FrameRecv {
    Frame(Frame),
    Empty,
    Closed,
}

impl FrameReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> FrameRecv {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => FrameRecv::Frame(frame),
            Err(RecvTimeoutError::Timeout) => FrameRecv::Empty,
            Err(RecvTimeoutError::Disconnected) => FrameRecv::Closed,
        }
    }

    pub fn try_recv(&self) -> FrameRecv {
        match self.rx.try_recv() {
            Ok(frame) => FrameRecv::Frame(frame),
            Err(TryRecvError::Empty) => FrameRecv::Empty,
            Err(TryRecvError::Disconnected) => FrameRecv::Closed,
        }
    }

    /// Discard everything currently queued. Returns the number of frames discarded.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames evicted by the sender because the queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
