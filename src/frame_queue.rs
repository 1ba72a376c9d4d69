//! Bounded frame hand-off between the capture producers and the consumer

use std::time::Duration;

use ambilume_transport::Frame;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Frames buffered before producers start dropping
pub const DEFAULT_CAPACITY: usize = 100;

/// Multi-producer, single-consumer FIFO
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue without blocking. A full queue drops `frame` and returns
    /// `false`.
    pub fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Block until a frame is available.
    pub fn take(&self) -> Frame {
        loop {
            if let Some(frame) = self.take_timeout(Duration::from_secs(1)) {
                return frame;
            }
        }
    }

    /// Wait at most `timeout` for a frame.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Discard everything queued, returning how many frames were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
