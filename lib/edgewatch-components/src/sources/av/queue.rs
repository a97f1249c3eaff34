use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use metrics::Counter;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::timeout,
};

/// Result of offering a frame to the queue.
#[derive(Debug, Eq, PartialEq)]
pub enum Offer {
    /// The frame was queued.
    Queued,

    /// The queue was full; the frame was dropped.
    Dropped,

    /// The consumer is gone.
    Closed,
}

/// Result of waiting for a frame.
#[derive(Debug, Eq, PartialEq)]
pub enum Received {
    /// A frame.
    Frame(Bytes),

    /// Nothing arrived in time.
    Timeout,

    /// The producer is gone and the queue is empty.
    Closed,
}

/// Creates a bounded frame queue.
///
/// The producing side never waits: when the queue is full, the newest frame is dropped and counted. `dropped` is shared
/// across queues so the total survives worker restarts.
pub fn sample_queue(capacity: usize, dropped: Arc<AtomicU64>, dropped_total: Counter) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FrameSender {
            tx,
            dropped,
            dropped_total,
        },
        FrameReceiver { rx },
    )
}

/// Producing half of the frame queue.
pub struct FrameSender {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
    dropped_total: Counter,
}

impl FrameSender {
    /// Offers a frame without waiting.
    pub fn offer(&self, frame: Bytes) -> Offer {
        match self.tx.try_send(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.increment(1);
                Offer::Dropped
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}

/// Consuming half of the frame queue.
pub struct FrameReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl FrameReceiver {
    /// Waits up to `wait` for the next frame.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Received {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(frame)) => Received::Frame(frame),
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }

    /// Discards every queued frame, returning how many there were.
    ///
    /// Frees room for a producer that is still writing, so it never stalls on a full queue.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Stops accepting frames. Frames already queued can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
