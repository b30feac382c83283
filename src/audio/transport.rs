//! Frame handoff between the real-time capture thread and the event loop.
//!
//! The producer never blocks: if the event loop falls behind and the bounded
//! queue is full, the newest frame is dropped and counted. Frames that do go
//! through keep capture order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::frame::AudioFrame;

/// Outcome of a non-blocking handoff to a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Queued,
    /// Queue full, item discarded.
    Dropped,
    /// Receiver gone, the producer should stop.
    Closed,
}

#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameSender {
            tx,
            dropped: dropped.clone(),
        },
        FrameReceiver { rx, dropped },
    )
}

impl FrameSender {
    /// Move `frame` into the transport. Callable from any thread, never blocks.
    pub fn send(&self, frame: AudioFrame) -> Handoff {
        match self.tx.try_send(frame) {
            Ok(()) => Handoff::Queued,
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // 每50帧（约5秒）打印一次，避免刷屏
                if n == 1 || n % 50 == 0 {
                    log::warn!("Frame transport full, {} frames dropped so far", n);
                }
                Handoff::Dropped
            }
            Err(TrySendError::Closed(_)) => Handoff::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
