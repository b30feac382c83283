//! Playback of inbound synthesized audio and the barge-in contract.
//!
//! The controller lives on the client event loop. On `clear_buffer` it
//! flushes the sink synchronously, before the loop handles anything else,
//! so nothing queued ahead of the barge-in is heard afterwards.

use bytes::Bytes;

use crate::error::DeviceError;

/// The playback device as seen from the event loop.
pub trait PlaybackSink: Send {
    /// Queue a chunk. Must not block.
    fn enqueue(&mut self, chunk: Bytes) -> Result<(), DeviceError>;

    /// Discard every queued chunk and cut whatever is currently playing.
    /// After this returns, `queued()` is 0.
    fn flush(&mut self);

    /// Chunks accepted but not yet handed to the hardware.
    fn queued(&self) -> usize;

    /// Release the device. Further `enqueue` calls fail.
    fn stop(&mut self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub flushes: u64,
}

pub struct PlaybackController {
    sink: Option<Box<dyn PlaybackSink>>,
    stats: PlaybackStats,
}

impl PlaybackController {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            sink: Some(sink),
            stats: PlaybackStats::default(),
        }
    }

    /// Hand an inbound chunk to the device. Chunks are dropped, never held
    /// here, when the device is gone or its backlog is full.
    pub fn on_audio(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            self.stats.dropped += 1;
            log::debug!("No playback device, dropping {} bytes", chunk.len());
            return;
        };

        match sink.enqueue(chunk) {
            Ok(()) => self.stats.enqueued += 1,
            Err(DeviceError::PlaybackBacklog { capacity }) => {
                self.stats.dropped += 1;
                log::warn!("Playback backlog full ({} chunks), dropping chunk", capacity);
            }
            Err(e) => {
                self.stats.dropped += 1;
                log::error!("Playback device unavailable: {}. Dropping further audio", e);
                if let Some(mut sink) = self.sink.take() {
                    sink.stop();
                }
            }
        }
    }

    /// Barge-in: stop all buffered and in-flight audio now.
    pub fn barge_in(&mut self) {
        self.stats.flushes += 1;
        if let Some(sink) = self.sink.as_mut() {
            let discarded = sink.queued();
            sink.flush();
            log::info!("Barge-in: discarded {} queued chunks", discarded);
        }
    }

    pub fn queued(&self) -> usize {
        self.sink.as_ref().map(|s| s.queued()).unwrap_or(0)
    }

    pub fn is_available(&self) -> bool {
        self.sink.is_some()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Flush and release the device.
    pub fn stop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.flush();
            sink.stop();
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Shared {
        queue: VecDeque<Bytes>,
        stopped: bool,
        fail: bool,
    }

    struct TestSink {
        shared: Arc<Mutex<Shared>>,
        capacity: usize,
    }

    impl PlaybackSink for TestSink {
        fn enqueue(&mut self, chunk: Bytes) -> Result<(), DeviceError> {
            let mut s = self.shared.lock().unwrap();
            if s.fail || s.stopped {
                return Err(DeviceError::PlaybackStopped);
            }
            if s.queue.len() >= self.capacity {
                return Err(DeviceError::PlaybackBacklog {
                    capacity: self.capacity,
                });
            }
            s.queue.push_back(chunk);
            Ok(())
        }

        fn flush(&mut self) {
            self.shared.lock().unwrap().queue.clear();
        }

        fn queued(&self) -> usize {
            self.shared.lock().unwrap().queue.len()
        }

        fn stop(&mut self) {
            self.shared.lock().unwrap().stopped = true;
        }
    }

    fn controller(capacity: usize) -> (PlaybackController, Arc<Mutex<Shared>>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let sink = TestSink {
            shared: shared.clone(),
            capacity,
        };
        (PlaybackController::new(Box::new(sink)), shared)
    }

    #[test]
    fn test_barge_in_empties_queue_immediately() {
        let (mut pc, _shared) = controller(16);
        for _ in 0..5 {
            pc.on_audio(Bytes::from_static(&[0, 1, 2, 3]));
        }
        assert_eq!(pc.queued(), 5);

        pc.barge_in();
        assert_eq!(pc.queued(), 0);
        assert_eq!(pc.stats().flushes, 1);

        // audio arriving after the barge-in plays normally
        pc.on_audio(Bytes::from_static(&[9, 9]));
        assert_eq!(pc.queued(), 1);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let (mut pc, _shared) = controller(3);
        for _ in 0..10 {
            pc.on_audio(Bytes::from_static(&[1, 0]));
        }
        assert_eq!(pc.queued(), 3);
        assert_eq!(pc.stats().enqueued, 3);
        assert_eq!(pc.stats().dropped, 7);
        assert!(pc.is_available());
    }

    #[test]
    fn test_unavailable_device_drops_everything() {
        let (mut pc, shared) = controller(8);
        shared.lock().unwrap().fail = true;

        pc.on_audio(Bytes::from_static(&[1, 0]));
        assert!(!pc.is_available());
        assert!(shared.lock().unwrap().stopped);

        pc.on_audio(Bytes::from_static(&[1, 0]));
        assert_eq!(pc.stats().dropped, 2);
        assert_eq!(pc.queued(), 0);
        pc.barge_in();
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let (mut pc, _shared) = controller(8);
        pc.on_audio(Bytes::new());
        assert_eq!(pc.stats(), PlaybackStats::default());
    }

    #[test]
    fn test_stop_releases_device() {
        let (mut pc, shared) = controller(8);
        pc.on_audio(Bytes::from_static(&[1, 0]));
        pc.stop();
        let s = shared.lock().unwrap();
        assert!(s.stopped);
        assert!(s.queue.is_empty());
    }
}
