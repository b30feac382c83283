//! Device provider used by the client, and the ALSA implementation.
//!
//! Capture and playback each run in their own OS thread. The event loop only
//! talks to them through channels and a few atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::alsa_device;
use super::capture::{AlsaCapture, CaptureStream};
use super::playback::PlaybackSink;
use super::stream_decoder::{StreamDecoder, create_decoder};
use super::transport::FrameSender;
use crate::config::AudioConfig;
use crate::error::DeviceError;

/// Opens the capture and playback devices for a client.
///
/// Called once per `connect()`; reconnection attempts keep the devices
/// that are already open.
pub trait AudioDevices: Send {
    fn open_capture(&mut self, frames: FrameSender) -> Result<Box<dyn CaptureStream>, DeviceError>;
    fn open_playback(&mut self) -> Result<Box<dyn PlaybackSink>, DeviceError>;
}

pub struct AlsaAudioSystem {
    config: AudioConfig,
}

impl AlsaAudioSystem {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

fn period(frames: usize) -> Option<usize> {
    (frames > 0).then_some(frames)
}

impl AudioDevices for AlsaAudioSystem {
    fn open_capture(&mut self, frames: FrameSender) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let capture = AlsaCapture::start(
            &self.config.capture_device,
            self.config.capture_sample_rate,
            period(self.config.capture_period_frames),
            frames,
        )?;
        Ok(Box::new(capture))
    }

    fn open_playback(&mut self) -> Result<Box<dyn PlaybackSink>, DeviceError> {
        Ok(Box::new(AlsaPlayback::start(&self.config)?))
    }
}

// ======================== Playback ========================

/// The device end of the playback thread.
pub(crate) trait PcmOut: Send + 'static {
    /// Write interleaved samples, returns frames written.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;
    /// Discard whatever the device still holds and get ready for new data.
    fn cut(&mut self) -> Result<()>;
    /// Recover after an xrun or a failed write.
    fn recover(&mut self) -> Result<()>;
}

struct AlsaOut {
    pcm: PCM,
}

impl PcmOut for AlsaOut {
    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        Ok(self.pcm.io_i16()?.writei(samples)?)
    }

    fn cut(&mut self) -> Result<()> {
        if let Err(e) = self.pcm.drop() {
            log::warn!("Failed to drop PCM playback: {}", e);
        }
        self.pcm.prepare()?;
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare()?;
        Ok(())
    }
}

enum PlayCmd {
    Chunk { epoch: u64, data: Bytes },
    /// Wakes a parked thread so a flush reaches the device right away
    Flush,
}

struct PlaybackShared {
    /// Bumped on every flush; chunks tagged with an older epoch are stale
    epoch: AtomicU64,
    queued: AtomicUsize,
    alive: AtomicBool,
}

/// ALSA playback sink.
///
/// Chunks are tagged with the current epoch when queued. `flush()` bumps the
/// epoch and wakes the playback thread, which drops what the hardware still
/// holds, whether it is idle or halfway through a chunk. Stale chunks it
/// dequeues later are discarded. The device buffer is capped at a few
/// periods, so audible output stops within one period.
pub struct AlsaPlayback {
    tx: Option<mpsc::Sender<PlayCmd>>,
    shared: Arc<PlaybackShared>,
    capacity: usize,
    handle: Option<JoinHandle<()>>,
}

impl AlsaPlayback {
    pub fn start(config: &AudioConfig) -> Result<Self, DeviceError> {
        let unavailable = |reason: String| DeviceError::PlaybackUnavailable {
            device: config.playback_device.clone(),
            reason,
        };

        let (pcm, params) = alsa_device::open_playback(
            &config.playback_device,
            config.playback_sample_rate,
            config.playback_channels,
            period(config.playback_period_frames),
        )?;
        let decoder =
            create_decoder(&config.stream_format, params.channels).map_err(|e| unavailable(e.to_string()))?;

        log::info!(
            "Playback started: rate={}, ch={}, period={}, buffer={}",
            params.sample_rate,
            params.channels,
            params.period_size,
            params.buffer_size,
        );

        Self::spawn(
            AlsaOut { pcm },
            params.channels.max(1) as usize,
            params.period_size,
            decoder,
            config.playback_queue_capacity,
        )
        .map_err(|e| unavailable(e.to_string()))
    }

    pub(crate) fn spawn<O: PcmOut>(
        out: O,
        channels: usize,
        period_size: usize,
        decoder: Box<dyn StreamDecoder>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(PlaybackShared {
            epoch: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new().name("audio-play".into()).spawn(move || {
                let period_samples = period_size.max(1) * channels;
                if let Err(e) = play_thread(out, channels, period_samples, decoder, rx, &shared) {
                    log::error!("Playback thread error: {}", e);
                }
                shared.alive.store(false, Ordering::SeqCst);
            })?
        };

        Ok(Self {
            tx: Some(tx),
            shared,
            capacity,
            handle: Some(handle),
        })
    }
}

impl PlaybackSink for AlsaPlayback {
    fn enqueue(&mut self, chunk: Bytes) -> Result<(), DeviceError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(DeviceError::PlaybackStopped);
        };
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(DeviceError::PlaybackStopped);
        }

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(PlayCmd::Chunk { epoch, data: chunk }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                decrement(&self.shared.queued);
                Err(DeviceError::PlaybackBacklog {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                decrement(&self.shared.queued);
                Err(DeviceError::PlaybackStopped)
            }
        }
    }

    fn flush(&mut self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.queued.store(0, Ordering::SeqCst);
        if let Some(tx) = self.tx.as_ref() {
            // A full queue holds stale chunks, which wake the thread just the same
            let _ = tx.try_send(PlayCmd::Flush);
        }
    }

    fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.flush();
        // Dropping the sender ends the thread's blocking_recv
        self.tx = None;
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
}

fn play_thread<O: PcmOut>(
    mut out: O,
    channels: usize,
    period_samples: usize,
    mut decoder: Box<dyn StreamDecoder>,
    mut rx: mpsc::Receiver<PlayCmd>,
    shared: &PlaybackShared,
) -> Result<()> {
    let mut played_epoch = shared.epoch.load(Ordering::SeqCst);

    // Block until we receive an audio chunk, a flush, or the sender is dropped
    while let Some(cmd) = rx.blocking_recv() {
        let current = shared.epoch.load(Ordering::SeqCst);
        if current != played_epoch {
            // flushed since the last write: silence what the device still holds
            decoder.reset();
            out.cut()?;
            played_epoch = current;
        }

        let (epoch, chunk) = match cmd {
            PlayCmd::Chunk { epoch, data } => (epoch, data),
            PlayCmd::Flush => continue,
        };
        if epoch != current {
            // queued before the last flush
            continue;
        }
        decrement(&shared.queued);

        let pcm_data = match decoder.decode(&chunk) {
            Ok(d) if d.is_empty() => continue,
            Ok(d) => d,
            Err(e) => {
                log::error!("Audio decode error: {}", e);
                continue;
            }
        };

        // Write one period at a time so a flush is noticed between periods
        let mut retry_count = 0u32;
        let mut offset = 0;
        while offset < pcm_data.len() {
            let now = shared.epoch.load(Ordering::SeqCst);
            if now != epoch {
                decoder.reset();
                out.cut()?;
                played_epoch = now;
                break;
            }

            let end = (offset + period_samples).min(pcm_data.len());
            match out.write(&pcm_data[offset..end]) {
                Ok(n) => {
                    offset += n * channels;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    // A failing prepare means the device is gone: end the thread
                    out.recover()?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten samples",
                            retry_count,
                            pcm_data.len() - offset
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::audio::stream_decoder::PcmDecoder;

    /// Records what the playback thread did to the device. Writes complete
    /// immediately, like a ring buffer with room to spare.
    #[derive(Clone, Default)]
    struct RecordingOut(Arc<Mutex<Vec<&'static str>>>);

    impl RecordingOut {
        fn count(&self, op: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|o| **o == op).count()
        }
    }

    impl PcmOut for RecordingOut {
        fn write(&mut self, samples: &[i16]) -> Result<usize> {
            self.0.lock().unwrap().push("write");
            Ok(samples.len())
        }

        fn cut(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("cut");
            Ok(())
        }

        fn recover(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("recover");
            Ok(())
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn playback(out: &RecordingOut) -> AlsaPlayback {
        AlsaPlayback::spawn(out.clone(), 1, 160, Box::new(PcmDecoder::new(1)), 8).unwrap()
    }

    fn chunk() -> Bytes {
        // one 160-frame period of mono s16
        Bytes::from(vec![0u8; 320])
    }

    #[test]
    fn test_flush_cuts_idle_device() {
        let out = RecordingOut::default();
        let mut sink = playback(&out);

        for _ in 0..3 {
            sink.enqueue(chunk()).unwrap();
        }
        // everything handed to the device, the thread is parked again
        wait_until("writes", || out.count("write") == 3);
        assert_eq!(out.count("cut"), 0);

        sink.flush();
        assert_eq!(sink.queued(), 0);
        wait_until("cut", || out.count("cut") == 1);
        sink.stop();
    }

    #[test]
    fn test_audio_after_flush_plays() {
        let out = RecordingOut::default();
        let mut sink = playback(&out);

        sink.enqueue(chunk()).unwrap();
        wait_until("first write", || out.count("write") == 1);
        sink.flush();
        wait_until("cut", || out.count("cut") == 1);

        sink.enqueue(chunk()).unwrap();
        wait_until("second write", || out.count("write") == 2);
        assert_eq!(out.count("cut"), 1);
        sink.stop();
    }

    #[test]
    fn test_backlog_full_is_reported() {
        let out = RecordingOut::default();
        let mut sink = playback(&out);
        // stop the thread from draining by holding the recorder lock
        let guard = out.0.lock().unwrap();
        sink.enqueue(chunk()).unwrap();

        let mut result = Ok(());
        for _ in 0..16 {
            result = sink.enqueue(chunk());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(DeviceError::PlaybackBacklog { capacity: 8 })));
        drop(guard);
        sink.stop();
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let out = RecordingOut::default();
        let mut sink = playback(&out);
        sink.stop();
        assert!(matches!(sink.enqueue(chunk()), Err(DeviceError::PlaybackStopped)));
        assert_eq!(sink.queued(), 0);
    }
}
