//! Microphone capture on a dedicated OS thread.
//!
//! Uses std::thread (NOT tokio tasks) so the real-time read loop never
//! waits on the async runtime. Frames leave the thread only through the
//! non-blocking frame transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;

use super::alsa_device::{self, AlsaParams};
use super::downsampler::Downsampler;
use super::transport::{FrameSender, Handoff};
use crate::error::DeviceError;

/// A running capture source. Dropping or stopping it releases the device.
pub trait CaptureStream: Send {
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

pub struct AlsaCapture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaCapture {
    /// Open `device` and start feeding 16 kHz frames into `frames`.
    ///
    /// The device is opened on the calling thread so that a missing or
    /// denied device is reported here instead of inside the capture thread.
    pub fn start(
        device: &str,
        sample_rate: u32,
        period_size: Option<usize>,
        frames: FrameSender,
    ) -> Result<Self, DeviceError> {
        let unavailable = |reason: String| DeviceError::CaptureUnavailable {
            device: device.to_string(),
            reason,
        };

        let (pcm, params) = alsa_device::open_capture(device, sample_rate, period_size)?;
        let downsampler = Downsampler::new(params.sample_rate).map_err(|e| unavailable(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = capture_thread(pcm, params, downsampler, frames, &running) {
                        log::error!("Capture thread error: {}", e);
                    }
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(|e| unavailable(e.to_string()))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl CaptureStream for AlsaCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // readi returns within one period, so this join is short
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    pcm: PCM,
    params: AlsaParams,
    mut downsampler: Downsampler,
    frames: FrameSender,
    running: &AtomicBool,
) -> alsa::Result<()> {
    let channels = params.channels.max(1) as usize;
    let io = pcm.io_f32()?;

    // ALSA read buffer (interleaved f32, one period)
    let mut read_buf = vec![0f32; params.period_size * channels];
    let mut mono: Vec<f32> = Vec::with_capacity(params.period_size);

    log::info!(
        "Recording started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(n) => {
                let batch: &[f32] = if channels == 1 {
                    &read_buf[..n]
                } else {
                    mono.clear();
                    mono.extend(
                        read_buf[..n * channels]
                            .chunks_exact(channels)
                            .map(|c| c.iter().sum::<f32>() / channels as f32),
                    );
                    &mono
                };

                let mut closed = false;
                downsampler.process(batch, |frame| {
                    if frames.send(frame) == Handoff::Closed {
                        closed = true;
                    }
                });
                if closed {
                    log::warn!("Frame receiver dropped, stopping capture");
                    break;
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
                // samples lost in the overrun; don't stitch across the gap
                downsampler.reset();
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
