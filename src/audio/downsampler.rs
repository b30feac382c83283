//! Point-sample decimation from the capture rate to 16 kHz frames.
//!
//! Not band-limited: content above 8 kHz aliases into the output.

use super::frame::{AudioFrame, FRAME_SAMPLES, TARGET_SAMPLE_RATE, quantize};

pub struct Downsampler {
    input_rate: u32,
    // Selected samples not yet packed into a frame (always < FRAME_SAMPLES between calls)
    pending: Vec<f32>,
}

impl Downsampler {
    pub fn new(input_rate: u32) -> anyhow::Result<Self> {
        if input_rate == 0 {
            anyhow::bail!("Input sample rate must be greater than 0");
        }
        if input_rate < TARGET_SAMPLE_RATE {
            log::warn!(
                "Capture rate {}Hz is below {}Hz, samples will be repeated",
                input_rate,
                TARGET_SAMPLE_RATE
            );
        }
        Ok(Self {
            input_rate,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
        })
    }

    /// Samples waiting for the next frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feed one capture batch and hand every completed frame to `emit`.
    ///
    /// Selection restarts at index 0 for each batch. Leftover samples carry
    /// over to the next call; nothing is emitted short.
    pub fn process<F>(&mut self, batch: &[f32], mut emit: F) -> usize
    where
        F: FnMut(AudioFrame),
    {
        if batch.is_empty() {
            return 0;
        }

        // floor(k * ratio) with ratio = input_rate / 16000, in integers so
        // positions never drift across long batches
        let rate = self.input_rate as u64;
        let target = TARGET_SAMPLE_RATE as u64;
        let mut k = 0u64;
        loop {
            let idx = (k * rate / target) as usize;
            if idx >= batch.len() {
                break;
            }
            self.pending.push(batch[idx]);
            k += 1;
        }

        let mut emitted = 0;
        while self.pending.len() >= FRAME_SAMPLES {
            let mut samples = Box::new([0i16; FRAME_SAMPLES]);
            for (dst, src) in samples.iter_mut().zip(self.pending.drain(..FRAME_SAMPLES)) {
                *dst = quantize(src);
            }
            emit(AudioFrame::new(samples));
            emitted += 1;
        }
        emitted
    }

    /// Convenience for callers that want the frames collected.
    pub fn process_to_vec(&mut self, batch: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        self.process(batch, |f| frames.push(f));
        frames
    }

    /// Drop any partial frame. Used after a capture overrun, where the
    /// pending samples and the next batch are not contiguous.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
