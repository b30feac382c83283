//! Decoders for inbound synthesized audio.

use anyhow::Result;

/// Converts an inbound audio chunk into interleaved i16 PCM ready for the
/// playback device. Implementations keep any state needed across chunks.
pub trait StreamDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>>;

    /// Forget partial state, called when playback is flushed.
    fn reset(&mut self) {}
}

/// Raw little-endian s16 PCM, optionally duplicated across output channels.
///
/// An odd trailing byte is held back and prefixed to the next chunk, so a
/// sample split across two websocket messages is not lost.
pub struct PcmDecoder {
    channels: usize,
    carry: Option<u8>,
}

impl PcmDecoder {
    pub fn new(output_channels: u32) -> Self {
        Self {
            channels: output_channels.max(1) as usize,
            carry: None,
        }
    }
}

impl StreamDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(b) = self.carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(data);

        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        let mut out = Vec::with_capacity(bytes.len() / 2 * self.channels);
        for pair in bytes.chunks_exact(2) {
            let s = i16::from_le_bytes([pair[0], pair[1]]);
            for _ in 0..self.channels {
                out.push(s);
            }
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.carry = None;
    }
}

/// Factory: pick a decoder for the configured inbound stream format.
pub fn create_decoder(stream_format: &str, output_channels: u32) -> Result<Box<dyn StreamDecoder>> {
    match stream_format {
        "pcm" | "pcm_s16le" => Ok(Box::new(PcmDecoder::new(output_channels))),
        other => anyhow::bail!("Unsupported stream format: {}", other),
    }
}
