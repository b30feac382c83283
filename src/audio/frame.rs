//! Fixed-size PCM frames exchanged with the remote agent.

/// Wire sample rate.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
/// Samples per frame (100 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1600;
/// Encoded size of one frame on the wire (s16le).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// One immutable frame of mono 16-bit PCM at 16 kHz.
///
/// The length is part of the type, so a short frame cannot be built.
/// Frames are moved, never shared: whoever holds the value owns the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Box<[i16; FRAME_SAMPLES]>,
}

impl AudioFrame {
    pub fn new(samples: Box<[i16; FRAME_SAMPLES]>) -> Self {
        Self { samples }
    }

    /// Build a frame from a vector that must hold exactly `FRAME_SAMPLES` values.
    /// Any other length is handed back unchanged.
    pub fn from_vec(samples: Vec<i16>) -> Result<Self, Vec<i16>> {
        let boxed: Box<[i16]> = samples.into_boxed_slice();
        match boxed.try_into() {
            Ok(samples) => Ok(Self { samples }),
            Err(boxed) => Err(Vec::from(boxed)),
        }
    }

    pub fn silence() -> Self {
        Self {
            samples: Box::new([0; FRAME_SAMPLES]),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples[..]
    }

    /// Little-endian s16 encoding, `FRAME_BYTES` long.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_BYTES);
        for s in self.samples.iter() {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Clamp to [-1, 1] and scale to a signed 16-bit sample.
pub fn quantize(sample: f32) -> i16 {
    // NaN falls through the clamp and saturates to 0 in the cast
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Inverse of [`quantize`], used by playback-side consumers and tests.
pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32767.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let short = vec![1i16; FRAME_SAMPLES - 1];
        let back = AudioFrame::from_vec(short).unwrap_err();
        assert_eq!(back.len(), FRAME_SAMPLES - 1);

        let frame = AudioFrame::from_vec(vec![7i16; FRAME_SAMPLES]).unwrap();
        assert_eq!(frame.samples().len(), FRAME_SAMPLES);
        assert!(frame.samples().iter().all(|&s| s == 7));
    }

    #[test]
    fn test_le_encoding() {
        let mut samples = vec![0i16; FRAME_SAMPLES];
        samples[0] = 1;
        samples[1] = -2;
        samples[FRAME_SAMPLES - 1] = i16::MAX;
        let bytes = AudioFrame::from_vec(samples).unwrap().to_le_bytes();

        assert_eq!(bytes.len(), FRAME_BYTES);
        assert_eq!(&bytes[0..2], &[0x01, 0x00]);
        assert_eq!(&bytes[2..4], &[0xfe, 0xff]);
        assert_eq!(&bytes[FRAME_BYTES - 2..], &[0xff, 0x7f]);
    }

    #[test]
    fn test_quantize_clamps_and_rounds() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(-1.0), -32767);
        assert_eq!(quantize(4.0), 32767);
        assert_eq!(quantize(-4.0), -32767);
        assert_eq!(quantize(0.5), 16384);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_quantize_within_one_step() {
        let step = 1.0 / 32767.0;
        let mut x = -1.0f32;
        while x <= 1.0 {
            let back = dequantize(quantize(x));
            assert!((back - x).abs() <= step, "x={x} back={back}");
            x += 0.000_37;
        }
    }
}
