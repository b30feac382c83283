//! audio - capture, downsampling, frame transport and playback
//!
//! Capture and playback run on dedicated OS threads using ALSA. The capture
//! thread downsamples to 16 kHz frames and hands them to the event loop
//! through a bounded channel; inbound synthesized audio goes the other way
//! through a `PlaybackSink`.

pub mod alsa_device;
pub mod audio_system;
pub mod capture;
pub mod downsampler;
pub mod frame;
pub mod playback;
pub mod stream_decoder;
pub mod transport;

pub use audio_system::{AlsaAudioSystem, AlsaPlayback, AudioDevices};
pub use capture::{AlsaCapture, CaptureStream};
pub use downsampler::Downsampler;
pub use frame::{AudioFrame, FRAME_BYTES, FRAME_SAMPLES, TARGET_SAMPLE_RATE};
pub use playback::{PlaybackController, PlaybackSink, PlaybackStats};
pub use stream_decoder::StreamDecoder;
pub use transport::{FrameReceiver, FrameSender, Handoff, frame_channel};
