//! Real-time voice streaming client.
//!
//! Microphone audio is downsampled to 16 kHz PCM frames and streamed over a
//! websocket to a remote voice agent; synthesized audio and control messages
//! come back on the same socket.

pub mod audio;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod state;

pub use client::{ClientEvent, VoiceClient};
pub use config::Config;
pub use error::{ClientError, DeviceError, ProtocolError};
pub use state::VoiceState;
