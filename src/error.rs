use thiserror::Error;

/// Capture/playback device failures.
///
/// These are surfaced to the caller of `connect()` and never retried
/// automatically: a denied or missing device will not fix itself.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("capture device '{device}' unavailable: {reason}")]
    CaptureUnavailable { device: String, reason: String },

    #[error("playback device '{device}' unavailable: {reason}")]
    PlaybackUnavailable { device: String, reason: String },

    #[error("playback backlog full ({capacity} chunks)")]
    PlaybackBacklog { capacity: usize },

    #[error("playback device stopped")]
    PlaybackStopped,
}

/// Inbound text payloads that could not be turned into a `ControlMessage`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("control message without a \"type\" field")]
    MissingType,

    #[error("unknown control message type: {0}")]
    UnknownType(String),

    #[error("unknown voice state: {0}")]
    UnknownState(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("voice client has been disposed")]
    Disposed,
}
