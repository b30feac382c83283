//! Voice interaction state machine.
//!
//! `transition` is a pure function from (state, event) to the next state and
//! the side effects the client must carry out. The client owns the only
//! `VoiceState`; everything else observes it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
}

impl VoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceState::Idle => "idle",
            VoiceState::Connecting => "connecting",
            VoiceState::Listening => "listening",
            VoiceState::Thinking => "thinking",
            VoiceState::Speaking => "speaking",
        }
    }

    /// A link exists (or is being established) in every state but `Idle`.
    pub fn is_active(&self) -> bool {
        *self != VoiceState::Idle
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoiceState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(VoiceState::Idle),
            "connecting" => Ok(VoiceState::Connecting),
            "listening" => Ok(VoiceState::Listening),
            "thinking" => Ok(VoiceState::Thinking),
            "speaking" => Ok(VoiceState::Speaking),
            other => Err(ProtocolError::UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `connect()` called
    Connect,
    /// Reconnect timer fired
    ReconnectDue,
    /// Websocket handshake completed
    Established,
    /// Socket error, close, failed attempt or idle timeout
    ConnectionLost,
    /// Inbound `status` message
    RemoteStatus(VoiceState),
    /// Inbound `clear_buffer` message
    BargeIn,
    /// `disconnect()` called
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Create a new session and start the handshake
    OpenLink,
    /// Close and drop the current session
    CloseLink,
    ScheduleReconnect,
    CancelReconnect,
    ResetBackoff,
    FlushPlayback,
    /// Stop capture and playback devices
    ReleaseDevices,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: VoiceState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: VoiceState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }

    fn to(next: VoiceState, effects: &[Effect]) -> Self {
        Self {
            next,
            effects: effects.to_vec(),
        }
    }

    pub fn changed(&self, from: VoiceState) -> bool {
        self.next != from
    }
}

/// Remote status changes the client accepts. Anything else is a protocol
/// violation and leaves the state alone.
pub fn remote_transition_allowed(from: VoiceState, to: VoiceState) -> bool {
    use VoiceState::*;
    matches!(
        (from, to),
        (Listening, Thinking) | (Thinking, Speaking) | (Speaking, Listening)
    )
}

pub fn transition(state: VoiceState, event: &Event) -> Transition {
    use Effect::*;
    use VoiceState::*;

    match (state, event) {
        (Idle, Event::Connect) => Transition::to(Connecting, &[CancelReconnect, OpenLink]),
        (Idle, Event::ReconnectDue) => Transition::to(Connecting, &[OpenLink]),
        // at most one live link: a second connect() is ignored
        (_, Event::Connect) | (_, Event::ReconnectDue) => Transition::stay(state),

        (Connecting, Event::Established) => Transition::to(Listening, &[ResetBackoff]),
        (_, Event::Established) => Transition::stay(state),

        (Idle, Event::ConnectionLost) => Transition::stay(Idle),
        (_, Event::ConnectionLost) => {
            Transition::to(Idle, &[FlushPlayback, CloseLink, ScheduleReconnect])
        }

        (_, Event::RemoteStatus(to)) if remote_transition_allowed(state, *to) => {
            Transition::to(*to, &[])
        }
        (_, Event::RemoteStatus(_)) => Transition::stay(state),

        (Speaking, Event::BargeIn) => Transition::to(Listening, &[FlushPlayback]),
        (_, Event::BargeIn) => Transition::to(state, &[FlushPlayback]),

        (_, Event::Disconnect) => Transition::to(
            Idle,
            &[CancelReconnect, FlushPlayback, CloseLink, ReleaseDevices],
        ),
    }
}
