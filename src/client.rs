//! The long-lived voice client.
//!
//! `VoiceClient` is a cheap handle. All state lives in a single task (the
//! event loop) that owns the websocket session, the `VoiceState`, the
//! reconnect timer, the devices and the playback controller. Callers talk to
//! it through commands; observers subscribe to `ClientEvent`s.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::audio::audio_system::AudioDevices;
use crate::audio::capture::CaptureStream;
use crate::audio::frame::AudioFrame;
use crate::audio::playback::PlaybackController;
use crate::audio::transport::{FrameReceiver, Handoff, frame_channel};
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::ClientError;
use crate::protocol::{ClientMessage, ControlMessage, Inbound, classify};
use crate::session::{Activity, Heartbeat, Session, build_request};
use crate::state::{Effect, Event, VoiceState, remote_transition_allowed, transition};

const COMMAND_QUEUE: usize = 100;
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// What subscribers see.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(VoiceState),
    Transcript {
        role: String,
        text: String,
        partial: bool,
    },
    /// Playback was cleared by the remote agent
    BargeIn,
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Human-readable reason for a dropped connection or failed attempt
    Error(String),
}

enum Command {
    Connect(oneshot::Sender<Result<(), ClientError>>),
    Disconnect(oneshot::Sender<()>),
    Dispose(oneshot::Sender<()>),
    SendText(String),
    SendAudio(AudioFrame),
}

#[derive(Clone)]
pub struct VoiceClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<VoiceState>,
}

impl VoiceClient {
    /// Create the client and start its event loop on the current runtime.
    /// Nothing connects until `connect()` is called.
    pub fn spawn(config: Config, devices: Box<dyn AudioDevices>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(config.events.capacity.max(1));
        let (state_tx, state_rx) = watch::channel(VoiceState::Idle);

        let backoff = Backoff::new(config.initial_backoff(), config.max_backoff());
        let core = ClientCore {
            config,
            devices,
            commands: cmd_rx,
            events: events.clone(),
            state_tx,
            state: VoiceState::Idle,
            backoff,
            session: None,
            reconnect_timer: None,
            capture: None,
            frames: None,
            playback: None,
            deferred: Vec::new(),
        };
        tokio::spawn(core.run());

        Self {
            commands: cmd_tx,
            events,
            state: state_rx,
        }
    }

    /// Open the audio devices and start connecting.
    ///
    /// Device failures come back here and are not retried. A client that is
    /// already connecting or connected is left alone.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx)).await?;
        rx.await.map_err(|_| ClientError::Disposed)?
    }

    /// Cancel any pending reconnect, close the link, release the devices and
    /// return to `idle`. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Disconnect and stop the event loop. Later calls return `Disposed`.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Dispose(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Typed input. Dropped if the link is not open.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::SendText(text.into())).await
    }

    /// One audio frame. Dropped if the link is not open.
    pub async fn send_audio(&self, frame: AudioFrame) -> Result<(), ClientError> {
        self.command(Command::SendAudio(frame)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    async fn command(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands.send(cmd).await.map_err(|_| ClientError::Disposed)
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Exit,
}

struct ClientCore {
    config: Config,
    devices: Box<dyn AudioDevices>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    state_tx: watch::Sender<VoiceState>,
    state: VoiceState,
    backoff: Backoff,
    session: Option<Session>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    capture: Option<Box<dyn CaptureStream>>,
    frames: Option<FrameReceiver>,
    playback: Option<PlaybackController>,
    // Emitted after the state change of the transition that produced them
    deferred: Vec<ClientEvent>,
}

async fn next_frame(frames: &mut Option<FrameReceiver>) -> Option<AudioFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl ClientCore {
    async fn run(mut self) {
        log::info!("Voice client started. State: {}", self.state);

        // 主循环：命令、采集帧、网络消息、重连定时器
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        // every handle dropped
                        self.apply(Event::Disconnect).await;
                        break;
                    };
                    if self.handle_command(cmd).await == Flow::Exit {
                        break;
                    }
                }
                frame = next_frame(&mut self.frames) => match frame {
                    Some(frame) => self.send_audio(frame),
                    None => {
                        log::warn!("Capture stream ended");
                        self.frames = None;
                    }
                },
                activity = Session::next_activity(&mut self.session) => {
                    self.on_activity(activity).await;
                }
                _ = reconnect_due(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.apply(Event::ReconnectDue).await;
                }
            }
        }

        log::info!("Voice client stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.apply(Event::Disconnect).await;
                let _ = reply.send(());
            }
            Command::Dispose(reply) => {
                self.apply(Event::Disconnect).await;
                let _ = reply.send(());
                return Flow::Exit;
            }
            Command::SendText(text) => {
                let json = ClientMessage::text(text).to_json();
                self.send(Message::Text(json.into()));
            }
            Command::SendAudio(frame) => self.send_audio(frame),
        }
        Flow::Continue
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        if self.session.is_some() {
            log::debug!("connect() ignored, session already active ({})", self.state);
            return Ok(());
        }
        build_request(&self.config.server)?;
        self.open_devices()?;
        self.apply(Event::Connect).await;
        Ok(())
    }

    fn open_devices(&mut self) -> Result<(), ClientError> {
        if self.capture.is_none() {
            let (tx, rx) = frame_channel(self.config.audio.frame_queue_capacity);
            let capture = self.devices.open_capture(tx)?;
            self.capture = Some(capture);
            self.frames = Some(rx);
        }
        if self.playback.is_none() {
            match self.devices.open_playback() {
                Ok(sink) => self.playback = Some(PlaybackController::new(sink)),
                Err(e) => {
                    self.release_devices();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn release_devices(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.frames = None;
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
    }

    /// Run one event through the state machine and carry out its effects.
    /// Observers see the new state only after every effect is done.
    async fn apply(&mut self, event: Event) {
        let prev = self.state;
        let t = transition(prev, &event);
        if !t.changed(prev) && t.effects.is_empty() {
            log::debug!("Ignoring {:?} in state {}", event, prev);
            return;
        }

        for effect in &t.effects {
            self.run_effect(*effect).await;
        }

        if t.changed(prev) {
            log::info!("State: {} -> {} ({:?})", prev, t.next, event);
            self.state = t.next;
            self.state_tx.send_replace(t.next);
            self.emit(ClientEvent::State(t.next));
        }
        for ev in std::mem::take(&mut self.deferred) {
            self.emit(ev);
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::OpenLink => {
                let heartbeat = Heartbeat {
                    ping_interval: self.config.heartbeat_interval(),
                    idle_timeout: self.config.idle_timeout(),
                };
                self.session = Some(Session::open(self.config.server.clone(), heartbeat));
            }
            Effect::CloseLink => {
                if let Some(session) = self.session.take() {
                    session.close(CLOSE_TIMEOUT).await;
                }
            }
            Effect::ScheduleReconnect => {
                let delay = self.backoff.next_delay();
                let attempt = self.backoff.attempt();
                log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                self.deferred.push(ClientEvent::ReconnectScheduled { attempt, delay });
            }
            Effect::CancelReconnect => {
                if self.reconnect_timer.take().is_some() {
                    log::info!("Pending reconnect cancelled");
                }
            }
            Effect::ResetBackoff => self.backoff.reset(),
            Effect::FlushPlayback => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.barge_in();
                }
            }
            Effect::ReleaseDevices => self.release_devices(),
        }
    }

    async fn on_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Established(Ok(ws)) => {
                if let Some(session) = self.session.as_mut() {
                    session.establish(ws);
                }
                self.apply(Event::Established).await;
            }
            Activity::Established(Err(e)) => {
                self.connection_lost(format!("Connection failed: {}", e)).await;
            }
            Activity::Inbound(Some(Ok(msg))) => {
                if let Some(session) = self.session.as_mut() {
                    session.touch();
                }
                self.on_message(msg).await;
            }
            Activity::Inbound(Some(Err(e))) => {
                self.connection_lost(format!("Connection error: {}", e)).await;
            }
            Activity::Inbound(None) => {
                self.connection_lost("Connection closed".to_string()).await;
            }
            Activity::WriteFailed(e) => {
                self.connection_lost(format!("Send failed: {}", e)).await;
            }
            Activity::HeartbeatDue(at) => self.on_heartbeat(at).await,
        }
    }

    async fn on_message(&mut self, msg: Message) {
        match classify(msg) {
            Inbound::Audio(chunk) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.on_audio(chunk);
                }
            }
            Inbound::Control(control) => self.on_control(control).await,
            Inbound::Malformed(e) => {
                log::warn!("Dropping inbound message: {}", e);
            }
            Inbound::Closed(frame) => {
                let reason = match frame {
                    Some(f) => format!("Server closed connection: {} {}", f.code, f.reason.as_str()),
                    None => "Server closed connection".to_string(),
                };
                self.connection_lost(reason).await;
            }
            Inbound::Other => {}
        }
    }

    async fn on_control(&mut self, control: ControlMessage) {
        match control {
            ControlMessage::Status { state } => {
                if state != self.state && !remote_transition_allowed(self.state, state) {
                    log::warn!("Ignoring status '{}' in state {}", state, self.state);
                    return;
                }
                self.apply(Event::RemoteStatus(state)).await;
            }
            ControlMessage::ClearBuffer => {
                self.apply(Event::BargeIn).await;
                self.emit(ClientEvent::BargeIn);
            }
            ControlMessage::Transcript {
                role,
                text,
                partial,
            } => {
                log::debug!("Transcript [{}{}]: {}", role, if partial { ", partial" } else { "" }, text);
                self.emit(ClientEvent::Transcript {
                    role,
                    text,
                    partial,
                });
            }
        }
    }

    async fn on_heartbeat(&mut self, at: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.is_stale() {
            self.connection_lost("No data from server, idle timeout".to_string())
                .await;
            return;
        }
        if session.ping_due(at) {
            self.send(Message::Ping(Default::default()));
        }
    }

    fn send_audio(&mut self, frame: AudioFrame) {
        self.send(Message::Binary(frame.to_le_bytes().into()));
    }

    /// Hand a message to the session's writer. Never waits on the network.
    fn send(&mut self, msg: Message) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_open()) else {
            log::debug!("Not connected ({}), dropping outbound message", self.state);
            return;
        };
        // Dropped is counted by the session; Closed means the writer died,
        // which next_activity reports as WriteFailed
        if session.send(msg) == Handoff::Closed {
            log::debug!("Session {}: writer gone, dropping outbound message", session.id());
        }
    }

    async fn connection_lost(&mut self, reason: String) {
        if !self.state.is_active() {
            self.session = None;
            return;
        }
        log::warn!("{}", reason);
        self.emit(ClientEvent::Error(reason));
        self.apply(Event::ConnectionLost).await;
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.release_devices();
    }
}
