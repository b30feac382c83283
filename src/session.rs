//! One connection attempt's worth of state.
//!
//! A `Session` is created for every (re)connection attempt and dropped when
//! the link is lost or closed. Only the backoff and the subscribers outlive
//! it; those live in the client.
//!
//! Once open, the write half belongs to its own task fed by a bounded queue,
//! so a peer that stops reading never stalls the event loop.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use crate::audio::transport::Handoff;
use crate::config::ServerConfig;
use crate::error::ClientError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Messages waiting for the writer task, about 2 s of audio frames.
const OUTBOUND_QUEUE: usize = 20;
/// The idle timeout is checked this many times per timeout period.
const IDLE_CHECKS: u32 = 4;
const MIN_TICK: Duration = Duration::from_millis(10);

/// Build the websocket handshake request for the configured endpoint.
pub fn build_request(server: &ServerConfig) -> Result<Request, ClientError> {
    let endpoint = |e: &dyn std::fmt::Display| ClientError::Endpoint(format!("{}: {}", server.url, e));

    let mut request = server
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| endpoint(&e))?;
    let headers = request.headers_mut();

    if !server.token.is_empty() {
        let auth = HeaderValue::from_str(&format!("Bearer {}", server.token)).map_err(|e| endpoint(&e))?;
        headers.insert("Authorization", auth);
    }
    headers.insert(
        "Device-Id",
        HeaderValue::from_str(&server.device_id).map_err(|e| endpoint(&e))?,
    );
    headers.insert(
        "Client-Id",
        HeaderValue::from_str(&server.client_id).map_err(|e| endpoint(&e))?,
    );
    headers.insert("Protocol-Version", HeaderValue::from_static("1"));
    Ok(request)
}

/// Heartbeat settings applied once a link is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct Heartbeat {
    pub ping_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl Heartbeat {
    /// How often an open session wakes up to ping or check for silence.
    fn tick_period(&self) -> Option<Duration> {
        let idle_check = self
            .idle_timeout
            .map(|t| (t / IDLE_CHECKS).max(MIN_TICK));
        match (self.ping_interval, idle_check) {
            (Some(ping), Some(check)) => Some(ping.min(check)),
            (ping, check) => ping.or(check),
        }
    }
}

enum Link {
    Connecting(JoinHandle<Result<WsStream, WsError>>),
    Open {
        /// `None` once closing started
        outbound: Option<mpsc::Sender<Message>>,
        writer: JoinHandle<Result<(), WsError>>,
        read: SplitStream<WsStream>,
        ticker: Option<Interval>,
    },
}

/// Something the event loop has to react to.
pub enum Activity {
    /// Handshake finished, successfully or not
    Established(Result<WsStream, String>),
    /// Next inbound message; `None` means the stream ended
    Inbound(Option<Result<Message, WsError>>),
    /// The writer task ended, the link cannot send anymore
    WriteFailed(String),
    /// Heartbeat tick, carries the tick's scheduled time
    HeartbeatDue(Instant),
}

pub struct Session {
    id: Uuid,
    link: Link,
    heartbeat: Heartbeat,
    opened_at: Instant,
    last_inbound: Instant,
    next_ping: Option<Instant>,
    dropped: u64,
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
) -> Result<(), WsError> {
    while let Some(msg) = outbound.recv().await {
        write.send(msg).await?;
    }
    // sender dropped: the session is closing
    write.close().await
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(t) => t.tick().await,
        None => std::future::pending().await,
    }
}

impl Session {
    /// Start a connection attempt in the background.
    ///
    /// The request is built inside the task, so a bad endpoint shows up as a
    /// failed attempt like any other connection error.
    pub fn open(server: ServerConfig, heartbeat: Heartbeat) -> Self {
        let id = Uuid::new_v4();
        log::info!("Session {}: connecting to {}...", id, server.url);

        let handle = tokio::spawn(async move {
            let request = build_request(&server).map_err(|e| WsError::Io(std::io::Error::other(e)))?;
            let (ws_stream, _) = connect_async(request).await?;
            Ok(ws_stream)
        });

        let now = Instant::now();
        Self {
            id,
            link: Link::Connecting(handle),
            heartbeat,
            opened_at: now,
            last_inbound: now,
            next_ping: None,
            dropped: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        matches!(self.link, Link::Open { .. })
    }

    /// Adopt the stream produced by a successful handshake.
    pub fn establish(&mut self, ws: WsStream) {
        let (write, read) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(write, rx));

        let now = Instant::now();
        let ticker = self.heartbeat.tick_period().map(|period| {
            let mut iv = tokio::time::interval_at(now + period, period);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        self.last_inbound = now;
        self.next_ping = self.heartbeat.ping_interval.map(|p| now + p);
        self.link = Link::Open {
            outbound: Some(tx),
            writer,
            read,
            ticker,
        };
        log::info!(
            "Session {}: connected in {:?}",
            self.id,
            self.opened_at.elapsed()
        );
    }

    /// Wait for the next thing that happens on the session, if any.
    /// Pending forever when there is no session.
    pub async fn next_activity(session: &mut Option<Session>) -> Activity {
        let Some(session) = session.as_mut() else {
            return std::future::pending().await;
        };

        match &mut session.link {
            Link::Connecting(handle) => match handle.await {
                Ok(Ok(ws)) => Activity::Established(Ok(ws)),
                Ok(Err(e)) => Activity::Established(Err(e.to_string())),
                Err(e) => Activity::Established(Err(format!("connect task failed: {}", e))),
            },
            Link::Open {
                read,
                writer,
                ticker,
                ..
            } => {
                tokio::select! {
                    msg = read.next() => Activity::Inbound(msg),
                    res = writer => Activity::WriteFailed(match res {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("writer task failed: {}", e),
                    }),
                    at = next_tick(ticker) => Activity::HeartbeatDue(at),
                }
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_inbound = Instant::now();
    }

    /// True when an idle timeout is configured and nothing arrived for that long.
    pub fn is_stale(&self) -> bool {
        self.heartbeat
            .idle_timeout
            .is_some_and(|limit| self.last_inbound.elapsed() >= limit)
    }

    /// Whether the heartbeat tick scheduled at `at` owes a ping. Schedules
    /// the next one when it does.
    pub fn ping_due(&mut self, at: Instant) -> bool {
        match (self.next_ping, self.heartbeat.ping_interval) {
            (Some(due), Some(interval)) if at >= due => {
                self.next_ping = Some(at + interval);
                true
            }
            _ => false,
        }
    }

    /// Queue one message for the writer task. Never waits: a full queue
    /// drops the message, which only happens while the peer is not reading.
    pub fn send(&mut self, msg: Message) -> Handoff {
        let Link::Open {
            outbound: Some(tx),
            ..
        } = &self.link
        else {
            return Handoff::Closed;
        };

        match tx.try_send(msg) {
            Ok(()) => Handoff::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                // 每50条打印一次，避免刷屏
                if self.dropped == 1 || self.dropped % 50 == 0 {
                    log::warn!(
                        "Session {}: peer not keeping up, {} outbound messages dropped so far",
                        self.id,
                        self.dropped
                    );
                }
                Handoff::Dropped
            }
            Err(TrySendError::Closed(_)) => Handoff::Closed,
        }
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Flush queued messages, send a close frame and drop the link. Bounded
    /// by `timeout`; a writer still stuck after that is aborted.
    pub async fn close(mut self, timeout: Duration) {
        if let Link::Open {
            outbound, writer, ..
        } = &mut self.link
        {
            outbound.take();
            match tokio::time::timeout(timeout, &mut *writer).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => log::debug!("Session {}: close failed: {}", self.id, e),
                Ok(Err(e)) => log::debug!("Session {}: writer task failed: {}", self.id, e),
                Err(_) => {
                    writer.abort();
                    log::warn!("Session {}: close timed out, link dropped", self.id);
                }
            }
        }
        log::info!("Session {}: closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        match &self.link {
            Link::Connecting(handle) => handle.abort(),
            Link::Open { writer, .. } => writer.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_request_headers() {
        let mut server = Config::default().server;
        server.url = "wss://voice.example.com/v1/stream".into();
        server.token = "abc".into();
        server.device_id = "aa:bb:cc:dd:ee:ff".into();
        server.client_id = "client-1".into();

        let request = build_request(&server).unwrap();
        assert_eq!(request.uri().host(), Some("voice.example.com"));
        let h = request.headers();
        assert_eq!(h["Authorization"], "Bearer abc");
        assert_eq!(h["Device-Id"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(h["Client-Id"], "client-1");
        assert_eq!(h["Protocol-Version"], "1");
        assert!(h.contains_key("Sec-WebSocket-Key"));
    }

    #[test]
    fn test_no_token_no_auth_header() {
        let server = Config::default().server;
        let request = build_request(&server).unwrap();
        assert!(!request.headers().contains_key("Authorization"));
    }

    #[test]
    fn test_bad_url_is_endpoint_error() {
        let mut server = Config::default().server;
        server.url = "not a url".into();
        assert!(matches!(build_request(&server), Err(ClientError::Endpoint(_))));
    }

    #[test]
    fn test_heartbeat_tick_period() {
        let hb = |ping: Option<u64>, idle: Option<u64>| Heartbeat {
            ping_interval: ping.map(ms),
            idle_timeout: idle.map(ms),
        };

        assert_eq!(hb(None, None).tick_period(), None);
        assert_eq!(hb(Some(1000), None).tick_period(), Some(ms(1000)));
        // silence is noticed within a quarter of the timeout
        assert_eq!(hb(None, Some(2000)).tick_period(), Some(ms(500)));
        assert_eq!(hb(Some(1000), Some(8000)).tick_period(), Some(ms(1000)));
        assert_eq!(hb(Some(5000), Some(2000)).tick_period(), Some(ms(500)));
        assert_eq!(hb(None, Some(4)).tick_period(), Some(MIN_TICK));
    }

    #[tokio::test]
    async fn test_failed_attempt_reports_error() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut server = Config::default().server;
        server.url = format!("ws://127.0.0.1:{}/", port);
        let mut session = Some(Session::open(server, Heartbeat::default()));
        match Session::next_activity(&mut session).await {
            Activity::Established(Err(_)) => {}
            _ => panic!("expected a failed attempt"),
        }
    }

    #[tokio::test]
    async fn test_send_before_open_is_closed() {
        let mut server = Config::default().server;
        server.url = "ws://127.0.0.1:9/".into();
        let mut session = Session::open(server, Heartbeat::default());
        assert_eq!(session.send(Message::Text("hi".into())), Handoff::Closed);
        assert_eq!(session.dropped(), 0);
    }

    #[tokio::test]
    async fn test_no_session_is_pending() {
        let mut none: Option<Session> = None;
        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            Session::next_activity(&mut none),
        )
        .await;
        assert!(waited.is_err());
    }
}
