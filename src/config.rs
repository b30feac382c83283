//! Layered configuration: built-in defaults, then an optional TOML file,
//! then `VOICE_LINK__SECTION__KEY` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use mac_address::get_mac_address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CONFIG_FILE: &str = "voice_link.toml";
const ENV_PREFIX: &str = "VOICE_LINK";
const UNKNOWN_DEVICE: &str = "unknown-device";
const UNKNOWN_CLIENT: &str = "unknown-client";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub audio: AudioConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Voice endpoint, `ws://` or `wss://`
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when not empty
    pub token: String,
    pub device_id: String,
    pub client_id: String,
    /// Where a generated client id is persisted between runs
    pub client_id_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Both values default to 0 (disabled).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// Requested capture rate; the hardware may negotiate another one
    pub capture_sample_rate: u32,
    /// 0 = let ALSA decide
    pub capture_period_frames: usize,
    pub playback_device: String,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    /// The device buffer is capped at four periods. 0 = let ALSA decide both
    pub playback_period_frames: usize,
    /// Inbound audio encoding, currently only "pcm_s16le"
    pub stream_format: String,
    /// Frames buffered between the capture thread and the event loop
    pub frame_queue_capacity: usize,
    /// Inbound chunks buffered ahead of the playback device
    pub playback_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    /// Broadcast buffer per subscriber; slow subscribers see `Lagged`
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "ws://127.0.0.1:8765/voice".to_string(),
                token: String::new(),
                device_id: UNKNOWN_DEVICE.to_string(),
                client_id: UNKNOWN_CLIENT.to_string(),
                client_id_file: "voice_link_client_id.txt".to_string(),
            },
            reconnect: ReconnectConfig {
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: 0,
                idle_timeout_ms: 0,
            },
            audio: AudioConfig::default(),
            events: EventsConfig { capacity: 64 },
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            capture_sample_rate: 48_000,
            capture_period_frames: 0,
            playback_device: "default".to_string(),
            playback_sample_rate: 16_000,
            playback_channels: 1,
            playback_period_frames: 320,
            stream_format: "pcm_s16le".to_string(),
            frame_queue_capacity: 50,
            playback_queue_capacity: 256,
        }
    }
}

impl Config {
    /// Load from `voice_link.toml` in the working directory (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE), false)
    }

    /// Load with an explicit file. `required` makes a missing file an error.
    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server.url)
            .with_context(|| format!("Invalid server url '{}'", self.server.url))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            anyhow::bail!("Server url must use ws:// or wss://, got {}", url.scheme());
        }

        if self.reconnect.initial_delay_ms == 0 {
            anyhow::bail!("reconnect.initial_delay_ms must be greater than 0");
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            anyhow::bail!("reconnect.max_delay_ms must not be below initial_delay_ms");
        }

        let hb = &self.heartbeat;
        if hb.idle_timeout_ms > 0 && hb.interval_ms > 0 && hb.idle_timeout_ms <= hb.interval_ms {
            anyhow::bail!("heartbeat.idle_timeout_ms must exceed heartbeat.interval_ms");
        }

        let audio = &self.audio;
        if audio.capture_sample_rate == 0 || audio.playback_sample_rate == 0 {
            anyhow::bail!("Audio sample rates must be greater than 0");
        }
        if audio.playback_channels == 0 {
            anyhow::bail!("audio.playback_channels must be greater than 0");
        }
        if audio.frame_queue_capacity == 0 || audio.playback_queue_capacity == 0 {
            anyhow::bail!("Audio queue capacities must be greater than 0");
        }
        crate::audio::stream_decoder::create_decoder(&audio.stream_format, 1)?;

        if self.events.capacity == 0 {
            anyhow::bail!("events.capacity must be greater than 0");
        }
        Ok(())
    }

    /// Fill in `unknown-device` / `unknown-client` placeholders.
    ///
    /// The device id falls back to the MAC address, then to a random UUID.
    /// A generated client id is written to `client_id_file` so the server
    /// sees the same identity after a restart.
    pub fn resolve_identity(&mut self) {
        if self.server.device_id == UNKNOWN_DEVICE {
            self.server.device_id = match get_mac_address() {
                Ok(Some(mac)) => mac.to_string().to_lowercase(),
                _ => Uuid::new_v4().to_string(),
            };
        }

        if self.server.client_id != UNKNOWN_CLIENT {
            return;
        }
        let path = Path::new(&self.server.client_id_file);
        if let Ok(content) = std::fs::read_to_string(path) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                self.server.client_id = trimmed.to_string();
                log::info!("Loaded client id from {}", path.display());
                return;
            }
        }

        self.server.client_id = Uuid::new_v4().to_string();
        log::info!("Generated new client id: {}", self.server.client_id);
        if let Err(e) = std::fs::write(path, &self.server.client_id) {
            log::warn!("Failed to save client id to {}: {}", path.display(), e);
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect.initial_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect.max_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat.interval_ms > 0).then(|| Duration::from_millis(self.heartbeat.interval_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.heartbeat.idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.heartbeat.idle_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.initial_backoff(), Duration::from_millis(1000));
        assert_eq!(config.max_backoff(), Duration::from_millis(30_000));
        assert!(config.heartbeat_interval().is_none());
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
url = "wss://voice.example.com/stream"
token = "secret"

[reconnect]
initial_delay_ms = 500
max_delay_ms = 8000

[audio]
capture_device = "plughw:1,0"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path(), true).unwrap();
        assert_eq!(config.server.url, "wss://voice.example.com/stream");
        assert_eq!(config.server.token, "secret");
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.audio.capture_device, "plughw:1,0");
        // untouched keys keep their defaults
        assert_eq!(config.audio.playback_sample_rate, 16_000);
        assert_eq!(config.events.capacity, 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_optional_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml"), false).unwrap();
        assert_eq!(config, Config::default());
        assert!(Config::load_from(&dir.path().join("absent.toml"), true).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = Config::default();
        c.server.url = "http://example.com".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.reconnect.max_delay_ms = 10;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.reconnect.initial_delay_ms = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.audio.stream_format = "opus".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.heartbeat.interval_ms = 5000;
        c.heartbeat.idle_timeout_ms = 1000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_client_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let id_file = dir.path().join("client_id.txt");

        let mut c = Config::default();
        c.server.device_id = "dev-1".into();
        c.server.client_id_file = id_file.to_string_lossy().into_owned();
        c.resolve_identity();
        assert_eq!(c.server.device_id, "dev-1");
        assert_ne!(c.server.client_id, UNKNOWN_CLIENT);

        let mut again = Config::default();
        again.server.client_id_file = c.server.client_id_file.clone();
        again.resolve_identity();
        assert_eq!(again.server.client_id, c.server.client_id);
        assert_ne!(again.server.device_id, UNKNOWN_DEVICE);
    }
}
