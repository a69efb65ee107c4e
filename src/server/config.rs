//! Server configuration

use std::time::Duration;

use crate::error::ConfigError;
use crate::media::{MediaCommand, ENCODER_PRESETS};
use crate::protocol::ServerInfo;
use crate::transport::ServiceAddress;

/// Immutable stream parameters, snapshotted at startup.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Target stream width in pixels.
    pub width: u32,

    /// Target stream height in pixels.
    pub height: u32,

    /// Target frames per second.
    pub fps: u32,

    /// H.264 CRF quality value (lower is better quality).
    pub crf: u32,

    /// libx264 encoding preset.
    pub preset: String,

    /// Keyframe interval in seconds of video.
    pub gop_seconds: u32,

    /// Maximum concurrent consumers (0 = unbounded).
    pub max_clients: usize,

    /// How often each session sends a PING.
    pub heartbeat_interval: Duration,

    /// How long without a PONG before a session is evicted.
    pub heartbeat_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 20,
            crf: 28,
            preset: "ultrafast".to_string(),
            gop_seconds: 2,
            max_clients: 0, // Unlimited
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

impl StreamSettings {
    /// Set the resolution.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the frame rate.
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the CRF quality value.
    pub fn crf(mut self, crf: u32) -> Self {
        self.crf = crf;
        self
    }

    /// Set the encoder preset.
    pub fn preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    /// Set the keyframe interval in seconds.
    pub fn gop_seconds(mut self, seconds: u32) -> Self {
        self.gop_seconds = seconds;
        self
    }

    /// Set the admission cap (0 = unbounded).
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Set the heartbeat cadence.
    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Keyframe interval in frames, as the encoder wants it.
    pub fn keyframe_interval(&self) -> u32 {
        self.fps * self.gop_seconds
    }

    /// Reject settings no stream can run with. Fatal at startup, before any
    /// session exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolution",
                reason: "width and height must be nonzero",
            });
        }
        if self.fps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fps",
                reason: "must be nonzero",
            });
        }
        if !ENCODER_PRESETS.contains(&self.preset.as_str()) {
            return Err(ConfigError::UnknownPreset(self.preset.clone()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatOrdering);
        }
        Ok(())
    }
}

/// Parse a `WIDTHxHEIGHT` resolution string.
pub fn parse_resolution(input: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidResolution(input.to_string());
    let (width, height) = input.split_once('x').ok_or_else(invalid)?;
    let width = width.parse::<u32>().map_err(|_| invalid())?;
    let height = height.parse::<u32>().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Service address announced and listened on.
    pub address: ServiceAddress,

    /// Name shown to consumers in announcements.
    pub nickname: String,

    /// Stream parameters.
    pub settings: StreamSettings,

    /// How often the service announcement is repeated.
    pub announce_interval: Duration,

    /// Upper bound on one encoder pipe read; bounds forwarding latency and
    /// keeps relay loops responsive to teardown.
    pub poll_interval: Duration,

    /// Bytes read from the encoder pipe per relay iteration.
    pub chunk_size: usize,

    /// How long a freshly started encoder gets to survive before the
    /// admission that started it is refused.
    pub encoder_start_grace: Duration,

    /// Replaces the built-in ffmpeg command. The program must emit a
    /// continuous byte stream on stdout.
    pub encoder_command: Option<MediaCommand>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ServiceAddress::new("meshcast", "video_stream/ad_feed"),
            nickname: "meshcast-server".to_string(),
            settings: StreamSettings::default(),
            announce_interval: Duration::from_secs(300),
            poll_interval: Duration::from_millis(25),
            chunk_size: 4096,
            encoder_start_grace: Duration::from_millis(2500),
            encoder_command: None,
        }
    }
}

impl ServerConfig {
    /// Create a config for a service address.
    pub fn with_address(address: ServiceAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Set the announced nickname.
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    /// Set the stream parameters.
    pub fn settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the announce cadence.
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Set the relay poll bound.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the encoder startup grace period.
    pub fn encoder_start_grace(mut self, grace: Duration) -> Self {
        self.encoder_start_grace = grace;
        self
    }

    /// Override the encoder command.
    pub fn encoder_command(mut self, command: MediaCommand) -> Self {
        self.encoder_command = Some(command);
        self
    }

    /// The command the shared encoder is started with.
    pub fn encoder(&self) -> MediaCommand {
        self.encoder_command.clone().unwrap_or_else(|| {
            MediaCommand::encoder(
                self.settings.width,
                self.settings.height,
                self.settings.fps,
                self.settings.crf,
                &self.settings.preset,
                self.settings.keyframe_interval(),
            )
        })
    }

    /// Announcement metadata for this server.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(
            &self.nickname,
            self.settings.width,
            self.settings.height,
            self.settings.fps,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunk_size",
                reason: "must be nonzero",
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval",
                reason: "must be nonzero",
            });
        }
        self.settings.validate()
    }
}
