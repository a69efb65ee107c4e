//! Client configuration

use std::time::Duration;

use crate::error::ConfigError;
use crate::media::MediaCommand;

/// Client configuration options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Aspect string to filter announcements by.
    pub aspect: String,

    /// Log a warning if no producer is heard within this long after
    /// discovery starts. Discovery keeps running regardless.
    pub discovery_timeout: Duration,

    /// How long to wait after a disconnect before rediscovering.
    pub reconnect_delay: Duration,

    /// Replaces the built-in ffplay command. The program must consume a
    /// continuous byte stream on stdin.
    pub decoder_command: Option<MediaCommand>,

    /// How long a stopping decoder gets to exit after its input closes
    /// before it is killed.
    pub decoder_stop_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            aspect: "video_stream/ad_feed".to_string(),
            discovery_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(10),
            decoder_command: None,
            decoder_stop_grace: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    /// Create a config for an aspect filter.
    pub fn with_aspect(aspect: impl Into<String>) -> Self {
        Self {
            aspect: aspect.into(),
            ..Default::default()
        }
    }

    /// Set the initial discovery warning timeout.
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Override the decoder command.
    pub fn decoder_command(mut self, command: MediaCommand) -> Self {
        self.decoder_command = Some(command);
        self
    }

    /// The command the decoder is started with for a producer `nickname`.
    pub fn decoder(&self, nickname: &str) -> MediaCommand {
        self.decoder_command.clone().unwrap_or_else(|| {
            MediaCommand::decoder(&format!("meshcast - Streaming from {}", nickname))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aspect.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "aspect",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.aspect, "video_stream/ad_feed");
        assert_eq!(config.reconnect_delay, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_decoder_title_carries_nickname() {
        let config = ClientConfig::default();
        let cmd = config.decoder("LivingRoom");
        assert!(cmd
            .args()
            .contains(&"meshcast - Streaming from LivingRoom".to_string()));
    }

    #[test]
    fn test_decoder_override_wins() {
        let config =
            ClientConfig::default().decoder_command(MediaCommand::new("cat", Vec::<String>::new()));
        assert_eq!(config.decoder("anything").program(), "cat");
    }

    #[test]
    fn test_empty_aspect_rejected() {
        let config = ClientConfig::with_aspect("");
        assert!(config.validate().is_err());
    }
}
