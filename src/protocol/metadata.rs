//! Announcement metadata
//!
//! Producers attach a small `key:value;key:value` string to their service
//! announcements so consumers can show what they are about to watch before a
//! link exists. The format is forgiving on the read side: unknown keys are
//! skipped, missing keys fall back to defaults.

use bytes::Bytes;

/// Parsed announcement metadata for one producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Human-readable producer name, shown in window titles and logs.
    pub nickname: String,

    /// Advertised resolution, e.g. `1280x720`.
    pub resolution: Option<String>,

    /// Advertised frame rate.
    pub fps: Option<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            nickname: "Unknown Server".to_string(),
            resolution: None,
            fps: None,
        }
    }
}

impl ServerInfo {
    /// Build the metadata a producer announces.
    pub fn new(nickname: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            nickname: nickname.into(),
            resolution: Some(format!("{}x{}", width, height)),
            fps: Some(fps.to_string()),
        }
    }

    /// Encode as announcement metadata bytes.
    pub fn encode(&self) -> Bytes {
        let mut out = format!("nickname:{}", self.nickname);
        if let Some(ref res) = self.resolution {
            out.push_str(&format!(";res:{}", res));
        }
        if let Some(ref fps) = self.fps {
            out.push_str(&format!(";fps:{}", fps));
        }
        Bytes::from(out)
    }

    /// Parse announcement metadata.
    ///
    /// Never fails: malformed input yields the defaults, unknown keys are
    /// ignored so older consumers keep working when producers add fields.
    pub fn parse(metadata: &[u8]) -> ServerInfo {
        let mut info = ServerInfo::default();

        let text = match std::str::from_utf8(metadata) {
            Ok(text) => text,
            Err(_) => {
                tracing::warn!("Announcement metadata is not valid UTF-8, ignoring");
                return info;
            }
        };

        for part in text.split(';') {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            match key {
                "nickname" => info.nickname = value.to_string(),
                "res" => info.resolution = Some(value.to_string()),
                "fps" => info.fps = Some(value.to_string()),
                _ => {}
            }
        }

        info
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.nickname)?;
        if let Some(ref res) = self.resolution {
            write!(f, " ({}", res)?;
            if let Some(ref fps) = self.fps {
                write!(f, " @ {}fps", fps)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let info = ServerInfo::new("LivingRoom", 1280, 720, 20);
        let encoded = info.encode();
        assert_eq!(&encoded[..], b"nickname:LivingRoom;res:1280x720;fps:20");

        let parsed = ServerInfo::parse(&encoded);
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_parse_defaults_on_garbage() {
        let parsed = ServerInfo::parse(b"not-a-metadata-string");
        assert_eq!(parsed.nickname, "Unknown Server");
        assert!(parsed.resolution.is_none());
        assert!(parsed.fps.is_none());

        let parsed = ServerInfo::parse(&[0xff, 0xfe, 0x00]);
        assert_eq!(parsed.nickname, "Unknown Server");
    }

    #[test]
    fn test_parse_skips_unknown_keys() {
        let parsed = ServerInfo::parse(b"nickname:Attic;codec:h264;fps:30");
        assert_eq!(parsed.nickname, "Attic");
        assert_eq!(parsed.fps.as_deref(), Some("30"));
        assert!(parsed.resolution.is_none());
    }

    #[test]
    fn test_nickname_may_contain_colons() {
        // split_once: only the first colon separates key from value
        let parsed = ServerInfo::parse(b"nickname:rack:4:unit:2");
        assert_eq!(parsed.nickname, "rack:4:unit:2");
    }
}
