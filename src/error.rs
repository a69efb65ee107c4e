//! Crate error types
//!
//! Per-connection faults are handled where they occur (teardown plus a
//! state-machine transition) and never surface here; this module covers the
//! failures a caller of the library API can actually observe.

use crate::media::ProcessError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug)]
pub enum Error {
    /// Invalid configuration, rejected before any session exists.
    Config(ConfigError),
    /// A media subprocess could not be started or supervised.
    Process(ProcessError),
    /// The transport substrate went away underneath us.
    TransportClosed,
    /// Other I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(e) => write!(f, "configuration error: {}", e),
            Error::Process(e) => write!(f, "media process error: {}", e),
            Error::TransportClosed => write!(f, "transport closed"),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => Some(e),
            Error::Process(e) => Some(e),
            Error::TransportClosed => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<ProcessError> for Error {
    fn from(e: ProcessError) -> Self {
        Error::Process(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Configuration faults. Fatal at startup, before any session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Resolution string is not `WIDTHxHEIGHT`.
    InvalidResolution(String),
    /// A numeric knob is zero or out of range.
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    /// The heartbeat timeout must exceed the heartbeat interval, or every
    /// peer is perpetually about to time out.
    HeartbeatOrdering,
    /// Unknown encoder preset name.
    UnknownPreset(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidResolution(s) => {
                write!(f, "invalid resolution '{}', expected WIDTHxHEIGHT", s)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid value for {}: {}", field, reason)
            }
            ConfigError::HeartbeatOrdering => {
                write!(f, "heartbeat timeout must be greater than heartbeat interval")
            }
            ConfigError::UnknownPreset(s) => write!(f, "unknown encoder preset '{}'", s),
        }
    }
}

impl std::error::Error for ConfigError {}
