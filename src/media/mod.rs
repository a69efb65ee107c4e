//! Media subprocess integration
//!
//! The codec work happens in external processes (ffmpeg/ffplay by default);
//! this module only manages their lifecycle and the byte pipes the relay
//! pumps. Codec parameters are configuration, not code.

pub mod command;
pub mod process;

pub use command::{MediaCommand, ENCODER_PRESETS};
pub use process::{MediaProcess, PipeRead, ProcessError};
