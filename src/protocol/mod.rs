//! Application-level wire protocol
//!
//! Everything that crosses a link besides raw media bytes: the in-band
//! heartbeat/control tokens and the announcement metadata format. Both sides
//! of a deployment must agree on these byte-for-byte.

pub mod control;
pub mod metadata;

pub use control::{ControlMessage, CAPACITY_EXCEEDED, PING, PONG};
pub use metadata::ServerInfo;
