//! # meshcast-rs
//!
//! Relays a live encoded media stream from one producing host to many
//! consuming hosts over an identity-addressed, message-oriented transport,
//! with in-band heartbeats, admission control and automatic reconnection.
//!
//! The transport substrate (identity addressing, encrypted links, service
//! announcements) and the media codecs (an encoder writing a byte stream to
//! stdout, a decoder reading one from stdin) are external collaborators;
//! this crate manages *when* a byte pump between them exists, *who* is
//! allowed to use it, and *how* failures are detected and recovered.
//!
//! # Architecture
//!
//! ```text
//!   producer                                   consumer
//!   ┌─────────────────────────┐                ┌───────────────────────┐
//!   │ encoder ─► RelayServer  │   announce     │ RelayClient ─► decoder│
//!   │   pipe     ┌──────────┐ │ ─────────────► │  ┌─────────────────┐  │
//!   │            │ Session  │ │   links        │  │ DiscoveryMachine│  │
//!   │            │ Registry │ │ ◄════════════► │  │ (reconnect)     │  │
//!   │            └──────────┘ │  media + PING/ │  └─────────────────┘  │
//!   │  one relay loop per     │  PONG in-band  │  PONG replies, writes │
//!   │  admitted session       │                │  to the decoder pipe  │
//!   └─────────────────────────┘                └───────────────────────┘
//! ```
//!
//! The server admits each established link against `max_clients`, runs the
//! shared encoder exactly while sessions exist, and evicts consumers whose
//! PONGs stop. The client discovers producers by aspect, plays the stream,
//! and goes back to discovery after `reconnect_delay` when the link drops.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshcast_rs::client::{ClientConfig, RelayClient};
//! use meshcast_rs::server::{RelayServer, ServerConfig, StreamSettings};
//! use meshcast_rs::transport::{Identity, MemoryHub};
//!
//! # async fn example() -> meshcast_rs::Result<()> {
//! let hub = MemoryHub::new();
//!
//! let server_config = ServerConfig::default()
//!     .nickname("LivingRoom")
//!     .settings(StreamSettings::default().max_clients(4));
//! let server = RelayServer::new(hub.endpoint(&Identity::generate()), server_config)?;
//! tokio::spawn(async move { server.run().await });
//!
//! let (client, mut events) = RelayClient::new(
//!     hub.endpoint(&Identity::generate()),
//!     ClientConfig::default(),
//! )?;
//! tokio::spawn(async move { client.run().await });
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, ClientEvent, RelayClient};
pub use error::{Error, Result};
pub use media::{MediaCommand, MediaProcess};
pub use server::{RelayServer, ServerConfig, SessionRegistry, StreamSettings};
pub use transport::{Identity, Link, LinkEvent, ServiceAddress, Transport};
