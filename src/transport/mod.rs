//! Transport facade
//!
//! The relay core is written against this narrow seam instead of a concrete
//! network stack. The substrate behind it is expected to provide identity
//! addressing, encrypted point-to-point links with ordered delivery, and
//! service discovery via aspect-filtered announcements; none of that is
//! implemented here.
//!
//! Lifecycle and packet notifications arrive as [`LinkEvent`] values on an
//! event stream rather than registered callbacks, so the role state machines
//! can be driven from plain `async` loops (and from tests, without any
//! transport at all).

pub mod memory;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::{MemoryHub, MemoryTransport};

/// A discoverable capability: application name plus aspect string.
///
/// Producers announce under a service address; consumers filter
/// announcements by the aspect part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    /// Application name, e.g. `meshcast`.
    pub app_name: String,
    /// Capability string, e.g. `video_stream/ad_feed`.
    pub aspect: String,
}

impl ServiceAddress {
    pub fn new(app_name: impl Into<String>, aspect: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            aspect: aspect.into(),
        }
    }
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_name, self.aspect)
    }
}

/// Opaque address of a remote destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressHash([u8; 16]);

impl AddressHash {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for AddressHash {
    /// Short hex form, enough to tell peers apart in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A cryptographic principal owned by this process.
///
/// Loaded once at startup and never mutated. The actual key material lives
/// in the substrate; here it is an opaque 16-byte seed persisted next to the
/// application data.
#[derive(Debug, Clone)]
pub struct Identity {
    bytes: [u8; 16],
}

impl Identity {
    /// Generate a fresh identity without persisting it.
    pub fn generate() -> Self {
        Self { bytes: rand::random() }
    }

    /// Load the identity stored at `path`, or generate and persist a new one.
    pub fn load_or_create(path: &Path) -> std::io::Result<Self> {
        match std::fs::read(path) {
            Ok(data) if data.len() >= 16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&data[..16]);
                tracing::info!(path = %path.display(), "Identity loaded from file");
                Ok(Self { bytes })
            }
            Ok(_) | Err(_) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let identity = Self::generate();
                std::fs::write(path, identity.bytes)?;
                tracing::info!(path = %path.display(), "New identity created and saved");
                Ok(identity)
            }
        }
    }

    /// The destination address derived from this identity.
    pub fn address_hash(&self) -> AddressHash {
        AddressHash(self.bytes)
    }
}

/// Identifier of one logical link, shared by both of its ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", (self.0 >> 32) as u32)
    }
}

/// Link lifecycle state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Active,
    Closed,
}

/// Error returned by [`Link::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The link is not (or no longer) active.
    NotActive,
    /// The peer side is gone and can no longer receive.
    PeerGone,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NotActive => write!(f, "link is not active"),
            SendError::PeerGone => write!(f, "peer is gone"),
        }
    }
}

impl std::error::Error for SendError {}

/// One end of an established bidirectional channel to a remote identity.
///
/// `teardown` is idempotent and is the universal cancellation signal: it
/// unblocks any relay loop still using the link and delivers exactly one
/// `Closed` event to each end.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    /// Address of the remote end.
    fn remote(&self) -> AddressHash;

    fn status(&self) -> LinkStatus;

    /// Send a payload. Fails unless the link is `Active`.
    fn send(&self, payload: Bytes) -> Result<(), SendError>;

    /// Close the link. Safe to call any number of times, from any task.
    fn teardown(&self);
}

/// Lifecycle and packet notifications for links.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A link reached `Active`. Carries the local end for send/teardown.
    Established(Arc<dyn Link>),
    /// A payload arrived on an active link.
    Packet { link: LinkId, payload: Bytes },
    /// The link closed, whether by the remote, locally, or by the substrate.
    Closed(LinkId),
}

impl std::fmt::Debug for dyn Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Link({})", self.id())
    }
}

/// An ephemeral record of a producer heard on the network.
#[derive(Debug, Clone)]
pub struct Announcement {
    /// Destination to open a link to.
    pub source: AddressHash,
    /// Application name the producer announced under.
    pub app_name: String,
    /// Aspects the producer serves.
    pub aspects: Vec<String>,
    /// Opaque metadata, see [`crate::protocol::metadata`].
    pub metadata: Bytes,
}

/// Stream of announcements matching one aspect filter.
///
/// Dropping it cancels the filter.
pub struct Announcements {
    rx: mpsc::UnboundedReceiver<Announcement>,
}

impl Announcements {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Announcement>) -> Self {
        Self { rx }
    }

    /// Next announcement, or `None` once the substrate is gone.
    pub async fn recv(&mut self) -> Option<Announcement> {
        self.rx.recv().await
    }
}

/// Stream of link events, either for all inbound links of a listening
/// destination or for a single outbound connection attempt.
pub struct LinkEvents {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the substrate is gone.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }
}

/// The substrate seam consumed by both roles.
pub trait Transport: Send + Sync + 'static {
    /// This endpoint's own destination address.
    fn address_hash(&self) -> AddressHash;

    /// Broadcast a service announcement. Fire-and-forget.
    fn announce(&self, address: &ServiceAddress, metadata: Bytes);

    /// Listen for announcements whose aspects include `aspect`.
    fn discover(&self, aspect: &str) -> Announcements;

    /// Accept inbound links addressed to `address`.
    ///
    /// All inbound link events are delivered on the returned stream.
    fn listen(&self, address: &ServiceAddress) -> LinkEvents;

    /// Open a link to a remote destination.
    ///
    /// The attempt's outcome arrives on the returned stream: `Established`
    /// on success, `Closed` if the link never comes up.
    fn open_link(&self, remote: AddressHash) -> LinkEvents;
}
