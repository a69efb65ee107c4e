//! In-process transport
//!
//! A hub that routes announcements and links between endpoints living in the
//! same process. It exists so the relay core, the integration tests and the
//! demos can run without a real network substrate; it makes no attempt at
//! confidentiality or path selection.
//!
//! Links establish synchronously, so `Pending` is never observed here; the
//! ordering and single-`Closed`-event guarantees of the facade are kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    AddressHash, Announcement, Announcements, Identity, Link, LinkEvent, LinkEvents, LinkId,
    LinkStatus, SendError, ServiceAddress, Transport,
};

/// Routes announcements and link requests between [`MemoryTransport`]
/// endpoints.
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    /// Listening destinations, keyed by their address hash.
    listeners: HashMap<AddressHash, Listener>,
    /// Active aspect filters.
    watchers: Vec<Watcher>,
}

struct Listener {
    address: ServiceAddress,
    events: mpsc::UnboundedSender<LinkEvent>,
}

struct Watcher {
    aspect: String,
    tx: mpsc::UnboundedSender<Announcement>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
        })
    }

    /// Create an endpoint for `identity` attached to this hub.
    pub fn endpoint(self: &Arc<Self>, identity: &Identity) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            hub: Arc::clone(self),
            address: identity.address_hash(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        // Hub state is plain data; a poisoned lock only happens after a
        // panic elsewhere, at which point tests are failing anyway.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One endpoint attached to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    address: AddressHash,
}

impl Transport for MemoryTransport {
    fn address_hash(&self) -> AddressHash {
        self.address
    }

    fn announce(&self, address: &ServiceAddress, metadata: Bytes) {
        let mut inner = self.hub.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &inner.watchers {
            if watcher.aspect == address.aspect {
                let _ = watcher.tx.send(Announcement {
                    source: self.address,
                    app_name: address.app_name.clone(),
                    aspects: vec![address.aspect.clone()],
                    metadata: metadata.clone(),
                });
            }
        }
    }

    fn discover(&self, aspect: &str) -> Announcements {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.lock().watchers.push(Watcher {
            aspect: aspect.to_string(),
            tx,
        });
        Announcements::new(rx)
    }

    fn listen(&self, address: &ServiceAddress) -> LinkEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.lock().listeners.insert(
            self.address,
            Listener {
                address: address.clone(),
                events: tx,
            },
        );
        LinkEvents::new(rx)
    }

    fn open_link(&self, remote: AddressHash) -> LinkEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = LinkId::from_raw(rand::random());

        let inner = self.hub.lock();
        let Some(listener) = inner.listeners.get(&remote) else {
            // No such destination: the attempt never establishes.
            let _ = tx.send(LinkEvent::Closed(id));
            return LinkEvents::new(rx);
        };
        if listener.events.is_closed() {
            let _ = tx.send(LinkEvent::Closed(id));
            return LinkEvents::new(rx);
        }

        tracing::debug!(
            link = %id,
            remote = %remote,
            service = %listener.address,
            "Opening in-memory link"
        );

        let closed = Arc::new(AtomicBool::new(false));

        let near: Arc<dyn Link> = Arc::new(MemoryLink {
            id,
            remote,
            closed: Arc::clone(&closed),
            peer: listener.events.clone(),
            own: tx.clone(),
        });
        let far: Arc<dyn Link> = Arc::new(MemoryLink {
            id,
            remote: self.address,
            closed,
            peer: tx.clone(),
            own: listener.events.clone(),
        });

        let _ = listener.events.send(LinkEvent::Established(far));
        let _ = tx.send(LinkEvent::Established(near));

        LinkEvents::new(rx)
    }
}

/// One end of an in-memory link. Both ends share the closed flag, so a
/// teardown from either side is observed by both.
struct MemoryLink {
    id: LinkId,
    remote: AddressHash,
    closed: Arc<AtomicBool>,
    /// Event stream of the remote end, receives our packets.
    peer: mpsc::UnboundedSender<LinkEvent>,
    /// Event stream of this end, receives our own `Closed`.
    own: mpsc::UnboundedSender<LinkEvent>,
}

impl Link for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote(&self) -> AddressHash {
        self.remote
    }

    fn status(&self) -> LinkStatus {
        if self.closed.load(Ordering::SeqCst) {
            LinkStatus::Closed
        } else {
            LinkStatus::Active
        }
    }

    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::NotActive);
        }
        self.peer
            .send(LinkEvent::Packet {
                link: self.id,
                payload,
            })
            .map_err(|_| SendError::PeerGone)
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(link = %self.id, "Link teardown");
        let _ = self.own.send(LinkEvent::Closed(self.id));
        let _ = self.peer.send(LinkEvent::Closed(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceAddress {
        ServiceAddress::new("meshcast", "video_stream/test")
    }

    #[tokio::test]
    async fn test_announce_reaches_matching_watcher() {
        let hub = MemoryHub::new();
        let server = hub.endpoint(&Identity::generate());
        let client = hub.endpoint(&Identity::generate());

        let mut matching = client.discover("video_stream/test");
        let mut other = client.discover("something/else");

        server.announce(&service(), Bytes::from_static(b"nickname:t"));

        let ann = matching.recv().await.expect("announcement");
        assert_eq!(ann.source, server.address_hash());
        assert_eq!(ann.app_name, "meshcast");
        assert_eq!(&ann.metadata[..], b"nickname:t");

        // The non-matching watcher saw nothing
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(20),
            other.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_link_pair_exchanges_packets() {
        let hub = MemoryHub::new();
        let server = hub.endpoint(&Identity::generate());
        let client = hub.endpoint(&Identity::generate());

        let mut incoming = server.listen(&service());
        let mut outgoing = client.open_link(server.address_hash());

        let server_link = match incoming.recv().await {
            Some(LinkEvent::Established(link)) => link,
            other => panic!("expected Established, got {:?}", other),
        };
        let client_link = match outgoing.recv().await {
            Some(LinkEvent::Established(link)) => link,
            other => panic!("expected Established, got {:?}", other),
        };
        assert_eq!(server_link.id(), client_link.id());
        assert_eq!(server_link.status(), LinkStatus::Active);

        server_link.send(Bytes::from_static(b"chunk")).unwrap();
        match outgoing.recv().await {
            Some(LinkEvent::Packet { payload, .. }) => assert_eq!(&payload[..], b"chunk"),
            other => panic!("expected Packet, got {:?}", other),
        }

        client_link.send(Bytes::from_static(b"pong")).unwrap();
        match incoming.recv().await {
            Some(LinkEvent::Packet { payload, .. }) => assert_eq!(&payload[..], b"pong"),
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_closes_both_ends() {
        let hub = MemoryHub::new();
        let server = hub.endpoint(&Identity::generate());
        let client = hub.endpoint(&Identity::generate());

        let mut incoming = server.listen(&service());
        let mut outgoing = client.open_link(server.address_hash());

        let server_link = match incoming.recv().await {
            Some(LinkEvent::Established(link)) => link,
            other => panic!("expected Established, got {:?}", other),
        };
        let Some(LinkEvent::Established(client_link)) = outgoing.recv().await else {
            panic!("expected Established");
        };

        client_link.teardown();
        client_link.teardown();
        server_link.teardown();

        assert_eq!(client_link.status(), LinkStatus::Closed);
        assert_eq!(server_link.status(), LinkStatus::Closed);
        assert!(client_link.send(Bytes::from_static(b"x")).is_err());

        // Exactly one Closed per end despite three teardown calls
        assert!(matches!(outgoing.recv().await, Some(LinkEvent::Closed(_))));
        assert!(matches!(incoming.recv().await, Some(LinkEvent::Closed(_))));
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(20),
            outgoing.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_open_link_to_unknown_destination_closes() {
        let hub = MemoryHub::new();
        let client = hub.endpoint(&Identity::generate());

        let mut outgoing = client.open_link(Identity::generate().address_hash());
        assert!(matches!(outgoing.recv().await, Some(LinkEvent::Closed(_))));
    }
}
