//! Session registry and admission control
//!
//! One session per admitted consumer link, plus the reference-counted
//! lifecycle of the single shared encoder: it runs exactly while the
//! registry is non-empty. Sessions, the admission count and the encoder
//! identity are all guarded by one lock so concurrent link events can never
//! race on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::media::MediaProcess;
use crate::protocol::control::{self, ControlMessage};
use crate::transport::{Link, LinkId};

use super::config::ServerConfig;
use super::relay;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Capacity reached (or the encoder would not start); the link was
    /// refused and torn down.
    Refused,
}

/// Bookkeeping for one admitted consumer link.
pub(crate) struct Session {
    pub(crate) link: Arc<dyn Link>,
    created_at: Instant,
    /// Only ever moves forward: set at creation, then on each PONG.
    last_pong_at: Instant,
    bytes_sent: Arc<AtomicU64>,
}

/// Point-in-time view of one session, for operators and tests.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub link: LinkId,
    pub connected_for: Duration,
    pub last_pong_age: Duration,
    pub bytes_sent: u64,
}

struct RegistryInner {
    sessions: HashMap<LinkId, Session>,
    /// The shared encoder. Present iff `sessions` is non-empty (observed at
    /// quiescent points; transitions happen under the registry lock).
    encoder: Option<Arc<MediaProcess>>,
}

/// Central registry for all admitted consumer sessions.
pub struct SessionRegistry {
    config: ServerConfig,
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                encoder: None,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Admit or refuse a freshly established consumer link.
    ///
    /// On admission the shared encoder is started if needed and a relay
    /// loop is spawned for the session. On refusal the capacity token is
    /// sent best-effort and the link is torn down; no session is created.
    pub async fn on_link_established(self: &Arc<Self>, link: Arc<dyn Link>) -> Admission {
        let max_clients = self.config.settings.max_clients;
        let mut inner = self.inner.lock().await;

        if inner.sessions.contains_key(&link.id()) {
            tracing::warn!(link = %link.id(), "Duplicate establish event for admitted link");
            return Admission::Accepted;
        }

        if max_clients > 0 && inner.sessions.len() >= max_clients {
            tracing::warn!(
                link = %link.id(),
                max_clients = max_clients,
                "Admission refused: client limit reached"
            );
            if let Err(e) = link.send(control::capacity_exceeded()) {
                tracing::debug!(link = %link.id(), error = %e, "Could not send capacity notice");
            }
            link.teardown();
            return Admission::Refused;
        }

        let encoder = match self.ensure_encoder(&mut inner).await {
            Some(encoder) => encoder,
            None => {
                tracing::error!(link = %link.id(), "Encoder unavailable, refusing admission");
                link.teardown();
                return Admission::Refused;
            }
        };

        let bytes_sent = Arc::new(AtomicU64::new(0));
        let now = Instant::now();
        inner.sessions.insert(
            link.id(),
            Session {
                link: Arc::clone(&link),
                created_at: now,
                last_pong_at: now,
                bytes_sent: Arc::clone(&bytes_sent),
            },
        );

        tracing::info!(
            link = %link.id(),
            remote = %link.remote(),
            sessions = inner.sessions.len(),
            "Session admitted"
        );

        relay::spawn(Arc::clone(self), link, encoder, bytes_sent);
        Admission::Accepted
    }

    /// Start the shared encoder if it is absent or dead.
    async fn ensure_encoder(&self, inner: &mut RegistryInner) -> Option<Arc<MediaProcess>> {
        if let Some(ref encoder) = inner.encoder {
            if encoder.is_alive().await {
                return Some(Arc::clone(encoder));
            }
            tracing::warn!(pid = encoder.pid(), "Shared encoder died, restarting");
            encoder.stop(Duration::ZERO).await;
            inner.encoder = None;
        }

        let command = self.config.encoder();
        tracing::info!(command = %command, "Starting shared encoder");
        let encoder = match MediaProcess::spawn_encoder(&command) {
            Ok(encoder) => encoder,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start encoder");
                return None;
            }
        };
        if let Err(e) = encoder.ensure_running(self.config.encoder_start_grace).await {
            tracing::error!(error = %e, "Encoder did not survive startup");
            encoder.stop(Duration::ZERO).await;
            return None;
        }

        inner.encoder = Some(Arc::clone(&encoder));
        Some(encoder)
    }

    /// Handle an inbound payload on a session link.
    ///
    /// Session links carry only control messages inbound, never media.
    pub async fn on_packet(&self, link: LinkId, payload: &[u8]) {
        match ControlMessage::classify(payload) {
            Some(ControlMessage::Pong) => {
                let mut inner = self.inner.lock().await;
                match inner.sessions.get_mut(&link) {
                    Some(session) => {
                        session.last_pong_at = Instant::now();
                        tracing::trace!(link = %link, "PONG received");
                    }
                    None => {
                        tracing::warn!(link = %link, "PONG for unknown or inactive link");
                    }
                }
            }
            Some(ControlMessage::Ping) => {
                // Symmetric heartbeat: whoever receives a PING answers it
                let inner = self.inner.lock().await;
                if let Some(session) = inner.sessions.get(&link) {
                    if let Err(e) = session.link.send(control::pong()) {
                        tracing::debug!(link = %link, error = %e, "Could not answer PING");
                    }
                }
            }
            Some(ControlMessage::CapacityExceeded) | None => {
                tracing::warn!(
                    link = %link,
                    bytes = payload.len(),
                    "Unexpected payload on session link, ignoring"
                );
            }
        }
    }

    /// Remove the session for a closed link. Stops the shared encoder when
    /// the last session goes away. A no-op for unknown links.
    pub async fn on_link_closed(&self, link: LinkId) {
        let (removed, encoder) = {
            let mut inner = self.inner.lock().await;
            let removed = inner.sessions.remove(&link);
            let encoder = if removed.is_some() && inner.sessions.is_empty() {
                inner.encoder.take()
            } else {
                None
            };
            (removed, encoder)
        };

        if let Some(session) = removed {
            tracing::info!(
                link = %link,
                bytes_sent = session.bytes_sent.load(Ordering::Relaxed),
                connected_for = ?session.created_at.elapsed(),
                "Session removed"
            );
        }
        if let Some(encoder) = encoder {
            tracing::info!("No active sessions, stopping shared encoder");
            encoder.stop(Duration::ZERO).await;
        }
    }

    /// Whether the relay loop started against encoder `pid` is still
    /// pumping the registry's current, living encoder.
    pub(crate) async fn encoder_matches(&self, pid: u32) -> bool {
        let inner = self.inner.lock().await;
        match inner.encoder {
            Some(ref encoder) if encoder.pid() == pid => encoder.is_alive().await,
            _ => false,
        }
    }

    /// Tear down sessions whose last PONG is older than the heartbeat
    /// timeout. Removal itself happens via the link-closed event, so a
    /// concurrent relay-loop teardown is harmless.
    pub async fn evict_unresponsive(&self) {
        let timeout = self.config.settings.heartbeat_timeout;
        let stale: Vec<Arc<dyn Link>> = {
            let inner = self.inner.lock().await;
            inner
                .sessions
                .values()
                .filter(|s| s.last_pong_at.elapsed() > timeout)
                .map(|s| Arc::clone(&s.link))
                .collect()
        };

        for link in stale {
            tracing::warn!(link = %link.id(), "Heartbeat timeout, tearing down session link");
            link.teardown();
        }
    }

    /// Spawn the periodic heartbeat scanner.
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_heartbeat_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        // Scan more often than the timeout itself so evictions are timely
        let period = registry.config.settings.heartbeat_interval / 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.evict_unresponsive().await;
            }
        })
    }

    /// Tear down every session and stop the encoder. The only path that
    /// does this unconditionally; used at process shutdown.
    pub async fn shutdown(&self) {
        let (links, encoder) = {
            let mut inner = self.inner.lock().await;
            let links: Vec<Arc<dyn Link>> = inner
                .sessions
                .drain()
                .map(|(_, s)| s.link)
                .collect();
            (links, inner.encoder.take())
        };

        for link in &links {
            link.teardown();
        }
        if let Some(encoder) = encoder {
            encoder.stop(Duration::ZERO).await;
        }
        tracing::info!(sessions = links.len(), "Registry shut down");
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn has_encoder(&self) -> bool {
        self.inner.lock().await.encoder.is_some()
    }

    /// Snapshot of all live sessions.
    pub async fn session_stats(&self) -> Vec<SessionStats> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .map(|(id, s)| SessionStats {
                link: *id,
                connected_for: s.created_at.elapsed(),
                last_pong_age: s.last_pong_at.elapsed(),
                bytes_sent: s.bytes_sent.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;

    use crate::media::MediaCommand;
    use crate::server::StreamSettings;
    use crate::transport::{AddressHash, LinkStatus, SendError};

    use super::*;

    /// A link that records what happens to it.
    struct StubLink {
        id: LinkId,
        closed: AtomicBool,
        sent: StdMutex<Vec<Bytes>>,
    }

    impl StubLink {
        fn new(raw: u64) -> Arc<Self> {
            Arc::new(Self {
                id: LinkId::from_raw(raw),
                closed: AtomicBool::new(false),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent_payloads(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Link for StubLink {
        fn id(&self) -> LinkId {
            self.id
        }

        fn remote(&self) -> AddressHash {
            AddressHash::from_bytes([0u8; 16])
        }

        fn status(&self) -> LinkStatus {
            if self.is_closed() {
                LinkStatus::Closed
            } else {
                LinkStatus::Active
            }
        }

        fn send(&self, payload: Bytes) -> Result<(), SendError> {
            if self.is_closed() {
                return Err(SendError::NotActive);
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        fn teardown(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn test_config(max_clients: usize) -> ServerConfig {
        ServerConfig::default()
            .settings(
                StreamSettings::default()
                    .max_clients(max_clients)
                    .heartbeat(Duration::from_millis(40), Duration::from_millis(120)),
            )
            // Produces nothing but stays alive, like a capture source with
            // no frames yet
            .encoder_command(MediaCommand::new("sleep", ["30"]))
            .encoder_start_grace(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_admission_within_cap() {
        let registry = Arc::new(SessionRegistry::new(test_config(2)));

        let a = StubLink::new(1);
        let b = StubLink::new(2);
        assert_eq!(
            registry.on_link_established(a.clone()).await,
            Admission::Accepted
        );
        assert_eq!(
            registry.on_link_established(b.clone()).await,
            Admission::Accepted
        );

        assert_eq!(registry.session_count().await, 2);
        assert!(registry.has_encoder().await);
        assert!(!a.is_closed());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_admission_over_cap_sends_token_and_tears_down() {
        let registry = Arc::new(SessionRegistry::new(test_config(1)));

        let a = StubLink::new(1);
        let b = StubLink::new(2);
        assert_eq!(
            registry.on_link_established(a.clone()).await,
            Admission::Accepted
        );
        assert_eq!(
            registry.on_link_established(b.clone()).await,
            Admission::Refused
        );

        assert_eq!(registry.session_count().await, 1);
        assert!(b.is_closed());
        assert_eq!(
            b.sent_payloads(),
            vec![Bytes::from_static(control::CAPACITY_EXCEEDED)]
        );
        // The admitted link is untouched
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn test_encoder_exists_iff_sessions_exist() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));
        assert!(!registry.has_encoder().await);

        let a = StubLink::new(1);
        registry.on_link_established(a.clone()).await;
        assert!(registry.has_encoder().await);

        registry.on_link_closed(a.id()).await;
        assert_eq!(registry.session_count().await, 0);
        assert!(!registry.has_encoder().await);
    }

    #[tokio::test]
    async fn test_close_twice_is_a_noop() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));

        let a = StubLink::new(1);
        registry.on_link_established(a.clone()).await;
        registry.on_link_closed(a.id()).await;
        registry.on_link_closed(a.id()).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_encoder_start_failure_refuses_admission() {
        let config = test_config(0)
            .encoder_command(MediaCommand::new("definitely-not-a-real-binary-aa51", ["x"]));
        let registry = Arc::new(SessionRegistry::new(config));

        let a = StubLink::new(1);
        assert_eq!(
            registry.on_link_established(a.clone()).await,
            Admission::Refused
        );
        assert!(a.is_closed());
        assert_eq!(registry.session_count().await, 0);
        assert!(!registry.has_encoder().await);
    }

    #[tokio::test]
    async fn test_pong_refreshes_session() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));

        let a = StubLink::new(1);
        registry.on_link_established(a.clone()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.on_packet(a.id(), control::PONG).await;

        let stats = registry.session_stats().await;
        assert_eq!(stats.len(), 1);
        assert!(stats[0].last_pong_age < Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));

        let a = StubLink::new(1);
        registry.on_link_established(a.clone()).await;
        registry.on_packet(a.id(), control::PING).await;

        assert!(a
            .sent_payloads()
            .contains(&Bytes::from_static(control::PONG)));
    }

    #[tokio::test]
    async fn test_media_payload_on_session_link_is_ignored() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));

        let a = StubLink::new(1);
        registry.on_link_established(a.clone()).await;
        registry.on_packet(a.id(), &[0x47, 0x00, 0x11]).await;

        // Still admitted, nothing happened to the link
        assert_eq!(registry.session_count().await, 1);
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn test_eviction_after_heartbeat_timeout_not_before() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));

        let a = StubLink::new(1);
        registry.on_link_established(a.clone()).await;

        // Well inside the 120 ms timeout: no eviction
        tokio::time::sleep(Duration::from_millis(40)).await;
        registry.evict_unresponsive().await;
        assert!(!a.is_closed());

        // Past the timeout with no PONG: torn down
        tokio::time::sleep(Duration::from_millis(120)).await;
        registry.evict_unresponsive().await;
        assert!(a.is_closed());

        // Removal happens via the closed event, as in production
        registry.on_link_closed(a.id()).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let registry = Arc::new(SessionRegistry::new(test_config(0)));

        let a = StubLink::new(1);
        let b = StubLink::new(2);
        registry.on_link_established(a.clone()).await;
        registry.on_link_established(b.clone()).await;

        registry.shutdown().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.session_count().await, 0);
        assert!(!registry.has_encoder().await);
    }
}
