//! Producer role
//!
//! Announces a service address, admits consumer links against a capacity
//! cap, and relays the shared encoder's output to each admitted session
//! with in-band heartbeats.

pub mod config;
pub mod registry;
pub(crate) mod relay;

pub use config::{parse_resolution, ServerConfig, StreamSettings};
pub use registry::{Admission, SessionRegistry, SessionStats};

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transport::{LinkEvent, LinkEvents, Transport};

/// Relay server: one shared encoder, many consumer sessions.
pub struct RelayServer<T: Transport> {
    transport: Arc<T>,
    registry: Arc<SessionRegistry>,
}

impl<T: Transport> RelayServer<T> {
    /// Create a server. Fails fast on invalid configuration, before any
    /// link or subprocess exists.
    pub fn new(transport: Arc<T>, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            registry: Arc::new(SessionRegistry::new(config)),
        })
    }

    /// Get a reference to the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run the server.
    ///
    /// This method completes only if the transport substrate goes away.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` completes, then tear down every
    /// session and stop the encoder.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let config = self.registry.config().clone();
        let mut events = self.transport.listen(&config.address);

        let resolution = format!("{}x{}", config.settings.width, config.settings.height);
        tracing::info!(
            service = %config.address,
            nickname = %config.nickname,
            resolution = %resolution,
            fps = config.settings.fps,
            max_clients = config.settings.max_clients,
            "Relay server listening"
        );

        let announce_handle = self.spawn_announce_task();
        let heartbeat_handle = self.registry.spawn_heartbeat_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.event_loop(&mut events) => result,
        };

        announce_handle.abort();
        heartbeat_handle.abort();
        self.registry.shutdown().await;

        result
    }

    async fn event_loop(&self, events: &mut LinkEvents) -> Result<()> {
        loop {
            match events.recv().await {
                Some(LinkEvent::Established(link)) => {
                    tracing::debug!(link = %link.id(), remote = %link.remote(), "Link request");
                    self.registry.on_link_established(link).await;
                }
                Some(LinkEvent::Packet { link, payload }) => {
                    self.registry.on_packet(link, &payload).await;
                }
                Some(LinkEvent::Closed(link)) => {
                    self.registry.on_link_closed(link).await;
                }
                None => {
                    tracing::error!("Transport event stream ended");
                    return Err(Error::TransportClosed);
                }
            }
        }
    }

    /// Periodically re-announce the service so late consumers find it.
    fn spawn_announce_task(&self) -> tokio::task::JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let config = self.registry.config().clone();
        let metadata = config.server_info().encode();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.announce_interval);
            loop {
                // First tick fires immediately: announce at startup
                ticker.tick().await;
                tracing::debug!(service = %config.address, "Announcing service");
                transport.announce(&config.address, metadata.clone());
            }
        })
    }
}
