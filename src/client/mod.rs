//! Consumer role
//!
//! Discovers a producer by aspect, connects, feeds the stream to a local
//! decoder process, answers heartbeats, and re-enters discovery after a
//! delay whenever the connection goes away.

pub mod config;
pub mod machine;

pub use config::ClientConfig;
pub use machine::{ClientState, DiscoveryMachine, Effect, MachineEvent};

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::media::MediaProcess;
use crate::protocol::control::{self, ControlMessage};
use crate::protocol::ServerInfo;
use crate::transport::{Announcement, Announcements, Link, LinkEvent, LinkEvents, Transport};

/// Notifications for embedders (UIs, demos); consuming them is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Discovery started (or restarted).
    Discovering,
    /// Link up and decoder running.
    Connected { nickname: String },
    /// Connection lost; a reconnect is scheduled.
    Disconnected,
    /// The producer refused us for capacity.
    Refused,
    /// The client stopped for good.
    Stopped,
}

/// Relay client: discover, connect, play, reconnect.
pub struct RelayClient<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    events_tx: mpsc::Sender<ClientEvent>,
}

impl<T: Transport> RelayClient<T> {
    /// Create a client.
    ///
    /// Returns the client and a receiver for [`ClientEvent`]s. Fails fast
    /// on invalid configuration.
    pub fn new(
        transport: Arc<T>,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(64);
        Ok((
            Self {
                transport,
                config,
                events_tx,
            },
            events_rx,
        ))
    }

    /// Run the client.
    ///
    /// This method completes only if the transport substrate goes away.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the client until `shutdown` completes, then tear everything
    /// down: filter, link and decoder.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        Driver {
            transport: self.transport,
            config: self.config,
            events_tx: self.events_tx,
            machine: DiscoveryMachine::new(),
            announcements: None,
            link_events: None,
            link: None,
            decoder: None,
            reconnect_at: None,
            discovery_deadline: None,
        }
        .run(shutdown)
        .await
    }
}

/// What woke the driver up.
enum Wake {
    Shutdown,
    Announcement(Option<Announcement>),
    Link(Option<LinkEvent>),
    ReconnectDue,
    DiscoveryTimeout,
}

/// The single task that owns the current link and the decoder handle.
/// Machine transitions and packet handling both run here, so no other
/// synchronization around them is needed.
struct Driver<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    events_tx: mpsc::Sender<ClientEvent>,
    machine: DiscoveryMachine,
    announcements: Option<Announcements>,
    link_events: Option<LinkEvents>,
    link: Option<Arc<dyn Link>>,
    decoder: Option<Arc<MediaProcess>>,
    reconnect_at: Option<Instant>,
    discovery_deadline: Option<Instant>,
}

impl<T: Transport> Driver<T> {
    async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let effects = self.machine.handle(MachineEvent::Start);
        self.apply(effects).await;

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                ann = next_announcement(&mut self.announcements) => Wake::Announcement(ann),
                ev = next_link_event(&mut self.link_events) => Wake::Link(ev),
                _ = sleep_until_opt(self.reconnect_at) => Wake::ReconnectDue,
                _ = sleep_until_opt(self.discovery_deadline) => Wake::DiscoveryTimeout,
            };

            match wake {
                Wake::Shutdown => {
                    tracing::info!("Shutdown signal received");
                    let effects = self.machine.handle(MachineEvent::Stop);
                    self.apply(effects).await;
                    let _ = self.events_tx.send(ClientEvent::Stopped).await;
                    return Ok(());
                }

                Wake::Announcement(Some(announcement)) => {
                    let info = ServerInfo::parse(&announcement.metadata);
                    let effects = self.machine.handle(MachineEvent::Announcement {
                        source: announcement.source,
                        info,
                    });
                    self.apply(effects).await;
                }
                Wake::Announcement(None) => {
                    tracing::error!("Announcement stream ended, transport is gone");
                    let effects = self.machine.handle(MachineEvent::Stop);
                    self.apply(effects).await;
                    return Err(Error::TransportClosed);
                }

                Wake::Link(Some(event)) => self.on_link_event(event).await,
                Wake::Link(None) => {
                    // The per-link stream drains after Closed; nothing
                    // more will arrive on it
                    self.link_events = None;
                }

                Wake::ReconnectDue => {
                    self.reconnect_at = None;
                    let effects = self.machine.handle(MachineEvent::ReconnectDue);
                    self.apply(effects).await;
                }

                Wake::DiscoveryTimeout => {
                    self.discovery_deadline = None;
                    tracing::warn!(
                        aspect = %self.config.aspect,
                        timeout = ?self.config.discovery_timeout,
                        "No producers found yet, still listening for announcements"
                    );
                }
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Established(link) => {
                tracing::info!(
                    link = %link.id(),
                    remote = %link.remote(),
                    "Link established, waiting for stream data"
                );
                self.link = Some(link);
                let effects = self.machine.handle(MachineEvent::LinkEstablished);
                self.apply(effects).await;
            }
            LinkEvent::Packet { payload, .. } => match ControlMessage::classify(&payload) {
                Some(ControlMessage::Ping) => {
                    tracing::trace!("PING received, answering with PONG");
                    if let Some(ref link) = self.link {
                        if let Err(e) = link.send(control::pong()) {
                            tracing::warn!(error = %e, "Failed to send PONG");
                        }
                    }
                }
                Some(ControlMessage::Pong) => {
                    tracing::trace!("Unsolicited PONG, ignoring");
                }
                Some(ControlMessage::CapacityExceeded) => {
                    let _ = self.events_tx.send(ClientEvent::Refused).await;
                    let effects = self.machine.handle(MachineEvent::CapacityRefused);
                    self.apply(effects).await;
                }
                None => self.on_media(&payload).await,
            },
            LinkEvent::Closed(id) => {
                tracing::info!(link = %id, "Link closed");
                let effects = self.machine.handle(MachineEvent::LinkClosed);
                self.apply(effects).await;
            }
        }
    }

    /// Feed a media payload to the decoder.
    async fn on_media(&mut self, payload: &[u8]) {
        let failed = match self.decoder {
            Some(ref decoder) => match decoder.write_all(payload).await {
                Ok(()) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "Decoder pipe broken, likely closed by the user");
                    true
                }
            },
            // Media keeps arriving but the renderer is gone: drop the
            // connection rather than the bytes
            None => self.machine.state() == ClientState::Connected,
        };

        if failed {
            let effects = self.machine.handle(MachineEvent::DecoderFailed);
            self.apply(effects).await;
        }
    }

    /// Execute machine effects in order. Effects may produce follow-up
    /// events (a decoder that fails to start), which are queued rather
    /// than recursed into.
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::StartDiscovery => {
                    tracing::info!(aspect = %self.config.aspect, "Searching for producers");
                    self.announcements = Some(self.transport.discover(&self.config.aspect));
                    self.discovery_deadline = Some(Instant::now() + self.config.discovery_timeout);
                    let _ = self.events_tx.send(ClientEvent::Discovering).await;
                }

                Effect::CancelDiscovery => {
                    self.announcements = None;
                    self.discovery_deadline = None;
                }

                Effect::OpenLink { source } => {
                    tracing::info!(remote = %source, "Connecting to producer");
                    self.link_events = Some(self.transport.open_link(source));
                    self.discovery_deadline = None;
                }

                Effect::StartDecoder { nickname } => {
                    if let Some(ref decoder) = self.decoder {
                        if decoder.is_alive().await {
                            tracing::debug!("Decoder already running");
                            continue;
                        }
                        self.decoder = None;
                    }

                    let command = self.config.decoder(&nickname);
                    tracing::info!(command = %command, "Starting decoder");
                    match MediaProcess::spawn_decoder(&command) {
                        Ok(decoder) => {
                            self.decoder = Some(decoder);
                            let _ = self
                                .events_tx
                                .send(ClientEvent::Connected { nickname })
                                .await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to start decoder, dropping link");
                            for follow_up in self.machine.handle(MachineEvent::DecoderFailed) {
                                queue.push_back(follow_up);
                            }
                        }
                    }
                }

                Effect::StopDecoder => {
                    if let Some(decoder) = self.decoder.take() {
                        decoder.stop(self.config.decoder_stop_grace).await;
                    }
                }

                Effect::TeardownLink => {
                    if let Some(ref link) = self.link {
                        link.teardown();
                    }
                }

                Effect::ScheduleReconnect => {
                    self.link = None;
                    self.link_events = None;
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                    tracing::info!(
                        delay = ?self.config.reconnect_delay,
                        "Rediscovering producers after delay"
                    );
                    let _ = self.events_tx.send(ClientEvent::Disconnected).await;
                }
            }
        }
    }
}

async fn next_announcement(slot: &mut Option<Announcements>) -> Option<Announcement> {
    match slot {
        Some(announcements) => announcements.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(slot: &mut Option<LinkEvents>) -> Option<LinkEvent> {
    match slot {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
