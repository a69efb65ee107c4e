//! Discovery and reconnect state machine
//!
//! Pure transitions: every lifecycle notification becomes a [`MachineEvent`],
//! `handle` maps `(state, event)` to the next state plus a list of
//! [`Effect`]s for the driver to execute. No I/O happens here, which is what
//! makes the reconnect logic testable without a transport.

use crate::protocol::ServerInfo;
use crate::transport::AddressHash;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, not yet started.
    Idle,
    /// Listening for announcements.
    Discovering,
    /// A link to a discovered producer is being established.
    Connecting,
    /// Link active, decoder running (or about to).
    Connected,
    /// Link gone; waiting out the reconnect delay.
    Disconnected,
    /// Externally stopped. Terminal.
    Stopped,
}

/// Lifecycle notifications fed to the machine.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    /// Begin discovery.
    Start,
    /// A producer announcement matching the aspect filter arrived.
    Announcement {
        source: AddressHash,
        info: ServerInfo,
    },
    /// The pending link reached `Active`.
    LinkEstablished,
    /// The current link closed (remote close, local teardown, or fault).
    LinkClosed,
    /// The decoder could not be started, or a write to it failed.
    DecoderFailed,
    /// The producer refused us for capacity.
    CapacityRefused,
    /// The reconnect delay elapsed.
    ReconnectDue,
    /// External shutdown. Terminal.
    Stop,
}

/// Side effects for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Register the announcement filter and start the discovery clock.
    StartDiscovery,
    /// Cancel the announcement filter.
    CancelDiscovery,
    /// Open a link to a discovered producer.
    OpenLink { source: AddressHash },
    /// Start the decoder, labeled with the producer's nickname.
    StartDecoder { nickname: String },
    /// Stop the decoder. Idempotent; emitted even when none is running.
    StopDecoder,
    /// Tear the current link down. Idempotent.
    TeardownLink,
    /// Arm the reconnect timer and clear the current link reference.
    ScheduleReconnect,
}

/// The client-side state machine.
#[derive(Debug)]
pub struct DiscoveryMachine {
    state: ClientState,
    /// Metadata of the producer we are connecting/connected to; kept across
    /// disconnects as the last known server info.
    server_info: Option<ServerInfo>,
}

impl DiscoveryMachine {
    pub fn new() -> Self {
        Self {
            state: ClientState::Idle,
            server_info: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Info of the most recently targeted producer.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Advance the machine. Unexpected events in a given state are
    /// swallowed: callbacks race against teardown, and a stale notification
    /// must never restart a stopped client or double-open a link.
    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        use ClientState::*;

        if self.state == Stopped {
            return Vec::new();
        }

        match event {
            MachineEvent::Start => match self.state {
                Idle => {
                    self.state = Discovering;
                    vec![Effect::StartDiscovery]
                }
                _ => Vec::new(),
            },

            MachineEvent::Announcement { source, info } => match self.state {
                Discovering => {
                    tracing::info!(producer = %info, source = %source, "Producer discovered");
                    self.state = Connecting;
                    self.server_info = Some(info);
                    vec![Effect::OpenLink { source }]
                }
                // A connection attempt is in flight or live: concurrent
                // discovery is a no-op so we never hold two links
                Connecting | Connected | Disconnected => {
                    tracing::debug!(source = %source, "Announcement ignored, connection in flight");
                    Vec::new()
                }
                Idle | Stopped => Vec::new(),
            },

            MachineEvent::LinkEstablished => match self.state {
                Connecting => {
                    self.state = Connected;
                    let nickname = self
                        .server_info
                        .as_ref()
                        .map(|info| info.nickname.clone())
                        .unwrap_or_else(|| ServerInfo::default().nickname);
                    vec![Effect::StartDecoder { nickname }]
                }
                _ => {
                    tracing::debug!(state = ?self.state, "Stale link-established notification");
                    Vec::new()
                }
            },

            MachineEvent::LinkClosed => match self.state {
                Connecting | Connected => {
                    self.state = Disconnected;
                    vec![Effect::StopDecoder, Effect::ScheduleReconnect]
                }
                _ => Vec::new(),
            },

            // A dead renderer is not recoverable mid-stream: drop the
            // connection and let the close path drive rediscovery
            MachineEvent::DecoderFailed => match self.state {
                Connected => vec![Effect::StopDecoder, Effect::TeardownLink],
                _ => Vec::new(),
            },

            MachineEvent::CapacityRefused => match self.state {
                Connecting | Connected => {
                    tracing::warn!("Producer refused us: capacity reached");
                    vec![Effect::StopDecoder, Effect::TeardownLink]
                }
                _ => Vec::new(),
            },

            MachineEvent::ReconnectDue => match self.state {
                Disconnected => {
                    self.state = Discovering;
                    vec![Effect::StartDiscovery]
                }
                _ => Vec::new(),
            },

            MachineEvent::Stop => {
                self.state = Stopped;
                vec![
                    Effect::CancelDiscovery,
                    Effect::TeardownLink,
                    Effect::StopDecoder,
                ]
            }
        }
    }
}

impl Default for DiscoveryMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(raw: u8) -> MachineEvent {
        MachineEvent::Announcement {
            source: AddressHash::from_bytes([raw; 16]),
            info: ServerInfo::new("TestServer", 1280, 720, 20),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut machine = DiscoveryMachine::new();
        assert_eq!(machine.state(), ClientState::Idle);

        assert_eq!(
            machine.handle(MachineEvent::Start),
            vec![Effect::StartDiscovery]
        );
        assert_eq!(machine.state(), ClientState::Discovering);

        let effects = machine.handle(announcement(1));
        assert_eq!(
            effects,
            vec![Effect::OpenLink {
                source: AddressHash::from_bytes([1; 16])
            }]
        );
        assert_eq!(machine.state(), ClientState::Connecting);

        let effects = machine.handle(MachineEvent::LinkEstablished);
        assert_eq!(
            effects,
            vec![Effect::StartDecoder {
                nickname: "TestServer".to_string()
            }]
        );
        assert_eq!(machine.state(), ClientState::Connected);
    }

    #[test]
    fn test_announcements_swallowed_while_connection_in_flight() {
        let mut machine = DiscoveryMachine::new();
        machine.handle(MachineEvent::Start);
        machine.handle(announcement(1));

        // Connecting: a second producer must not open a second link
        assert!(machine.handle(announcement(2)).is_empty());
        assert_eq!(machine.state(), ClientState::Connecting);

        machine.handle(MachineEvent::LinkEstablished);
        assert!(machine.handle(announcement(3)).is_empty());
        assert_eq!(machine.state(), ClientState::Connected);

        // And the remembered producer is still the first one
        assert_eq!(machine.server_info().unwrap().nickname, "TestServer");
    }

    #[test]
    fn test_disconnect_then_reconnect_cycle() {
        let mut machine = DiscoveryMachine::new();
        machine.handle(MachineEvent::Start);
        machine.handle(announcement(1));
        machine.handle(MachineEvent::LinkEstablished);

        let effects = machine.handle(MachineEvent::LinkClosed);
        assert_eq!(
            effects,
            vec![Effect::StopDecoder, Effect::ScheduleReconnect]
        );
        assert_eq!(machine.state(), ClientState::Disconnected);

        // Announcements during the delay do not shortcut the wait
        assert!(machine.handle(announcement(2)).is_empty());
        assert_eq!(machine.state(), ClientState::Disconnected);

        assert_eq!(
            machine.handle(MachineEvent::ReconnectDue),
            vec![Effect::StartDiscovery]
        );
        assert_eq!(machine.state(), ClientState::Discovering);
    }

    #[test]
    fn test_close_while_connecting_schedules_reconnect() {
        let mut machine = DiscoveryMachine::new();
        machine.handle(MachineEvent::Start);
        machine.handle(announcement(1));

        let effects = machine.handle(MachineEvent::LinkClosed);
        assert_eq!(
            effects,
            vec![Effect::StopDecoder, Effect::ScheduleReconnect]
        );
        assert_eq!(machine.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_decoder_failure_tears_down_but_waits_for_close() {
        let mut machine = DiscoveryMachine::new();
        machine.handle(MachineEvent::Start);
        machine.handle(announcement(1));
        machine.handle(MachineEvent::LinkEstablished);

        let effects = machine.handle(MachineEvent::DecoderFailed);
        assert_eq!(effects, vec![Effect::StopDecoder, Effect::TeardownLink]);
        // The close notification drives the actual transition
        assert_eq!(machine.state(), ClientState::Connected);

        machine.handle(MachineEvent::LinkClosed);
        assert_eq!(machine.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_capacity_refusal() {
        let mut machine = DiscoveryMachine::new();
        machine.handle(MachineEvent::Start);
        machine.handle(announcement(1));
        machine.handle(MachineEvent::LinkEstablished);

        let effects = machine.handle(MachineEvent::CapacityRefused);
        assert_eq!(effects, vec![Effect::StopDecoder, Effect::TeardownLink]);
    }

    #[test]
    fn test_stale_reconnect_timer_is_ignored() {
        let mut machine = DiscoveryMachine::new();
        machine.handle(MachineEvent::Start);
        machine.handle(announcement(1));
        machine.handle(MachineEvent::LinkEstablished);

        // A timer armed before a successful reconnect must not restart
        // discovery under a live connection
        assert!(machine.handle(MachineEvent::ReconnectDue).is_empty());
        assert_eq!(machine.state(), ClientState::Connected);
    }

    #[test]
    fn test_stop_is_terminal_from_every_state() {
        for drive in 0..5 {
            let mut machine = DiscoveryMachine::new();
            // Drive the machine into each reachable state
            if drive >= 1 {
                machine.handle(MachineEvent::Start);
            }
            if drive >= 2 {
                machine.handle(announcement(1));
            }
            if drive >= 3 {
                machine.handle(MachineEvent::LinkEstablished);
            }
            if drive >= 4 {
                machine.handle(MachineEvent::LinkClosed);
            }

            let effects = machine.handle(MachineEvent::Stop);
            assert_eq!(
                effects,
                vec![
                    Effect::CancelDiscovery,
                    Effect::TeardownLink,
                    Effect::StopDecoder,
                ]
            );
            assert_eq!(machine.state(), ClientState::Stopped);

            // Nothing revives a stopped machine
            assert!(machine.handle(MachineEvent::Start).is_empty());
            assert!(machine.handle(announcement(2)).is_empty());
            assert!(machine.handle(MachineEvent::ReconnectDue).is_empty());
            assert_eq!(machine.state(), ClientState::Stopped);
        }
    }
}
