use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectType {
    /// the client logged out or closed the session
    ClientInitiated,
    /// the server kicked the agent
    ServerInitiated,
    /// the current simulator stopped responding
    NetworkTimeout,
    /// the last simulator was disconnected
    SimShutdown,
}

impl DisconnectType {
    /// Close notices are only sent if the simulators may still be listening
    pub fn sends_close_notice(&self) -> bool {
        matches!(self, DisconnectType::ClientInitiated | DisconnectType::NetworkTimeout)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkEvent {
    CircuitConnected(CircuitConnectedData),
    CircuitDisconnected(CircuitDisconnectedData),
    CurrentCircuitChanged(CurrentCircuitChangedData),
    LoggedOut(LoggedOutData),
    /// terminal event of a session
    Disconnected(DisconnectedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitConnectedData {
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitDisconnectedData {
    pub addr: SocketAddr,
    pub reason: DisconnectType,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CurrentCircuitChangedData {
    pub previous: Option<SocketAddr>,
    pub current: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggedOutData {
    pub item_ids: Vec<Uuid>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisconnectedData {
    pub reason: DisconnectType,
    pub message: String,
}


pub struct NetworkEventNotifier {
    sender: broadcast::Sender<NetworkEvent>,
}
impl NetworkEventNotifier {
    pub fn new(capacity: usize) -> NetworkEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        NetworkEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: NetworkEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
