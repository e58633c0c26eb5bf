use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::network::circuit::Circuit;
use crate::network::circuit_socket::CircuitSocket;
use crate::network::packet_queue::BlockingQueue;
use crate::network::session::AgentSession;
use crate::packet::Packet;

pub fn test_session() -> AgentSession {
    AgentSession {
        agent_id: Uuid::from_u128(0xa1),
        session_id: Uuid::from_u128(0x51),
        secure_session_id: Uuid::from_u128(0x5ec),
        circuit_code: 123456,
    }
}

/// default configuration with a short connect timeout, since test simulators never send a
///  region handshake on their own
pub fn test_config() -> NetworkConfig {
    NetworkConfig {
        connect_timeout: Duration::from_secs(1),
        ..NetworkConfig::new()
    }
}

/// an unconnected circuit that is not attached to any network manager
pub fn test_circuit() -> Arc<Circuit> {
    Arc::new(Circuit::new(
        SocketAddr::from(([127, 0, 0, 1], 13000)),
        0,
        test_session(),
        Arc::new(RecordingSocket::new()),
        Arc::new(BlockingQueue::new(10)),
        Duration::from_millis(100),
    ))
}


/// Circuit socket that records everything instead of sending it
#[derive(Default)]
pub struct RecordingSocket {
    sent: Mutex<Vec<(Instant, SocketAddr, Packet)>>,
    opened: Mutex<Vec<SocketAddr>>,
    closed: Mutex<Vec<SocketAddr>>,
    failing: Mutex<FxHashSet<SocketAddr>>,
}

impl RecordingSocket {
    pub fn new() -> RecordingSocket {
        Default::default()
    }

    /// opening a circuit to this address will fail
    pub fn fail_open(&self, addr: SocketAddr) {
        self.failing.lock().unwrap().insert(addr);
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.opened.lock().unwrap().clear();
        self.closed.lock().unwrap().clear();
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Packet)> {
        self.sent.lock().unwrap()
            .iter()
            .map(|(_, to, packet)| (*to, packet.clone()))
            .collect()
    }

    pub fn sent_to(&self, addr: SocketAddr) -> Vec<Packet> {
        self.sent().into_iter()
            .filter(|(to, _)| *to == addr)
            .map(|(_, packet)| packet)
            .collect()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        self.sent.lock().unwrap()
            .iter()
            .map(|(at, _, _)| *at)
            .collect()
    }

    pub fn opened(&self) -> Vec<SocketAddr> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<SocketAddr> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CircuitSocket for RecordingSocket {
    async fn open(&self, remote: SocketAddr) -> anyhow::Result<()> {
        if self.failing.lock().unwrap().contains(&remote) {
            anyhow::bail!("connection refused by {:?}", remote);
        }
        self.opened.lock().unwrap().push(remote);
        Ok(())
    }

    async fn send_packet(&self, remote: SocketAddr, _sequence: u32, packet: &Packet) {
        self.sent.lock().unwrap().push((Instant::now(), remote, packet.clone()));
    }

    async fn close(&self, remote: SocketAddr) {
        self.closed.lock().unwrap().push(remote);
    }
}
