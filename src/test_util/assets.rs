use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::network::circuit::Circuit;
use crate::network::network_manager::PacketSender;
use crate::network::session::{AgentSession, LivenessFlag};
use crate::packet::Packet;
use crate::test_util::network::{test_circuit, test_session};

/// [`PacketSender`] that records sent packets instead of sending them. Its session is alive
///  until [`TrackingPacketSender::shut_down`] is called.
pub struct TrackingPacketSender {
    circuit: Arc<Circuit>,
    sent: Mutex<Vec<(SocketAddr, Packet)>>,
    connected: watch::Sender<bool>,
}

impl TrackingPacketSender {
    pub fn new() -> Arc<TrackingPacketSender> {
        Arc::new(TrackingPacketSender {
            circuit: test_circuit(),
            sent: Default::default(),
            connected: watch::channel(true).0,
        })
    }

    pub fn circuit(&self) -> Arc<Circuit> {
        self.circuit.clone()
    }

    pub fn shut_down(&self) {
        self.connected.send_replace(false);
    }

    /// returns sent packets, clearing the internal buffer
    pub fn sent_packets(&self) -> Vec<Packet> {
        let mut sent = self.sent.lock().unwrap();
        std::mem::take(&mut *sent)
            .into_iter()
            .map(|(_, packet)| packet)
            .collect()
    }
}

#[async_trait]
impl PacketSender for TrackingPacketSender {
    async fn send_packet(&self, packet: Packet, circuit: Option<Arc<Circuit>>) {
        let addr = circuit
            .map(|c| c.addr())
            .unwrap_or(self.circuit.addr());
        self.sent.lock().unwrap().push((addr, packet));
    }

    fn current_circuit(&self) -> Option<Arc<Circuit>> {
        Some(self.circuit.clone())
    }

    fn session(&self) -> AgentSession {
        test_session()
    }

    fn liveness(&self) -> LivenessFlag {
        LivenessFlag::new(self.connected.subscribe())
    }
}
