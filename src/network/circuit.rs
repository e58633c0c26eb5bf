use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::ConnectError;
use crate::network::circuit_socket::CircuitSocket;
use crate::network::packet_queue::{BlockingQueue, EnqueueError};
use crate::network::session::{AgentSession, LivenessFlag};
use crate::packet::Packet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    Unconnected,
    Connecting,
    Connected,
    /// connected, but nothing was received during the last liveness period
    DisconnectCandidate,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

/// A packet on its way to the wire
pub struct OutgoingPacket {
    pub circuit: Arc<Circuit>,
    pub packet: Packet,
    pub sequence: u32,
    pub resend_count: u32,
    pub last_sent: Option<Instant>,
}

impl Debug for OutgoingPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {:?} -> {:?}", self.sequence, self.packet.packet_type(), self.circuit.addr())
    }
}

pub struct IncomingPacket {
    pub circuit: Arc<Circuit>,
    pub packet: Packet,
}


/// The logical connection to a single simulator.
///
/// Packets sent through a circuit go through the network manager's outbound queue and end up in
///  [`Circuit::send_packet_final`] on the outbound worker loop.
pub struct Circuit {
    addr: SocketAddr,
    region_handle: u64,
    session: AgentSession,
    socket: Arc<dyn CircuitSocket>,
    outbox: Arc<BlockingQueue<OutgoingPacket>>,
    enqueue_timeout: Duration,

    phase: Mutex<Phase>,
    is_disconnect_candidate: AtomicBool,
    last_seen: Mutex<Option<Instant>>,
    seed_capability: Mutex<Option<String>>,
    next_sequence: AtomicU32,
    handshake_received: watch::Sender<bool>,
    /// serializes connection attempts for this circuit
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
}

impl Debug for Circuit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit({:?}, {:?})", self.addr, self.state())
    }
}

impl Circuit {
    pub(crate) fn new(
        addr: SocketAddr,
        region_handle: u64,
        session: AgentSession,
        socket: Arc<dyn CircuitSocket>,
        outbox: Arc<BlockingQueue<OutgoingPacket>>,
        enqueue_timeout: Duration,
    ) -> Circuit {
        Circuit {
            addr,
            region_handle,
            session,
            socket,
            outbox,
            enqueue_timeout,
            phase: Mutex::new(Phase::Unconnected),
            is_disconnect_candidate: AtomicBool::new(false),
            last_seen: Mutex::new(None),
            seed_capability: Mutex::new(None),
            next_sequence: AtomicU32::new(1),
            handshake_received: watch::channel(false).0,
            connect_lock: Default::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn region_handle(&self) -> u64 {
        self.region_handle
    }

    pub fn circuit_code(&self) -> u32 {
        self.session.circuit_code
    }

    pub fn state(&self) -> CircuitState {
        match *self.phase.lock().unwrap() {
            Phase::Unconnected => CircuitState::Unconnected,
            Phase::Connecting => CircuitState::Connecting,
            Phase::Connected => {
                if self.is_disconnect_candidate() {
                    CircuitState::DisconnectCandidate
                }
                else {
                    CircuitState::Connected
                }
            }
            Phase::Disconnected => CircuitState::Disconnected,
        }
    }

    /// Packets can be sent while the circuit is still waiting for the simulator's handshake
    pub fn is_connected(&self) -> bool {
        matches!(*self.phase.lock().unwrap(), Phase::Connecting | Phase::Connected)
    }

    pub fn is_handshake_received(&self) -> bool {
        *self.handshake_received.borrow()
    }

    pub fn is_disconnect_candidate(&self) -> bool {
        self.is_disconnect_candidate.load(Ordering::Acquire)
    }

    pub fn last_seen(&self) -> Option<Instant> {
        *self.last_seen.lock().unwrap()
    }

    pub fn seed_capability(&self) -> Option<String> {
        self.seed_capability.lock().unwrap().clone()
    }

    pub(crate) fn set_seed_capability(&self, seed_capability: Option<String>) {
        let Some(seed_capability) = seed_capability
        else {
            return;
        };

        let mut current = self.seed_capability.lock().unwrap();
        match current.as_ref() {
            Some(existing) if existing == &seed_capability => {}
            Some(existing) => {
                warn!("unexpected change of the seed capability for {:?} from {} to {}", self.addr, existing, seed_capability);
                *current = Some(seed_capability);
            }
            None => {
                *current = Some(seed_capability);
            }
        }
    }

    /// Opens the circuit and introduces the agent to the simulator. Waiting for the simulator's
    ///  region handshake is bounded by `connect_timeout`. A missing handshake is logged, but the
    ///  circuit counts as connected anyway.
    pub(crate) async fn connect(self: &Arc<Self>, move_to_sim: bool, connect_timeout: Duration, mut liveness: LivenessFlag) -> Result<(), ConnectError> {
        info!("connecting to {:?}", self.addr);
        *self.phase.lock().unwrap() = Phase::Connecting;

        if let Err(e) = self.socket.open(self.addr).await {
            *self.phase.lock().unwrap() = Phase::Disconnected;
            return Err(ConnectError::Socket { addr: self.addr, source: e });
        }

        self.send_packet(Packet::UseCircuitCode {
            code: self.session.circuit_code,
            session_id: self.session.session_id,
            agent_id: self.session.agent_id,
        }).await;

        if move_to_sim {
            self.send_packet(self.complete_agent_movement()).await;
        }

        let mut handshake_received = self.handshake_received.subscribe();
        let got_handshake = tokio::select! {
            _ = liveness.wait_for_shutdown() => None,
            r = timeout(connect_timeout, async { handshake_received.wait_for(|received| *received).await.is_ok() }) => Some(r.unwrap_or(false)),
        };

        match got_handshake {
            None => {
                debug!("session was shut down while connecting to {:?}", self.addr);
                *self.phase.lock().unwrap() = Phase::Disconnected;
                self.socket.close(self.addr).await;
                Err(ConnectError::ShutDown(self.addr))
            }
            Some(got_handshake) => {
                if !got_handshake {
                    warn!("no region handshake from {:?} after {:?} - continuing anyway", self.addr, connect_timeout);
                }
                self.mark_connected();
                Ok(())
            }
        }
    }

    fn mark_connected(&self) {
        let mut phase = self.phase.lock().unwrap();
        if *phase == Phase::Connecting {
            *phase = Phase::Connected;
        }
    }

    pub(crate) fn complete_agent_movement(&self) -> Packet {
        Packet::CompleteAgentMovement {
            agent_id: self.session.agent_id,
            session_id: self.session.session_id,
            circuit_code: self.session.circuit_code,
        }
    }

    /// Tears the circuit down. This is idempotent, only the first call sends a close notice if
    ///  requested.
    pub(crate) async fn disconnect(&self, send_close_notice: bool) {
        {
            let mut phase = self.phase.lock().unwrap();
            if matches!(*phase, Phase::Disconnected | Phase::Unconnected) {
                trace!("{:?} is not connected - ignoring disconnect", self.addr);
                return;
            }
            *phase = Phase::Disconnected;
        }

        info!("disconnecting from {:?}", self.addr);

        if send_close_notice {
            // bypassing the outbound queue which may be closing concurrently
            let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
            self.socket.send_packet(self.addr, sequence, &Packet::CloseCircuit).await;
        }
        self.socket.close(self.addr).await;
    }

    /// Queues a packet for sending. Failures are logged and the packet dropped.
    pub async fn send_packet(self: &Arc<Self>, packet: Packet) {
        if !self.is_connected() {
            warn!("{:?} is not connected - dropping {:?}", self.addr, packet.packet_type());
            return;
        }

        let envelope = OutgoingPacket {
            circuit: self.clone(),
            packet,
            sequence: self.next_sequence.fetch_add(1, Ordering::AcqRel),
            resend_count: 0,
            last_sent: None,
        };
        trace!("queueing {:?}", envelope);

        match self.outbox.enqueue(envelope, self.enqueue_timeout).await {
            Ok(()) => {}
            Err(EnqueueError::Closed) => debug!("outbound queue is closed - dropping packet for {:?}", self.addr),
            Err(EnqueueError::Full) => warn!("outbound queue is full - dropping packet for {:?}", self.addr),
        }
    }

    /// the actual send, called by the outbound worker loop
    pub(crate) async fn send_packet_final(&self, envelope: &mut OutgoingPacket) {
        envelope.last_sent = Some(Instant::now());
        self.socket.send_packet(self.addr, envelope.sequence, &envelope.packet).await;
    }

    /// Called for every packet received on this circuit, before it is dispatched
    pub(crate) fn on_packet_received(&self) {
        *self.last_seen.lock().unwrap() = Some(Instant::now());
        if self.is_disconnect_candidate.swap(false, Ordering::AcqRel) {
            debug!("{:?} is alive again", self.addr);
        }
    }

    /// returns true if the circuit had already been flagged before
    pub(crate) fn flag_disconnect_candidate(&self) -> bool {
        self.is_disconnect_candidate.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn on_region_handshake(&self) {
        self.handshake_received.send_replace(true);
        self.mark_connected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::circuit_socket::MockCircuitSocket;
    use crate::network::packet_queue::Dequeued;
    use crate::test_util::network::{test_session, RecordingSocket};
    use mockall::predicate::eq;
    use tokio::runtime::Builder;

    const WAIT: Duration = Duration::from_millis(100);

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 13000))
    }

    fn circuit_with(socket: Arc<dyn CircuitSocket>) -> (Arc<Circuit>, Arc<BlockingQueue<OutgoingPacket>>) {
        let outbox = Arc::new(BlockingQueue::new(100));
        outbox.open();
        let circuit = Arc::new(Circuit::new(addr(), 1234, test_session(), socket, outbox.clone(), WAIT));
        (circuit, outbox)
    }

    async fn next_queued(outbox: &BlockingQueue<OutgoingPacket>) -> Packet {
        match outbox.dequeue(WAIT).await {
            Dequeued::Item(envelope) => envelope.packet,
            other => panic!("expected a queued packet, was {:?}", other),
        }
    }

    #[test]
    fn test_connect_sends_circuit_code_and_waits_for_handshake() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(RecordingSocket::new());
            let (circuit, outbox) = circuit_with(socket.clone());
            let (_alive, liveness) = watch::channel(true);

            let connecting = {
                let circuit = circuit.clone();
                tokio::spawn(async move {
                    circuit.connect(true, Duration::from_secs(60), LivenessFlag::new(liveness)).await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(circuit.state(), CircuitState::Connecting);

            let session = test_session();
            assert_eq!(next_queued(&outbox).await, Packet::UseCircuitCode {
                code: session.circuit_code,
                session_id: session.session_id,
                agent_id: session.agent_id,
            });
            assert_eq!(next_queued(&outbox).await, circuit.complete_agent_movement());

            let started = Instant::now();
            circuit.on_region_handshake();
            connecting.await.unwrap().unwrap();
            assert!(started.elapsed() < Duration::from_secs(1));

            assert_eq!(circuit.state(), CircuitState::Connected);
            assert!(circuit.is_handshake_received());
            assert_eq!(socket.opened(), vec![addr()]);
        });
    }

    #[test]
    fn test_connect_without_handshake_succeeds_after_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (circuit, outbox) = circuit_with(Arc::new(RecordingSocket::new()));
            let (_alive, liveness) = watch::channel(true);

            let started = Instant::now();
            circuit.connect(false, Duration::from_secs(5), LivenessFlag::new(liveness)).await.unwrap();
            assert!(started.elapsed() >= Duration::from_secs(5));
            assert_eq!(circuit.state(), CircuitState::Connected);
            assert!(!circuit.is_handshake_received());
            assert_eq!(outbox.len(), 1);
        });
    }

    #[test]
    fn test_connect_fails_fast_on_shutdown() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(RecordingSocket::new());
            let (circuit, _outbox) = circuit_with(socket.clone());
            let (alive, liveness) = watch::channel(true);

            let connecting = {
                let circuit = circuit.clone();
                tokio::spawn(async move {
                    circuit.connect(false, Duration::from_secs(60), LivenessFlag::new(liveness)).await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;

            let started = Instant::now();
            alive.send_replace(false);
            let result = connecting.await.unwrap();
            assert!(matches!(result, Err(ConnectError::ShutDown(_))));
            assert!(started.elapsed() < Duration::from_secs(1));
            assert_eq!(circuit.state(), CircuitState::Disconnected);
            assert_eq!(socket.closed(), vec![addr()]);
        });
    }

    #[test]
    fn test_connect_reports_socket_failure() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockCircuitSocket::new();
            socket.expect_open()
                .with(eq(addr()))
                .returning(|_| Err(anyhow::anyhow!("port unreachable")));
            let (circuit, outbox) = circuit_with(Arc::new(socket));
            let (_alive, liveness) = watch::channel(true);

            let result = circuit.connect(true, Duration::from_secs(60), LivenessFlag::new(liveness)).await;
            assert!(matches!(result, Err(ConnectError::Socket { .. })));
            assert_eq!(circuit.state(), CircuitState::Disconnected);
            assert_eq!(outbox.len(), 0);
        });
    }

    #[test]
    fn test_disconnect_sends_close_notice_once() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockCircuitSocket::new();
            socket.expect_open().returning(|_| Ok(()));
            socket.expect_send_packet()
                .withf(|to, _, packet| *to == addr() && *packet == Packet::CloseCircuit)
                .times(1)
                .return_const(());
            socket.expect_close()
                .with(eq(addr()))
                .times(1)
                .return_const(());

            let (circuit, _outbox) = circuit_with(Arc::new(socket));
            let (_alive, liveness) = watch::channel(true);
            circuit.on_region_handshake();
            circuit.connect(false, Duration::from_secs(1), LivenessFlag::new(liveness)).await.unwrap();

            circuit.disconnect(true).await;
            circuit.disconnect(true).await;
            assert_eq!(circuit.state(), CircuitState::Disconnected);
        });
    }

    #[test]
    fn test_send_on_unconnected_circuit_is_dropped() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (circuit, outbox) = circuit_with(Arc::new(MockCircuitSocket::new()));
            circuit.send_packet(Packet::CloseCircuit).await;
            assert_eq!(outbox.len(), 0);
        });
    }

    #[test]
    fn test_inbound_traffic_clears_disconnect_candidate() {
        let (circuit, _outbox) = circuit_with(Arc::new(MockCircuitSocket::new()));
        *circuit.phase.lock().unwrap() = Phase::Connected;

        assert!(!circuit.flag_disconnect_candidate());
        assert_eq!(circuit.state(), CircuitState::DisconnectCandidate);
        assert!(circuit.flag_disconnect_candidate());

        circuit.on_packet_received();
        assert_eq!(circuit.state(), CircuitState::Connected);
        assert!(circuit.last_seen().is_some());
    }

    #[test]
    fn test_seed_capability() {
        let (circuit, _outbox) = circuit_with(Arc::new(MockCircuitSocket::new()));
        circuit.set_seed_capability(None);
        assert_eq!(circuit.seed_capability(), None);
        circuit.set_seed_capability(Some("https://sim/seed/1".to_string()));
        circuit.set_seed_capability(None);
        assert_eq!(circuit.seed_capability(), Some("https://sim/seed/1".to_string()));
        circuit.set_seed_capability(Some("https://sim/seed/2".to_string()));
        assert_eq!(circuit.seed_capability(), Some("https://sim/seed/2".to_string()));
    }
}
