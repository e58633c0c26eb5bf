use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::ConnectError;
use crate::network::circuit::{Circuit, IncomingPacket, OutgoingPacket};
use crate::network::circuit_socket::CircuitSocket;
use crate::network::network_events::*;
use crate::network::packet_queue::{BlockingQueue, Dequeued, EnqueueError};
use crate::network::packet_registry::{CallbackHandle, CapsEventCallback, CapsEvents, PacketCallback, PacketEvents};
use crate::network::session::{AgentSession, LivenessFlag};
use crate::packet::{CapsMessage, NeighborHost, Packet, PacketType};

/// The part of the network manager that protocol implementations on top of it depend on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSender: Send + Sync + 'static {
    /// Sends a packet to the given circuit, or to the current circuit if none is given. Packets
    ///  that can not be sent are logged and dropped.
    async fn send_packet(&self, packet: Packet, circuit: Option<Arc<Circuit>>);

    fn current_circuit(&self) -> Option<Arc<Circuit>>;

    fn session(&self) -> AgentSession;

    fn liveness(&self) -> LivenessFlag;
}

/// Consulted before connecting to a new simulator
#[cfg_attr(test, automock)]
pub trait ConnectVeto: Send + Sync + 'static {
    fn should_cancel(&self, addr: SocketAddr) -> bool;
}

#[derive(Default)]
struct CircuitSet {
    all: Vec<Arc<Circuit>>,
    current: Option<Arc<Circuit>>,
}

impl CircuitSet {
    fn find(&self, addr: SocketAddr) -> Option<&Arc<Circuit>> {
        self.all.iter()
            .find(|c| c.addr() == addr)
    }
}


/// Owns the circuits of a client session and moves packets between them and the rest of the
///  client.
///
/// Outbound packets go through a bounded queue that is drained by a worker loop, inbound packets
///  are queued the same way and dispatched to the registered [`PacketCallback`]s by a second worker
///  loop. Both loops and the liveness timer are started by the first connection and terminate
///  on [`NetworkManager::shutdown`].
pub struct NetworkManager {
    myself: Weak<NetworkManager>,
    config: Arc<NetworkConfig>,
    session: AgentSession,
    socket: Arc<dyn CircuitSocket>,

    circuits: RwLock<CircuitSet>,
    inbox: Arc<BlockingQueue<IncomingPacket>>,
    outbox: Arc<BlockingQueue<OutgoingPacket>>,
    connected: watch::Sender<bool>,
    /// incremented whenever the worker loops are (re)started - loops of previous sessions stop
    ///  when they see a different value
    worker_generation: Arc<AtomicU64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    liveness_timer: Mutex<Option<JoinHandle<()>>>,

    packet_events: PacketEvents,
    caps_events: CapsEvents,
    events: NetworkEventNotifier,
    udp_blacklist: RwLock<FxHashSet<String>>,
    connect_veto: RwLock<Option<Arc<dyn ConnectVeto>>>,
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().unwrap().drain(..) {
            worker.abort();
        }
        if let Some(timer) = self.liveness_timer.get_mut().unwrap().take() {
            timer.abort();
        }
    }
}

impl NetworkManager {
    pub fn new(config: Arc<NetworkConfig>, session: AgentSession, socket: Arc<dyn CircuitSocket>) -> anyhow::Result<Arc<NetworkManager>> {
        config.validate()?;

        let network = Arc::new_cyclic(|myself| NetworkManager {
            myself: myself.clone(),
            session,
            socket,
            circuits: Default::default(),
            inbox: Arc::new(BlockingQueue::new(config.packet_inbox_size)),
            outbox: Arc::new(BlockingQueue::new(config.packet_inbox_size)),
            connected: watch::channel(false).0,
            worker_generation: Default::default(),
            workers: Default::default(),
            liveness_timer: Default::default(),
            packet_events: PacketEvents::new(),
            caps_events: CapsEvents::new(),
            events: NetworkEventNotifier::new(config.event_channel_capacity),
            udp_blacklist: Default::default(),
            connect_veto: Default::default(),
            config,
        });

        let builtin = Arc::new(BuiltinPacketHandler { network: Arc::downgrade(&network) });
        for packet_type in [
            PacketType::RegionHandshake,
            PacketType::StartPingCheck,
            PacketType::DisableSimulator,
            PacketType::KickUser,
            PacketType::LogoutReply,
        ] {
            network.register_packet_callback(packet_type, builtin.clone());
        }
        network.register_caps_callback("EnableSimulator", Arc::new(EnableSimulatorHandler { network: Arc::downgrade(&network) }));

        Ok(network)
    }

    pub fn config(&self) -> &Arc<NetworkConfig> {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn circuits(&self) -> Vec<Arc<Circuit>> {
        self.circuits.read().unwrap()
            .all.clone()
    }

    pub fn find_circuit(&self, addr: SocketAddr) -> Option<Arc<Circuit>> {
        self.circuits.read().unwrap()
            .find(addr)
            .cloned()
    }

    pub fn register_packet_callback(&self, packet_type: PacketType, callback: Arc<dyn PacketCallback>) -> CallbackHandle {
        self.packet_events.register(packet_type, callback)
    }

    pub fn unregister_packet_callback(&self, packet_type: &PacketType, handle: CallbackHandle) -> bool {
        self.packet_events.unregister(packet_type, handle)
    }

    pub fn register_caps_callback(&self, name: &str, callback: Arc<dyn CapsEventCallback>) -> CallbackHandle {
        self.caps_events.register(name.to_string(), callback)
    }

    pub fn unregister_caps_callback(&self, name: &str, handle: CallbackHandle) -> bool {
        self.caps_events.unregister(&name.to_string(), handle)
    }

    /// Installs the names of packets the server asked the client not to accept over UDP
    pub fn set_udp_blacklist(&self, packet_names: impl IntoIterator<Item = String>) {
        let mut blacklist = self.udp_blacklist.write().unwrap();
        blacklist.clear();
        blacklist.extend(packet_names);
    }

    pub fn set_connect_veto(&self, veto: Option<Arc<dyn ConnectVeto>>) {
        *self.connect_veto.write().unwrap() = veto;
    }

    /// Connects to a simulator, or returns the existing circuit if it is already connected.
    ///  Concurrent calls for the same address are serialized and return the same circuit.
    ///
    /// Returns `None` if the attempt was vetoed or failed - the reason is logged.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr, region_handle: u64, make_current: bool, seed_capability: Option<String>) -> Option<Arc<Circuit>> {
        let circuit = self.find_or_add_circuit(addr, region_handle);
        let _connecting = circuit.connect_lock.lock().await;

        if circuit.is_connected() {
            trace!("{:?} is already connected", addr);
            if make_current {
                self.set_current_circuit(&circuit, seed_capability);
                circuit.send_packet(circuit.complete_agent_movement()).await;
                self.send_agent_update(&circuit).await;
            }
            return Some(circuit.clone());
        }

        if !self.is_tracked(&circuit) {
            debug!("{:?} was dropped while waiting to connect", addr);
            return None;
        }

        let veto = self.connect_veto.read().unwrap().clone();
        if let Some(veto) = veto {
            if veto.should_cancel(addr) {
                info!("{}", ConnectError::Vetoed(addr));
                self.remove_circuit(&circuit);
                return None;
            }
        }

        // the handshake arrives through the inbound loop, so the workers run while connecting
        self.start_workers_if_needed();

        match circuit.connect(make_current, self.config.connect_timeout, self.liveness()).await {
            Ok(()) => {
                self.start_liveness_timer_if_needed();

                self.events.send_event(NetworkEvent::CircuitConnected(CircuitConnectedData { addr }));
                if make_current {
                    self.set_current_circuit(&circuit, seed_capability);
                    self.send_agent_update(&circuit).await;
                }
                else {
                    circuit.set_seed_capability(seed_capability);
                }
                Some(circuit.clone())
            }
            Err(e) => {
                warn!("{}", e);
                if self.remove_circuit(&circuit) && self.is_connected() {
                    self.stop_workers();
                }
                None
            }
        }
    }

    fn find_or_add_circuit(&self, addr: SocketAddr, region_handle: u64) -> Arc<Circuit> {
        let mut circuits = self.circuits.write().unwrap();
        if let Some(existing) = circuits.find(addr) {
            return existing.clone();
        }

        debug!("adding circuit for {:?}", addr);
        let circuit = Arc::new(Circuit::new(
            addr,
            region_handle,
            self.session,
            self.socket.clone(),
            self.outbox.clone(),
            self.config.simulator_timeout,
        ));
        circuits.all.push(circuit.clone());
        circuit
    }

    fn is_tracked(&self, circuit: &Arc<Circuit>) -> bool {
        self.circuits.read().unwrap()
            .all.iter()
            .any(|c| Arc::ptr_eq(c, circuit))
    }

    /// returns true if no circuits are left
    fn remove_circuit(&self, circuit: &Arc<Circuit>) -> bool {
        let mut circuits = self.circuits.write().unwrap();
        circuits.all.retain(|c| !Arc::ptr_eq(c, circuit));
        if circuits.current.as_ref().map(|c| Arc::ptr_eq(c, circuit)).unwrap_or(false) {
            circuits.current = None;
        }
        circuits.all.is_empty()
    }

    fn set_current_circuit(&self, circuit: &Arc<Circuit>, seed_capability: Option<String>) {
        let previous = {
            let mut circuits = self.circuits.write().unwrap();
            circuits.current.replace(circuit.clone())
        };
        circuit.set_seed_capability(seed_capability);

        let previous = previous.map(|c| c.addr());
        if previous != Some(circuit.addr()) {
            info!("current circuit changed from {:?} to {:?}", previous, circuit.addr());
            self.events.send_event(NetworkEvent::CurrentCircuitChanged(CurrentCircuitChangedData {
                previous,
                current: circuit.addr(),
            }));
        }
    }

    async fn send_agent_update(&self, circuit: &Arc<Circuit>) {
        if self.config.send_agent_updates {
            circuit.send_packet(Packet::AgentUpdate {
                agent_id: self.session.agent_id,
                session_id: self.session.session_id,
            }).await;
        }
    }

    fn start_workers_if_needed(&self) {
        let is_first = self.connected.send_if_modified(|connected| {
            if *connected {
                false
            }
            else {
                *connected = true;
                true
            }
        });
        if !is_first {
            return;
        }

        let generation = self.worker_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("starting network worker loops #{}", generation);

        self.inbox.open();
        self.outbox.open();

        let mut workers = self.workers.lock().unwrap();
        workers.retain(|w| !w.is_finished());
        workers.push(tokio::spawn(outbound_loop(
            self.outbox.clone(),
            self.worker_generation.clone(),
            generation,
            self.config.queue_poll_interval,
            self.config.outbound_packet_spacing,
        )));
        workers.push(tokio::spawn(inbound_loop(
            self.myself.clone(),
            self.inbox.clone(),
            self.worker_generation.clone(),
            generation,
            self.config.queue_poll_interval,
        )));
    }

    /// Undoes the worker start when no circuit survived a failed connection attempt. No circuit
    ///  was ever connected, so no events are fired.
    fn stop_workers(&self) {
        debug!("no circuit left after failed connect - stopping network worker loops");
        self.inbox.close();
        self.outbox.close();
        self.connected.send_replace(false);
    }

    fn start_liveness_timer_if_needed(&self) {
        let mut timer = self.liveness_timer.lock().unwrap();
        if timer.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let network = self.myself.clone();
        let period = self.config.simulator_timeout;
        let mut liveness = self.liveness();

        *timer = Some(tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = liveness.wait_for_shutdown() => break,
                    _ = ticks.tick() => {}
                }

                let Some(network) = network.upgrade()
                else {
                    break;
                };
                if !network.on_liveness_tick().await {
                    break;
                }
            }
            debug!("liveness timer terminated");
        }));
    }

    /// returns false if the session was shut down
    async fn on_liveness_tick(&self) -> bool {
        let Some(current) = self.current_circuit()
        else {
            trace!("liveness check: no current circuit");
            return true;
        };

        if current.flag_disconnect_candidate() {
            warn!("no packets received from {:?} for {:?} - shutting down", current.addr(), self.config.simulator_timeout);
            self.shutdown(DisconnectType::NetworkTimeout, "network timeout").await;
            false
        }
        else {
            trace!("liveness check: flagged {:?} as disconnect candidate", current.addr());
            true
        }
    }

    /// Disconnects a single circuit. Disconnecting the last remaining circuit shuts down the
    ///  session.
    pub async fn disconnect(&self, circuit: &Arc<Circuit>, send_close_notice: bool) {
        circuit.disconnect(send_close_notice).await;

        let reason = if send_close_notice { DisconnectType::ClientInitiated } else { DisconnectType::SimShutdown };
        self.events.send_event(NetworkEvent::CircuitDisconnected(CircuitDisconnectedData { addr: circuit.addr(), reason }));

        if self.remove_circuit(circuit) {
            info!("last circuit was disconnected");
            self.shutdown(DisconnectType::SimShutdown, "").await;
        }
    }

    /// Disconnects all circuits (the current one last), closes the packet queues which
    ///  terminates the worker loops, and fires the terminal [`NetworkEvent::Disconnected`].
    pub async fn shutdown(&self, reason: DisconnectType, message: &str) {
        let (others, current) = {
            let mut circuits = self.circuits.write().unwrap();
            let current = circuits.current.take();
            let others = std::mem::take(&mut circuits.all).into_iter()
                .filter(|c| !current.as_ref().map(|cur| Arc::ptr_eq(cur, c)).unwrap_or(false))
                .collect::<Vec<_>>();
            (others, current)
        };

        if !self.is_connected() && others.is_empty() && current.is_none() {
            debug!("shutdown ({:?}) of a network session that is not connected - ignoring", reason);
            return;
        }
        info!("shutting down network session: {:?} {}", reason, message);

        let send_close_notice = reason.sends_close_notice();
        for circuit in others.iter().chain(current.iter()) {
            circuit.disconnect(send_close_notice).await;
            self.events.send_event(NetworkEvent::CircuitDisconnected(CircuitDisconnectedData { addr: circuit.addr(), reason }));
        }

        self.inbox.close();
        self.outbox.close();
        self.connected.send_replace(false);

        self.events.send_event(NetworkEvent::Disconnected(DisconnectedData {
            reason,
            message: message.to_string(),
        }));
    }

    /// Sends a logout request to the current simulator. The session is shut down when the reply
    ///  arrives.
    pub async fn request_logout(&self) {
        self.send_packet(Packet::LogoutRequest {
            agent_id: self.session.agent_id,
            session_id: self.session.session_id,
        }, None).await;
    }

    /// Logs out and waits for the session to be shut down. If the server does not reply in time,
    ///  the session is shut down with [`DisconnectType::NetworkTimeout`].
    pub async fn logout(&self) {
        let mut events = self.subscribe();
        self.request_logout().await;

        let got_reply = timeout(self.config.logout_timeout, async {
            loop {
                match events.recv().await {
                    Ok(NetworkEvent::Disconnected(_)) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        }).await;

        if got_reply != Ok(true) {
            warn!("no logout reply after {:?}", self.config.logout_timeout);
            self.shutdown(DisconnectType::NetworkTimeout, "logout timed out").await;
        }
    }

    /// Entry point for packets decoded by the receiving side of the socket
    pub async fn deliver_incoming(&self, from: SocketAddr, packet: Packet) {
        let Some(circuit) = self.find_circuit(from)
        else {
            warn!("received {:?} from {:?} which is not a known simulator - ignoring", packet.packet_type(), from);
            return;
        };

        circuit.on_packet_received();

        match self.inbox.enqueue(IncomingPacket { circuit, packet }, self.config.queue_poll_interval).await {
            Ok(()) => {}
            Err(EnqueueError::Closed) => trace!("inbound queue is closed - dropping packet from {:?}", from),
            Err(EnqueueError::Full) => warn!("inbound queue is full - dropping packet from {:?}", from),
        }
    }

    /// Entry point for the capability event channel collaborator
    pub async fn deliver_capability_event(&self, name: &str, message: CapsMessage, circuit: &Arc<Circuit>) {
        circuit.on_packet_received();
        self.caps_events.raise(name, Arc::new(message), circuit.clone()).await;
    }

    async fn dispatch(&self, incoming: IncomingPacket) {
        let packet_type = incoming.packet.packet_type();
        if self.udp_blacklist.read().unwrap().contains(packet_type.name()) {
            warn!("discarding blacklisted packet {:?} from {:?}", packet_type, incoming.circuit.addr());
            return;
        }

        trace!("dispatching {:?} from {:?}", packet_type, incoming.circuit.addr());
        let packet = Arc::new(incoming.packet);
        if self.config.sync_packet_callbacks {
            self.packet_events.raise(packet, incoming.circuit).await;
        }
        else {
            self.packet_events.begin_raise(packet, incoming.circuit);
        }
    }

    /// Connects to newly announced neighbouring simulators without making them current
    pub async fn on_enable_simulator(self: &Arc<Self>, neighbors: &[NeighborHost]) {
        if !self.config.multiple_sims {
            debug!("ignoring {} neighbour simulator(s) - multiple simulators are disabled", neighbors.len());
            return;
        }

        for neighbor in neighbors {
            if self.find_circuit(neighbor.addr).is_some() {
                trace!("neighbour simulator {:?} is already known", neighbor.addr);
                continue;
            }

            if self.connect(neighbor.addr, neighbor.region_handle, false, None).await.is_none() {
                error!("unable to connect to neighbour simulator {:?}", neighbor.addr);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn workers_finished(&self) -> bool {
        self.workers.lock().unwrap()
            .iter()
            .all(|w| w.is_finished())
    }
}

#[async_trait]
impl PacketSender for NetworkManager {
    async fn send_packet(&self, packet: Packet, circuit: Option<Arc<Circuit>>) {
        let circuit = circuit
            .or_else(|| self.current_circuit())
            .or_else(|| self.circuits.read().unwrap().all.first().cloned());

        match circuit {
            Some(circuit) if circuit.is_connected() => circuit.send_packet(packet).await,
            Some(circuit) => warn!("{:?} is not connected - dropping {:?}", circuit.addr(), packet.packet_type()),
            None => warn!("no connected circuit - dropping {:?}", packet.packet_type()),
        }
    }

    fn current_circuit(&self) -> Option<Arc<Circuit>> {
        self.circuits.read().unwrap()
            .current.clone()
    }

    fn session(&self) -> AgentSession {
        self.session
    }

    fn liveness(&self) -> LivenessFlag {
        LivenessFlag::new(self.connected.subscribe())
    }
}


async fn outbound_loop(
    outbox: Arc<BlockingQueue<OutgoingPacket>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    poll_interval: Duration,
    packet_spacing: Duration,
) {
    let mut last_sent: Option<Instant> = None;

    while current_generation.load(Ordering::Acquire) == generation {
        match outbox.dequeue(poll_interval).await {
            Dequeued::Item(mut envelope) => {
                if let Some(last_sent) = last_sent {
                    let elapsed = last_sent.elapsed();
                    if elapsed < packet_spacing {
                        sleep(packet_spacing - elapsed).await;
                    }
                }

                let circuit = envelope.circuit.clone();
                trace!("sending {:?}", envelope);
                circuit.send_packet_final(&mut envelope).await;
                last_sent = Some(Instant::now());
            }
            Dequeued::TimedOut => {}
            Dequeued::Closed => break,
        }
    }
    debug!("outbound loop #{} terminated", generation);
}

async fn inbound_loop(
    network: Weak<NetworkManager>,
    inbox: Arc<BlockingQueue<IncomingPacket>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    poll_interval: Duration,
) {
    while current_generation.load(Ordering::Acquire) == generation {
        match inbox.dequeue(poll_interval).await {
            Dequeued::Item(incoming) => {
                let Some(network) = network.upgrade()
                else {
                    break;
                };
                network.dispatch(incoming).await;
            }
            Dequeued::TimedOut => {}
            Dequeued::Closed => break,
        }
    }
    debug!("inbound loop #{} terminated", generation);
}


/// Handles the packets the network layer itself is responsible for
struct BuiltinPacketHandler {
    network: Weak<NetworkManager>,
}

#[async_trait]
impl PacketCallback for BuiltinPacketHandler {
    async fn on_packet(&self, packet: Arc<Packet>, circuit: Arc<Circuit>) {
        let Some(network) = self.network.upgrade()
        else {
            return;
        };

        match packet.as_ref() {
            Packet::StartPingCheck { ping_id, .. } => {
                circuit.send_packet(Packet::CompletePingCheck { ping_id: *ping_id }).await;
            }
            Packet::RegionHandshake { region_id, sim_name, .. } => {
                info!("received region handshake for {} ({}) from {:?}", sim_name, region_id, circuit.addr());
                circuit.send_packet(Packet::RegionHandshakeReply {
                    agent_id: network.session.agent_id,
                    session_id: network.session.session_id,
                    flags: 0,
                }).await;
                circuit.on_region_handshake();
            }
            Packet::DisableSimulator => {
                debug!("received DisableSimulator from {:?} - shutting it down", circuit.addr());
                network.disconnect(&circuit, false).await;
            }
            Packet::KickUser { reason } => {
                info!("kicked by the server: {}", reason);
                network.shutdown(DisconnectType::ServerInitiated, reason).await;
            }
            Packet::LogoutReply { agent_id, session_id, item_ids } => {
                if *agent_id != network.session.agent_id || *session_id != network.session.session_id {
                    warn!("logout reply with invalid agent or session id - ignoring");
                    return;
                }
                debug!("logout reply received");
                network.events.send_event(NetworkEvent::LoggedOut(LoggedOutData { item_ids: item_ids.clone() }));
                network.shutdown(DisconnectType::ClientInitiated, "").await;
            }
            other => {
                error!("built-in handler received unexpected {:?} - this is a bug", other.packet_type());
            }
        }
    }
}

struct EnableSimulatorHandler {
    network: Weak<NetworkManager>,
}

#[async_trait]
impl CapsEventCallback for EnableSimulatorHandler {
    async fn on_caps_event(&self, name: String, message: Arc<CapsMessage>, _circuit: Arc<Circuit>) {
        let Some(network) = self.network.upgrade()
        else {
            return;
        };

        match message.as_ref() {
            CapsMessage::EnableSimulator(neighbors) => network.on_enable_simulator(neighbors).await,
            CapsMessage::Other(_) => warn!("unexpected payload for capability event {} - ignoring", name),
        }
    }
}
