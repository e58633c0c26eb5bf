use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::network::circuit_socket::CircuitSocket;
use crate::network::network_manager::NetworkManager;
use crate::packet::{Packet, PacketCodec};

const RECEIVE_BUFFER_SIZE: usize = 8192;

/// [`CircuitSocket`] on top of a single UDP socket shared by all circuits
pub struct UdpCircuitSocket {
    socket: UdpSocket,
    codec: Arc<dyn PacketCodec>,
    max_packet_size: usize,
}

impl UdpCircuitSocket {
    pub async fn bind(local_addr: SocketAddr, codec: Arc<dyn PacketCodec>, max_packet_size: usize) -> anyhow::Result<UdpCircuitSocket> {
        let socket = UdpSocket::bind(local_addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        Ok(UdpCircuitSocket {
            socket,
            codec,
            max_packet_size,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Starts a task that receives datagrams, decodes them and hands them to the network manager.
    ///  The task terminates when the network manager is dropped.
    pub fn spawn_recv_loop(self: &Arc<Self>, network: &Arc<NetworkManager>) -> JoinHandle<()> {
        let socket = self.clone();
        let network = Arc::downgrade(network);
        tokio::spawn(async move {
            socket.recv_loop(network).await;
        })
    }

    async fn recv_loop(&self, network: Weak<NetworkManager>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let Some(network) = network.upgrade()
            else {
                debug!("network manager was dropped - terminating receive loop");
                break;
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            async {
                trace!("received datagram from {:?}: {:?}", from, &buf[..num_read]);
                match self.codec.decode(&buf[..num_read]) {
                    Ok(packet) => network.deliver_incoming(from, packet).await,
                    Err(e) => warn!("received undecodable datagram from {:?}: {} - dropping", from, e),
                }
            }
                .instrument(span)
                .await;
        }
    }
}

#[async_trait]
impl CircuitSocket for UdpCircuitSocket {
    async fn open(&self, remote: SocketAddr) -> anyhow::Result<()> {
        // UDP is connectionless, the shared socket is ready for any remote address
        trace!("opening circuit to {:?}", remote);
        Ok(())
    }

    async fn send_packet(&self, remote: SocketAddr, sequence: u32, packet: &Packet) {
        let datagram = match self.codec.encode(sequence, packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                error!("error encoding {:?}: {}", packet.packet_type(), e);
                return;
            }
        };

        if datagram.len() > self.max_packet_size {
            error!("{:?} is {} bytes long, exceeding the maximum packet size of {} - dropping", packet.packet_type(), datagram.len(), self.max_packet_size);
            return;
        }

        trace!("UDP socket: sending #{} to {:?}", sequence, remote);
        if let Err(e) = self.socket.send_to(&datagram, remote).await {
            error!("error sending UDP packet to {:?}: {}", remote, e);
        }
    }

    async fn close(&self, remote: SocketAddr) {
        trace!("closing circuit to {:?}", remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::network::{test_config, test_session};
    use anyhow::bail;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::runtime::Builder;

    const PONG_TAG: u8 = 0xcc;

    /// pings are one byte on the wire, pongs are tagged, everything else is an opaque marker
    struct TinyCodec;

    impl PacketCodec for TinyCodec {
        fn encode(&self, _sequence: u32, packet: &Packet) -> anyhow::Result<Bytes> {
            match packet {
                Packet::CompletePingCheck { ping_id } => Ok(Bytes::from(vec![PONG_TAG, *ping_id])),
                Packet::Other { body, .. } => Ok(body.clone()),
                _ => Ok(Bytes::from_static(&[0])),
            }
        }

        fn decode(&self, datagram: &[u8]) -> anyhow::Result<Packet> {
            match datagram {
                [ping_id] => Ok(Packet::StartPingCheck { ping_id: *ping_id, oldest_unacked: 0 }),
                _ => bail!("unknown datagram"),
            }
        }
    }

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn test_oversized_packets_are_dropped() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let socket = UdpCircuitSocket::bind(localhost(), Arc::new(TinyCodec), 4).await.unwrap();
            let peer = UdpSocket::bind(localhost()).await.unwrap();
            let peer_addr = peer.local_addr().unwrap();

            socket.send_packet(peer_addr, 1, &Packet::Other { name: "Big".to_string(), body: Bytes::from(vec![1; 5]) }).await;
            socket.send_packet(peer_addr, 2, &Packet::Other { name: "Small".to_string(), body: Bytes::from(vec![2; 4]) }).await;

            let mut buf = [0u8; 16];
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..n], &[2, 2, 2, 2]);
        });
    }

    #[test]
    fn test_ping_round_trip_over_udp() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let socket = Arc::new(UdpCircuitSocket::bind(localhost(), Arc::new(TinyCodec), 1200).await.unwrap());
            let peer = UdpSocket::bind(localhost()).await.unwrap();
            let peer_addr = peer.local_addr().unwrap();

            let mut config = test_config();
            config.connect_timeout = Duration::from_millis(50);
            let network = NetworkManager::new(Arc::new(config), test_session(), socket.clone()).unwrap();
            let recv_loop = socket.spawn_recv_loop(&network);

            network.connect(peer_addr, 1, true, None).await.unwrap();
            peer.send_to(&[7], socket.local_addr().unwrap()).await.unwrap();

            let mut buf = [0u8; 16];
            let pong = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let (n, _) = peer.recv_from(&mut buf).await.unwrap();
                    if buf[..n] == [PONG_TAG, 7] {
                        return;
                    }
                }
            }).await;
            assert!(pong.is_ok());

            recv_loop.abort();
        });
    }
}
