use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::packet::Packet;

/// This is the wire-side of a circuit: it turns packets into datagrams and sends them. It is
///  introduced as an abstraction to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CircuitSocket: Send + Sync + 'static {
    /// prepare sending to and receiving from a remote simulator
    async fn open(&self, remote: SocketAddr) -> anyhow::Result<()>;

    /// Send failures are logged, not reported: delivery is best effort on this level
    async fn send_packet(&self, remote: SocketAddr, sequence: u32, packet: &Packet);

    async fn close(&self, remote: SocketAddr);
}
