use std::net::SocketAddr;

use thiserror::Error;

/// Reasons for a failed connection attempt. These are logged by the network manager; callers of
///  `connect` only see `None`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection attempt to {0} was vetoed")]
    Vetoed(SocketAddr),

    #[error("session was shut down while connecting to {0}")]
    ShutDown(SocketAddr),

    #[error("failed to open circuit to {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AssetError {
    #[error("timed out waiting for the previous asset upload to begin")]
    UploadSlotTimeout,

    #[error("network session was shut down")]
    ShutDown,

    #[error("not connected to any simulator")]
    NotConnected,
}
