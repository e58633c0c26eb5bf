//! Decoded packets as seen by the transport core. Turning them into bytes on the wire and back is
//!  the job of a [`PacketCodec`], which lives outside this crate.

use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;
use uuid::Uuid;

use crate::assets::asset_types::{AssetType, ChannelType, SourceType, StatusCode, TargetType};

/// Bit of an Xfer packet index that marks the last packet of a transfer
pub const XFER_LAST_PACKET_FLAG: u32 = 0x8000_0000;
/// Mask for getting the packet number out of an Xfer packet index
pub const XFER_PACKET_NUM_MASK: u32 = 0x0FFF_FFFF;


#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    UseCircuitCode { code: u32, session_id: Uuid, agent_id: Uuid },
    CompleteAgentMovement { agent_id: Uuid, session_id: Uuid, circuit_code: u32 },
    AgentUpdate { agent_id: Uuid, session_id: Uuid },
    CloseCircuit,
    RegionHandshake { region_id: Uuid, sim_name: String, region_flags: u32 },
    RegionHandshakeReply { agent_id: Uuid, session_id: Uuid, flags: u32 },
    StartPingCheck { ping_id: u8, oldest_unacked: u32 },
    CompletePingCheck { ping_id: u8 },
    DisableSimulator,
    KickUser { reason: String },
    LogoutRequest { agent_id: Uuid, session_id: Uuid },
    LogoutReply { agent_id: Uuid, session_id: Uuid, item_ids: Vec<Uuid> },

    TransferRequest {
        transfer_id: Uuid,
        channel: ChannelType,
        source: SourceType,
        priority: f32,
        params: Bytes,
    },
    TransferInfo {
        transfer_id: Uuid,
        channel: ChannelType,
        target: TargetType,
        status: StatusCode,
        size: i32,
        params: Bytes,
    },
    TransferPacket {
        transfer_id: Uuid,
        channel: ChannelType,
        packet: i32,
        status: StatusCode,
        data: Bytes,
    },
    TransferAbort { transfer_id: Uuid, channel: ChannelType },

    RequestXfer {
        id: u64,
        filename: String,
        file_path: u8,
        delete_on_completion: bool,
        use_big_packets: bool,
        vfile_id: Uuid,
        vfile_type: i16,
    },
    SendXferPacket { id: u64, packet: u32, data: Bytes },
    ConfirmXferPacket { id: u64, packet: u32 },
    AbortXfer { id: u64, result: i32 },
    AssetUploadRequest {
        transaction_id: Uuid,
        asset_type: AssetType,
        tempfile: bool,
        store_local: bool,
        data: Bytes,
    },
    AssetUploadComplete { asset_id: Uuid, asset_type: AssetType, success: bool },
    InitiateDownload { sim_filename: String, viewer_filename: String },

    /// A packet that only matters to higher-level collaborators. The body is passed through
    ///  opaquely.
    Other { name: String, body: Bytes },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::UseCircuitCode { .. } => PacketType::UseCircuitCode,
            Packet::CompleteAgentMovement { .. } => PacketType::CompleteAgentMovement,
            Packet::AgentUpdate { .. } => PacketType::AgentUpdate,
            Packet::CloseCircuit => PacketType::CloseCircuit,
            Packet::RegionHandshake { .. } => PacketType::RegionHandshake,
            Packet::RegionHandshakeReply { .. } => PacketType::RegionHandshakeReply,
            Packet::StartPingCheck { .. } => PacketType::StartPingCheck,
            Packet::CompletePingCheck { .. } => PacketType::CompletePingCheck,
            Packet::DisableSimulator => PacketType::DisableSimulator,
            Packet::KickUser { .. } => PacketType::KickUser,
            Packet::LogoutRequest { .. } => PacketType::LogoutRequest,
            Packet::LogoutReply { .. } => PacketType::LogoutReply,
            Packet::TransferRequest { .. } => PacketType::TransferRequest,
            Packet::TransferInfo { .. } => PacketType::TransferInfo,
            Packet::TransferPacket { .. } => PacketType::TransferPacket,
            Packet::TransferAbort { .. } => PacketType::TransferAbort,
            Packet::RequestXfer { .. } => PacketType::RequestXfer,
            Packet::SendXferPacket { .. } => PacketType::SendXferPacket,
            Packet::ConfirmXferPacket { .. } => PacketType::ConfirmXferPacket,
            Packet::AbortXfer { .. } => PacketType::AbortXfer,
            Packet::AssetUploadRequest { .. } => PacketType::AssetUploadRequest,
            Packet::AssetUploadComplete { .. } => PacketType::AssetUploadComplete,
            Packet::InitiateDownload { .. } => PacketType::InitiateDownload,
            Packet::Other { name, .. } => PacketType::Other(name.clone()),
        }
    }
}


/// Tag of a packet, used for registering callbacks and for matching the server's deny-list
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum PacketType {
    UseCircuitCode,
    CompleteAgentMovement,
    AgentUpdate,
    CloseCircuit,
    RegionHandshake,
    RegionHandshakeReply,
    StartPingCheck,
    CompletePingCheck,
    DisableSimulator,
    KickUser,
    LogoutRequest,
    LogoutReply,
    TransferRequest,
    TransferInfo,
    TransferPacket,
    TransferAbort,
    RequestXfer,
    SendXferPacket,
    ConfirmXferPacket,
    AbortXfer,
    AssetUploadRequest,
    AssetUploadComplete,
    InitiateDownload,
    Other(String),
}

impl PacketType {
    /// the packet's name in the message template
    pub fn name(&self) -> &str {
        match self {
            PacketType::UseCircuitCode => "UseCircuitCode",
            PacketType::CompleteAgentMovement => "CompleteAgentMovement",
            PacketType::AgentUpdate => "AgentUpdate",
            PacketType::CloseCircuit => "CloseCircuit",
            PacketType::RegionHandshake => "RegionHandshake",
            PacketType::RegionHandshakeReply => "RegionHandshakeReply",
            PacketType::StartPingCheck => "StartPingCheck",
            PacketType::CompletePingCheck => "CompletePingCheck",
            PacketType::DisableSimulator => "DisableSimulator",
            PacketType::KickUser => "KickUser",
            PacketType::LogoutRequest => "LogoutRequest",
            PacketType::LogoutReply => "LogoutReply",
            PacketType::TransferRequest => "TransferRequest",
            PacketType::TransferInfo => "TransferInfo",
            PacketType::TransferPacket => "TransferPacket",
            PacketType::TransferAbort => "TransferAbort",
            PacketType::RequestXfer => "RequestXfer",
            PacketType::SendXferPacket => "SendXferPacket",
            PacketType::ConfirmXferPacket => "ConfirmXferPacket",
            PacketType::AbortXfer => "AbortXfer",
            PacketType::AssetUploadRequest => "AssetUploadRequest",
            PacketType::AssetUploadComplete => "AssetUploadComplete",
            PacketType::InitiateDownload => "InitiateDownload",
            PacketType::Other(name) => name,
        }
    }
}

impl Debug for PacketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}


/// A neighbouring simulator announced by the server
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NeighborHost {
    pub addr: SocketAddr,
    pub region_handle: u64,
}

/// Messages arriving over the capability event channel, as handed over by that collaborator
#[derive(Clone, Debug, PartialEq)]
pub enum CapsMessage {
    EnableSimulator(Vec<NeighborHost>),
    Other(Bytes),
}


/// Encoding of packets to and from datagrams. Reliability bookkeeping (acks, resends) happens on
///  this level as well.
pub trait PacketCodec: Send + Sync + 'static {
    fn encode(&self, sequence: u32, packet: &Packet) -> anyhow::Result<Bytes>;

    fn decode(&self, datagram: &[u8]) -> anyhow::Result<Packet>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(Packet::CloseCircuit, "CloseCircuit")]
    #[case::with_fields(Packet::ConfirmXferPacket { id: 5, packet: 1 }, "ConfirmXferPacket")]
    #[case::other(Packet::Other { name: "ImprovedInstantMessage".to_string(), body: Bytes::new() }, "ImprovedInstantMessage")]
    fn test_wire_name(#[case] packet: Packet, #[case] expected: &str) {
        assert_eq!(packet.packet_type().name(), expected);
    }

    #[test]
    fn test_other_packet_type_equality() {
        let a = Packet::Other { name: "ObjectUpdate".to_string(), body: Bytes::new() };
        assert_eq!(a.packet_type(), PacketType::Other("ObjectUpdate".to_string()));
        assert_ne!(a.packet_type(), PacketType::Other("ObjectKill".to_string()));
    }
}
