use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::assets::asset_types::{AssetType, SourceType};
use crate::util::buf_ext::{BufExt, BufMutExt};

pub const ASSET_PARAMS_LEN: usize = 20;
pub const INVENTORY_PARAMS_LEN: usize = 100;

/// The parameter block of a Transfer request, identifying the requested content. The server echoes
///  it back in the transfer header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferParams {
    /// Content from the asset store:
    ///
    /// ```ascii
    /// 0:  asset id (16 bytes)
    /// 16: asset type (i32 LE)
    /// ```
    Asset {
        asset_id: Uuid,
        asset_type: AssetType,
    },
    /// Content of an inventory item, which requires the full ownership chain:
    ///
    /// ```ascii
    /// 0:  agent id
    /// 16: session id
    /// 32: owner id
    /// 48: task id
    /// 64: item id
    /// 80: asset id
    /// 96: asset type (i32 LE)
    /// ```
    InventoryItem {
        agent_id: Uuid,
        session_id: Uuid,
        owner_id: Uuid,
        task_id: Uuid,
        item_id: Uuid,
        asset_id: Uuid,
        asset_type: AssetType,
    },
}

impl TransferParams {
    pub fn source(&self) -> SourceType {
        match self {
            TransferParams::Asset { .. } => SourceType::Asset,
            TransferParams::InventoryItem { .. } => SourceType::SimInventoryItem,
        }
    }

    pub fn asset_id(&self) -> Uuid {
        match self {
            TransferParams::Asset { asset_id, .. } => *asset_id,
            TransferParams::InventoryItem { asset_id, .. } => *asset_id,
        }
    }

    pub fn asset_type(&self) -> AssetType {
        match self {
            TransferParams::Asset { asset_type, .. } => *asset_type,
            TransferParams::InventoryItem { asset_type, .. } => *asset_type,
        }
    }

    pub fn ser(&self) -> Bytes {
        match self {
            TransferParams::Asset { asset_id, asset_type } => {
                let mut buf = BytesMut::with_capacity(ASSET_PARAMS_LEN);
                buf.put_uuid(asset_id);
                buf.put_i32_le(asset_type.wire_code());
                buf.freeze()
            }
            TransferParams::InventoryItem { agent_id, session_id, owner_id, task_id, item_id, asset_id, asset_type } => {
                let mut buf = BytesMut::with_capacity(INVENTORY_PARAMS_LEN);
                for id in [agent_id, session_id, owner_id, task_id, item_id, asset_id] {
                    buf.put_uuid(id);
                }
                buf.put_i32_le(asset_type.wire_code());
                buf.freeze()
            }
        }
    }

    /// The expected layout follows from the transfer's source type. Blocks of unexpected length
    ///  are rejected.
    pub fn deser(source: SourceType, mut buf: &[u8]) -> anyhow::Result<TransferParams> {
        match (source, buf.len()) {
            (SourceType::Asset, ASSET_PARAMS_LEN) => {
                let asset_id = buf.checked_get_uuid()?;
                let asset_type = AssetType::from_wire(buf.checked_get_i32_le()?);
                Ok(TransferParams::Asset { asset_id, asset_type })
            }
            (SourceType::SimInventoryItem, INVENTORY_PARAMS_LEN) => {
                Ok(TransferParams::InventoryItem {
                    agent_id: buf.checked_get_uuid()?,
                    session_id: buf.checked_get_uuid()?,
                    owner_id: buf.checked_get_uuid()?,
                    task_id: buf.checked_get_uuid()?,
                    item_id: buf.checked_get_uuid()?,
                    asset_id: buf.checked_get_uuid()?,
                    asset_type: AssetType::from_wire(buf.checked_get_i32_le()?),
                })
            }
            (source, len) => bail!("unsupported transfer parameters: source {:?} with {} bytes", source, len),
        }
    }
}
