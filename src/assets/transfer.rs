use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bit_set::BitSet;
use bytes::Bytes;
use tokio::sync::watch;
use uuid::Uuid;

use crate::assets::asset::Asset;
use crate::assets::asset_types::{AssetType, ChannelType, SourceType, StatusCode};
use crate::network::circuit::Circuit;

/// Terminal outcome of a Transfer download, handed to the download's callback exactly once
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadResult {
    pub transfer_id: Uuid,
    pub asset_id: Uuid,
    pub status: StatusCode,
    /// `Some` iff the download succeeded
    pub asset: Option<Asset>,
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        self.asset.is_some()
    }
}

pub type DownloadCallback = Box<dyn FnOnce(DownloadResult) + Send>;

/// Everything the tracker knows about an in-flight transfer
#[derive(Debug)]
pub enum Transfer {
    Download(AssetDownload),
    XferDownload(XferDownload),
    Upload(AssetUpload),
}

impl Transfer {
    pub fn id(&self) -> Uuid {
        match self {
            Transfer::Download(d) => d.id,
            Transfer::XferDownload(d) => d.id,
            Transfer::Upload(u) => u.id,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Transfer::Download(d) => d.size,
            Transfer::XferDownload(d) => d.size,
            Transfer::Upload(u) => u.data.len(),
        }
    }

    pub fn transferred(&self) -> usize {
        match self {
            Transfer::Download(d) => d.transferred,
            Transfer::XferDownload(d) => d.transferred,
            Transfer::Upload(u) => u.transferred,
        }
    }

    pub fn circuit(&self) -> Option<&Arc<Circuit>> {
        match self {
            Transfer::Download(d) => d.circuit.as_ref(),
            Transfer::XferDownload(d) => d.circuit.as_ref(),
            Transfer::Upload(u) => u.circuit.as_ref(),
        }
    }
}

/// A download through the Transfer protocol
pub struct AssetDownload {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub asset_type: AssetType,
    pub source: SourceType,
    pub channel: ChannelType,
    pub status: StatusCode,
    pub size: usize,
    pub transferred: usize,
    pub buffer: Vec<u8>,
    /// indices of the chunks that were already placed into the buffer
    pub received: BitSet,
    pub header_received: watch::Sender<bool>,
    pub callback: Option<DownloadCallback>,
    pub circuit: Option<Arc<Circuit>>,
}

impl AssetDownload {
    pub fn new(id: Uuid, asset_id: Uuid, asset_type: AssetType, source: SourceType, callback: DownloadCallback, circuit: Option<Arc<Circuit>>) -> AssetDownload {
        AssetDownload {
            id,
            asset_id,
            asset_type,
            source,
            channel: ChannelType::Asset,
            status: StatusCode::Unknown,
            size: 0,
            transferred: 0,
            buffer: Vec::new(),
            received: BitSet::new(),
            header_received: watch::channel(false).0,
            callback: Some(callback),
            circuit,
        }
    }

    pub fn is_header_received(&self) -> bool {
        *self.header_received.borrow()
    }

    /// Takes the callback, so it can be invoked outside the tracker's lock. Returns `None` if the
    ///  outcome was reported already.
    pub fn finish(&mut self, status: StatusCode, data: Option<Bytes>) -> Option<(DownloadCallback, DownloadResult)> {
        let callback = self.callback.take()?;
        let result = DownloadResult {
            transfer_id: self.id,
            asset_id: self.asset_id,
            status,
            asset: data.map(|data| Asset::wrap(self.asset_type, self.asset_id, data)),
        };
        Some((callback, result))
    }
}

impl Debug for AssetDownload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetDownload")
            .field("id", &self.id)
            .field("asset_id", &self.asset_id)
            .field("asset_type", &self.asset_type)
            .field("source", &self.source)
            .field("status", &self.status)
            .field("size", &self.size)
            .field("transferred", &self.transferred)
            .finish()
    }
}

/// A download through the legacy Xfer protocol
#[derive(Debug)]
pub struct XferDownload {
    pub id: Uuid,
    pub handle: u64,
    pub vfile_id: Uuid,
    pub asset_type: AssetType,
    pub filename: String,
    pub size: usize,
    pub transferred: usize,
    /// number of the next packet that is accepted
    pub expected_packet: u32,
    pub buffer: Vec<u8>,
    pub circuit: Option<Arc<Circuit>>,
}

/// An upload through AssetUploadRequest and, for payloads that do not fit into a single packet,
///  the Xfer protocol
#[derive(Debug)]
pub struct AssetUpload {
    /// the transaction id
    pub id: Uuid,
    pub asset_id: Uuid,
    pub asset_type: AssetType,
    pub data: Bytes,
    pub transferred: usize,
    /// handle issued by the server when it requests the data
    pub xfer_id: Option<u64>,
    /// number of the next packet to send
    pub packet_num: u32,
    pub success: bool,
    pub circuit: Option<Arc<Circuit>>,
}
