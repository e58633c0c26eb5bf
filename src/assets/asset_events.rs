use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::assets::asset_types::{AssetType, TransferError};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AssetEvent {
    /// terminal event of an Xfer download
    XferReceived(XferReceivedData),
    UploadProgress(UploadProgressData),
    /// terminal event of an upload
    AssetUploaded(AssetUploadedData),
    InitiateDownload(InitiateDownloadData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XferReceivedData {
    pub transfer_id: Uuid,
    pub vfile_id: Uuid,
    pub filename: String,
    pub success: bool,
    pub error: TransferError,
    pub data: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadProgressData {
    pub transfer_id: Uuid,
    pub asset_id: Uuid,
    pub transferred: usize,
    pub size: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssetUploadedData {
    pub transfer_id: Uuid,
    pub asset_id: Uuid,
    pub asset_type: AssetType,
    pub success: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitiateDownloadData {
    pub sim_filename: String,
    pub viewer_filename: String,
}


pub struct AssetEventNotifier {
    sender: broadcast::Sender<AssetEvent>,
}
impl AssetEventNotifier {
    pub fn new(capacity: usize) -> AssetEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        AssetEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssetEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: AssetEvent) {
        trace!("asset event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
