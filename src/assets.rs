pub mod asset;
pub mod asset_events;
pub mod asset_manager;
pub mod asset_types;
pub mod transfer;
pub mod transfer_params;
pub mod transfer_tracker;

/// Payload bytes per Xfer packet
pub const XFER_CHUNK_SIZE: usize = 1000;
/// Xfer packet 0 carries the total size in front of the first chunk
pub const XFER_FIRST_PACKET_LEN: usize = XFER_CHUNK_SIZE + 4;
/// Stride at which Transfer chunks are placed into the download buffer
pub const TRANSFER_CHUNK_SIZE: usize = 1000;
/// Room an AssetUploadRequest needs on top of its payload for the payload to be sent inline
pub const SINGLE_PACKET_UPLOAD_OVERHEAD: usize = 100;
