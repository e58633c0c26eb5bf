use std::cmp::min;
use std::sync::{Arc, Mutex, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::assets::asset_events::*;
use crate::assets::asset_types::{AssetType, ChannelType, StatusCode, TransferError};
use crate::assets::transfer::{AssetDownload, AssetUpload, DownloadCallback, DownloadResult, Transfer, XferDownload};
use crate::assets::transfer_params::TransferParams;
use crate::assets::transfer_tracker::TransferTracker;
use crate::assets::{SINGLE_PACKET_UPLOAD_OVERHEAD, TRANSFER_CHUNK_SIZE, XFER_CHUNK_SIZE};
use crate::config::NetworkConfig;
use crate::error::AssetError;
use crate::network::circuit::Circuit;
use crate::network::network_events::NetworkEvent;
use crate::network::network_manager::{NetworkManager, PacketSender};
use crate::network::packet_registry::PacketCallback;
use crate::network::session::LivenessFlag;
use crate::packet::{Packet, PacketType, XFER_LAST_PACKET_FLAG, XFER_PACKET_NUM_MASK};
use crate::util::buf_ext::BufExt;
use crate::util::legacy_id::{combine_ids, id_from_xfer_handle, xfer_handle_of};

const PRIORITY_BASE: f32 = 100.0;

/// Ids of a requested upload. Its outcome is reported as [`AssetEvent::AssetUploaded`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UploadTicket {
    pub transaction_id: Uuid,
    pub asset_id: Uuid,
}

/// Downloads and uploads assets through the Transfer and Xfer protocols.
///
/// Requests return as soon as the request packet is queued. Transfer downloads report their
///  outcome to the callback passed with the request, Xfer downloads and uploads report it as an
///  [`AssetEvent`]. Every transfer reports exactly one outcome, except for transfers that are
///  abandoned because the network session went down.
pub struct AssetManager {
    myself: Weak<AssetManager>,
    config: Arc<NetworkConfig>,
    network: Arc<dyn PacketSender>,
    transfers: TransferTracker,
    /// transaction id of the upload that waits for the server to request its data
    pending_upload: watch::Sender<Option<Uuid>>,
    events: AssetEventNotifier,
    disconnect_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        if let Some(listener) = self.disconnect_listener.get_mut().unwrap().take() {
            listener.abort();
        }
    }
}

impl AssetManager {
    pub fn new(config: Arc<NetworkConfig>, network: Arc<dyn PacketSender>) -> Arc<AssetManager> {
        Arc::new_cyclic(|myself| AssetManager {
            myself: myself.clone(),
            events: AssetEventNotifier::new(config.event_channel_capacity),
            config,
            network,
            transfers: TransferTracker::new(),
            pending_upload: watch::channel(None).0,
            disconnect_listener: Default::default(),
        })
    }

    /// Creates an asset manager that sends through the given network manager and is attached
    ///  to it
    pub fn for_network(network: &Arc<NetworkManager>) -> Arc<AssetManager> {
        let assets = AssetManager::new(network.config().clone(), network.clone());
        assets.attach(network);
        assets
    }

    /// Registers the asset packet handlers with the network manager, and abandons all in-flight
    ///  transfers whenever its session goes down. Must be called from within a tokio runtime.
    pub fn attach(self: &Arc<Self>, network: &NetworkManager) {
        let handler = Arc::new(AssetPacketHandler { assets: Arc::downgrade(self) });
        for packet_type in [
            PacketType::TransferInfo,
            PacketType::TransferPacket,
            PacketType::RequestXfer,
            PacketType::SendXferPacket,
            PacketType::ConfirmXferPacket,
            PacketType::AbortXfer,
            PacketType::AssetUploadComplete,
            PacketType::InitiateDownload,
        ] {
            network.register_packet_callback(packet_type, handler.clone());
        }

        let mut network_events = network.subscribe();
        let assets = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                match network_events.recv().await {
                    Ok(NetworkEvent::Disconnected(data)) => {
                        let Some(assets) = assets.upgrade()
                        else {
                            break;
                        };
                        debug!("network session ended ({:?})", data.reason);
                        assets.abandon_all();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("asset manager missed {} network events", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.disconnect_listener.lock().unwrap().replace(listener) {
            previous.abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssetEvent> {
        self.events.subscribe()
    }

    /// Drops every in-flight transfer and frees the upload slot, without reporting outcomes
    pub fn abandon_all(&self) {
        self.transfers.clear();
        self.pending_upload.send_replace(None);
    }

    /// Requests an asset from the asset store. The callback is called with the outcome.
    pub async fn request_asset(
        &self,
        asset_id: Uuid,
        asset_type: AssetType,
        priority: bool,
        callback: impl FnOnce(DownloadResult) + Send + 'static,
    ) -> Uuid {
        let params = TransferParams::Asset { asset_id, asset_type };
        self.request_transfer(params, priority, Box::new(callback), None).await
    }

    /// Requests the asset behind an inventory item, which the simulator checks against the item's
    ///  permissions. A `task_id` of nil refers to the agent's own inventory.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_inventory_asset(
        &self,
        asset_id: Uuid,
        item_id: Uuid,
        task_id: Uuid,
        owner_id: Uuid,
        asset_type: AssetType,
        priority: bool,
        callback: impl FnOnce(DownloadResult) + Send + 'static,
    ) -> Uuid {
        let session = self.network.session();
        let params = TransferParams::InventoryItem {
            agent_id: session.agent_id,
            session_id: session.session_id,
            owner_id,
            task_id,
            item_id,
            asset_id,
            asset_type,
        };
        let circuit = self.network.current_circuit();
        self.request_transfer(params, priority, Box::new(callback), circuit).await
    }

    async fn request_transfer(&self, params: TransferParams, priority: bool, callback: DownloadCallback, circuit: Option<Arc<Circuit>>) -> Uuid {
        let transfer_id = Uuid::new_v4();
        let source = params.source();
        debug!("requesting {:?} asset {} as transfer {}", params.asset_type(), params.asset_id(), transfer_id);

        self.transfers.insert(Transfer::Download(AssetDownload::new(
            transfer_id,
            params.asset_id(),
            params.asset_type(),
            source,
            callback,
            circuit.clone().or_else(|| self.network.current_circuit()),
        )));

        self.network.send_packet(Packet::TransferRequest {
            transfer_id,
            channel: ChannelType::Asset,
            source,
            priority: PRIORITY_BASE + if priority { 1.0 } else { 0.0 },
            params: params.ser(),
        }, circuit).await;

        transfer_id
    }

    /// Requests a file through the Xfer protocol. The outcome is reported as
    ///  [`AssetEvent::XferReceived`] with the returned id.
    pub async fn request_asset_xfer(
        &self,
        filename: &str,
        delete_on_completion: bool,
        use_big_packets: bool,
        vfile_id: Uuid,
        vfile_type: AssetType,
        from_cache: bool,
    ) -> Uuid {
        let handle = xfer_handle_of(&Uuid::new_v4());
        let id = id_from_xfer_handle(handle);
        debug!("requesting file {:?} as xfer {}", filename, handle);

        {
            let mut table = self.transfers.lock();
            table.insert(Transfer::XferDownload(XferDownload {
                id,
                handle,
                vfile_id,
                asset_type: vfile_type,
                filename: filename.to_string(),
                size: 0,
                transferred: 0,
                expected_packet: 0,
                buffer: Vec::new(),
                circuit: self.network.current_circuit(),
            }));
            table.bind_handle(handle, id);
        }

        self.network.send_packet(Packet::RequestXfer {
            id: handle,
            filename: filename.to_string(),
            file_path: if from_cache { 4 } else { 0 },
            delete_on_completion,
            use_big_packets,
            vfile_id,
            vfile_type: vfile_type.wire_code() as i16,
        }, None).await;

        self.spawn_xfer_header_guard(id, handle);
        id
    }

    /// The server may never start sending a requested file. Fails the download if its first
    ///  packet did not arrive in time.
    fn spawn_xfer_header_guard(&self, id: Uuid, handle: u64) {
        let assets = self.myself.clone();
        let mut liveness = self.network.liveness();
        let header_timeout = self.config.xfer_header_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = liveness.wait_for_shutdown() => {}
                _ = sleep(header_timeout) => {
                    if let Some(assets) = assets.upgrade() {
                        assets.on_xfer_header_timeout(id, handle).await;
                    }
                }
            }
        });
    }

    async fn on_xfer_header_timeout(&self, id: Uuid, handle: u64) {
        let xfer = {
            let mut table = self.transfers.lock();
            match table.get_mut(&id) {
                Some(Transfer::XferDownload(xfer)) if xfer.expected_packet == 0 => {}
                _ => return,
            }
            match table.remove(&id) {
                Some(Transfer::XferDownload(xfer)) => xfer,
                _ => return,
            }
        };

        warn!("no data for xfer {} ({:?}) after {:?} - aborting", handle, xfer.filename, self.config.xfer_header_timeout);
        self.network.send_packet(Packet::AbortXfer { id: handle, result: TransferError::TcpTimeout.into() }, xfer.circuit.clone()).await;
        self.events.send_event(AssetEvent::XferReceived(xfer_outcome(xfer, false, TransferError::TcpTimeout)));
    }

    /// Uploads an asset. Payloads that fit into a single packet are sent right away, larger
    ///  payloads wait for the upload slot and are then sent in chunks as the server requests them.
    pub async fn request_upload(&self, asset_type: AssetType, data: Bytes, store_local: bool) -> Result<UploadTicket, AssetError> {
        let mut liveness = self.network.liveness();
        if !liveness.is_alive() {
            return Err(AssetError::NotConnected);
        }

        let transaction_id = Uuid::new_v4();
        let asset_id = combine_ids(&transaction_id, &self.network.session().secure_session_id);
        let is_single_packet = data.len() + SINGLE_PACKET_UPLOAD_OVERHEAD < self.config.max_packet_size;
        info!("beginning {} upload of {:?} asset {} ({} bytes)", if is_single_packet { "single packet" } else { "multi packet" }, asset_type, asset_id, data.len());

        self.wait_for_upload_slot(transaction_id, !is_single_packet, &mut liveness).await?;

        self.transfers.insert(Transfer::Upload(AssetUpload {
            id: transaction_id,
            asset_id,
            asset_type,
            data: data.clone(),
            transferred: if is_single_packet { data.len() } else { 0 },
            xfer_id: None,
            packet_num: 0,
            success: false,
            circuit: self.network.current_circuit(),
        }));

        self.network.send_packet(Packet::AssetUploadRequest {
            transaction_id,
            asset_type,
            tempfile: false,
            store_local,
            data: if is_single_packet { data } else { Bytes::new() },
        }, None).await;

        Ok(UploadTicket { transaction_id, asset_id })
    }

    /// Waits until no upload is pending. If `arm` is set, the slot is then claimed for this upload.
    async fn wait_for_upload_slot(&self, transaction_id: Uuid, arm: bool, liveness: &mut LivenessFlag) -> Result<(), AssetError> {
        let deadline = Instant::now() + self.config.upload_confirm_timeout;
        let mut slot = self.pending_upload.subscribe();

        loop {
            let is_free = tokio::select! {
                _ = liveness.wait_for_shutdown() => return Err(AssetError::ShutDown),
                r = timeout_at(deadline, async { slot.wait_for(|pending| pending.is_none()).await.is_ok() }) => r.unwrap_or(false),
            };
            if !liveness.is_alive() {
                return Err(AssetError::ShutDown);
            }
            if !is_free {
                warn!("timed out waiting for the previous upload to begin");
                return Err(AssetError::UploadSlotTimeout);
            }
            if !arm {
                return Ok(());
            }

            let claimed = self.pending_upload.send_if_modified(|pending| {
                if pending.is_some() {
                    return false;
                }
                *pending = Some(transaction_id);
                true
            });
            if claimed {
                return Ok(());
            }
        }
    }

    pub(crate) async fn on_packet(&self, packet: &Packet, circuit: &Arc<Circuit>) {
        match packet {
            Packet::TransferInfo { transfer_id, channel, status, size, params, .. } => {
                self.on_transfer_info(*transfer_id, *channel, *status, *size, params);
            }
            Packet::TransferPacket { transfer_id, packet, data, .. } => {
                self.on_transfer_packet(*transfer_id, *packet, data, circuit).await;
            }
            Packet::RequestXfer { id, vfile_type, .. } => {
                self.on_request_xfer(*id, *vfile_type, circuit).await;
            }
            Packet::SendXferPacket { id, packet, data } => {
                self.on_send_xfer_packet(*id, *packet, data, circuit).await;
            }
            Packet::ConfirmXferPacket { id, packet } => {
                self.on_confirm_xfer_packet(*id, *packet, circuit).await;
            }
            Packet::AbortXfer { id, result } => {
                self.on_abort_xfer(*id, *result);
            }
            Packet::AssetUploadComplete { asset_id, asset_type, success } => {
                self.on_asset_upload_complete(*asset_id, *asset_type, *success);
            }
            Packet::InitiateDownload { sim_filename, viewer_filename } => {
                self.events.send_event(AssetEvent::InitiateDownload(InitiateDownloadData {
                    sim_filename: sim_filename.clone(),
                    viewer_filename: viewer_filename.clone(),
                }));
            }
            other => {
                error!("asset handler received unexpected {:?} - this is a bug", other.packet_type());
            }
        }
    }

    fn on_transfer_info(&self, transfer_id: Uuid, channel: ChannelType, status: StatusCode, size: i32, params: &[u8]) {
        let outcome = {
            let mut table = self.transfers.lock();
            let Some(Transfer::Download(download)) = table.get_mut(&transfer_id)
            else {
                warn!("received transfer info for unknown transfer {} - ignoring", transfer_id);
                return;
            };
            if download.is_header_received() {
                debug!("transfer {}: header arrived again - ignoring", transfer_id);
                return;
            }

            download.channel = channel;
            download.status = status;

            let outcome = match usize::try_from(size) {
                _ if status != StatusCode::Ok => {
                    warn!("transfer {} of asset {} failed: {:?}", transfer_id, download.asset_id, status);
                    download.finish(status, None)
                }
                Err(_) => {
                    warn!("transfer {} announced a negative size of {}", transfer_id, size);
                    download.finish(StatusCode::Error, None)
                }
                Ok(size) if size > self.config.max_asset_size => {
                    warn!("transfer {} announced {} bytes, more than the limit of {}", transfer_id, size, self.config.max_asset_size);
                    download.finish(StatusCode::Error, None)
                }
                Ok(size) => {
                    trace!("transfer {} has {} bytes", transfer_id, size);
                    download.size = size;
                    download.buffer = vec![0; size];
                    match TransferParams::deser(download.source, params) {
                        Ok(params) => {
                            download.asset_id = params.asset_id();
                            download.asset_type = params.asset_type();
                        }
                        Err(e) => warn!("transfer {}: {}", transfer_id, e),
                    }
                    download.header_received.send_replace(true);

                    if size > 0 {
                        return;
                    }
                    download.finish(StatusCode::Done, Some(Bytes::new()))
                }
            };

            table.remove(&transfer_id);
            outcome
        };

        if let Some((callback, result)) = outcome {
            callback(result);
        }
    }

    async fn on_transfer_packet(&self, transfer_id: Uuid, packet: i32, data: &[u8], circuit: &Arc<Circuit>) {
        let header_wait = {
            let mut table = self.transfers.lock();
            let Some(Transfer::Download(download)) = table.get_mut(&transfer_id)
            else {
                warn!("received chunk #{} of unknown transfer {} - ignoring", packet, transfer_id);
                return;
            };
            (!download.is_header_received()).then(|| download.header_received.subscribe())
        };

        if let Some(mut header_received) = header_wait {
            debug!("chunk #{} of transfer {} arrived before its header - waiting", packet, transfer_id);
            let mut liveness = self.network.liveness();
            tokio::select! {
                _ = liveness.wait_for_shutdown() => {
                    debug!("network session ended while transfer {} was waiting for its header", transfer_id);
                    return;
                }
                _ = timeout(self.config.transfer_header_timeout, async { let _ = header_received.wait_for(|received| *received).await; }) => {}
            }
        }

        let (channel, outcome) = {
            let mut table = self.transfers.lock();
            let Some(Transfer::Download(download)) = table.get_mut(&transfer_id)
            else {
                debug!("transfer {} finished while its chunk #{} was waiting", transfer_id, packet);
                return;
            };

            if !download.is_header_received() {
                warn!("no header for transfer {} after {:?} - aborting", transfer_id, self.config.transfer_header_timeout);
                let channel = download.channel;
                let outcome = download.finish(StatusCode::Abort, None);
                table.remove(&transfer_id);
                (Some(channel), outcome)
            }
            else {
                if !place_chunk(download, packet, data) {
                    return;
                }
                let buffer = std::mem::take(&mut download.buffer);
                debug!("transfer {} of asset {} complete", transfer_id, download.asset_id);
                let outcome = download.finish(StatusCode::Done, Some(Bytes::from(buffer)));
                table.remove(&transfer_id);
                (None, outcome)
            }
        };

        if let Some(channel) = channel {
            self.network.send_packet(Packet::TransferAbort { transfer_id, channel }, Some(circuit.clone())).await;
        }
        if let Some((callback, result)) = outcome {
            callback(result);
        }
    }

    async fn on_request_xfer(&self, handle: u64, vfile_type: i16, circuit: &Arc<Circuit>) {
        let mut pending = None;
        self.pending_upload.send_if_modified(|slot| {
            pending = slot.take();
            pending.is_some()
        });
        let Some(transaction_id) = pending
        else {
            warn!("server requested xfer {} for an unknown upload - ignoring", handle);
            return;
        };

        let first_packet = {
            let mut table = self.transfers.lock();
            table.bind_handle(handle, transaction_id);
            let Some(Transfer::Upload(upload)) = table.get_mut(&transaction_id)
            else {
                warn!("upload {} is gone - ignoring xfer request", transaction_id);
                return;
            };

            upload.xfer_id = Some(handle);
            upload.asset_type = AssetType::from_wire(vfile_type.into());
            upload.circuit = Some(circuit.clone());
            debug!("server requested upload {} as xfer {}", transaction_id, handle);
            next_upload_packet(upload, handle)
        };

        self.network.send_packet(first_packet, Some(circuit.clone())).await;
    }

    async fn on_confirm_xfer_packet(&self, handle: u64, packet: u32, circuit: &Arc<Circuit>) {
        let (progress, next_packet) = {
            let mut table = self.transfers.lock();
            let Some(Transfer::Upload(upload)) = table.get_by_handle_mut(handle)
            else {
                debug!("confirmation of packet #{} for unknown upload {} - ignoring", packet, handle);
                return;
            };

            trace!("upload {} confirmed packet #{} ({}/{})", handle, packet, upload.transferred, upload.data.len());
            let progress = UploadProgressData {
                transfer_id: upload.id,
                asset_id: upload.asset_id,
                transferred: upload.transferred,
                size: upload.data.len(),
            };
            let next_packet = (upload.transferred < upload.data.len())
                .then(|| next_upload_packet(upload, handle));
            (progress, next_packet)
        };

        self.events.send_event(AssetEvent::UploadProgress(progress));
        if let Some(next_packet) = next_packet {
            self.network.send_packet(next_packet, Some(circuit.clone())).await;
        }
    }

    fn on_asset_upload_complete(&self, asset_id: Uuid, asset_type: AssetType, success: bool) {
        let mut upload = {
            let mut table = self.transfers.lock();
            let Some(id) = table.find_upload(&asset_id)
            else {
                warn!("upload completion for unknown asset {} - ignoring", asset_id);
                return;
            };
            match table.remove(&id) {
                Some(Transfer::Upload(upload)) => upload,
                _ => return,
            }
        };

        // a single packet upload never occupies the slot
        self.pending_upload.send_if_modified(|slot| {
            if *slot != Some(upload.id) {
                return false;
            }
            *slot = None;
            true
        });

        upload.success = success;
        upload.asset_type = asset_type;
        info!("upload of asset {} finished, success: {}", upload.asset_id, upload.success);
        self.events.send_event(AssetEvent::AssetUploaded(AssetUploadedData {
            transfer_id: upload.id,
            asset_id: upload.asset_id,
            asset_type: upload.asset_type,
            success: upload.success,
        }));
    }

    async fn on_send_xfer_packet(&self, handle: u64, packet: u32, data: &[u8], circuit: &Arc<Circuit>) {
        let mut confirm = None;
        let mut outcome = None;
        {
            let mut table = self.transfers.lock();
            let Some(Transfer::XferDownload(xfer)) = table.get_by_handle_mut(handle)
            else {
                warn!("received packet for unknown xfer {} - ignoring", handle);
                return;
            };

            let packet_num = packet & XFER_PACKET_NUM_MASK;
            let expected = xfer.expected_packet;

            if packet_num != expected {
                if expected > 0 && packet_num == expected - 1 {
                    debug!("xfer {}: packet #{} arrived again - resending its confirmation", handle, packet_num);
                    confirm = Some(packet_num);
                }
                else {
                    warn!("xfer {}: received packet #{} while expecting #{}", handle, packet_num, expected);
                    confirm = expected.checked_sub(1);
                }
            }
            else {
                match accept_xfer_packet(xfer, packet_num, data, self.config.max_asset_size) {
                    Ok(()) => {
                        xfer.expected_packet += 1;
                        confirm = Some(packet_num);
                        if packet & XFER_LAST_PACKET_FLAG != 0 {
                            if let Some(Transfer::XferDownload(xfer)) = table.remove_by_handle(handle) {
                                debug!("xfer {} ({:?}) complete", handle, xfer.filename);
                                outcome = Some(xfer_outcome(xfer, true, TransferError::None));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("xfer {}: {} - failing the download", handle, e);
                        if let Some(Transfer::XferDownload(xfer)) = table.remove_by_handle(handle) {
                            outcome = Some(xfer_outcome(xfer, false, TransferError::Failed));
                        }
                    }
                }
            }
        }

        if let Some(packet) = confirm {
            self.network.send_packet(Packet::ConfirmXferPacket { id: handle, packet }, Some(circuit.clone())).await;
        }
        if let Some(outcome) = outcome {
            self.events.send_event(AssetEvent::XferReceived(outcome));
        }
    }

    fn on_abort_xfer(&self, handle: u64, result: i32) {
        let Some(transfer) = self.transfers.lock().remove_by_handle(handle)
        else {
            debug!("server aborted unknown xfer {} - ignoring", handle);
            return;
        };

        let error = TransferError::from_wire(result);
        warn!("server aborted xfer {}: {:?}", handle, error);
        match transfer {
            Transfer::XferDownload(xfer) => {
                self.events.send_event(AssetEvent::XferReceived(xfer_outcome(xfer, false, error)));
            }
            Transfer::Upload(upload) => {
                self.events.send_event(AssetEvent::AssetUploaded(AssetUploadedData {
                    transfer_id: upload.id,
                    asset_id: upload.asset_id,
                    asset_type: upload.asset_type,
                    success: false,
                }));
            }
            Transfer::Download(_) => {}
        }
    }
}

/// Copies a chunk into the download buffer at its fixed offset. Returns true if the download is
///  complete.
fn place_chunk(download: &mut AssetDownload, packet: i32, data: &[u8]) -> bool {
    let Ok(index) = usize::try_from(packet)
    else {
        warn!("transfer {}: invalid chunk index {} - dropping", download.id, packet);
        return false;
    };
    if download.received.contains(index) {
        debug!("transfer {}: duplicate chunk #{} - dropping", download.id, index);
        return false;
    }

    let offset = index * TRANSFER_CHUNK_SIZE;
    let end = offset + data.len();
    if end > download.buffer.len() {
        warn!("transfer {}: chunk #{} exceeds the announced size of {} - dropping", download.id, index, download.size);
        return false;
    }

    download.buffer[offset..end].copy_from_slice(data);
    download.received.insert(index);
    download.transferred += data.len();
    trace!("transfer {}: chunk #{}, {}/{} bytes", download.id, index, download.transferred, download.size);
    download.transferred >= download.size
}

fn accept_xfer_packet(xfer: &mut XferDownload, packet_num: u32, mut data: &[u8], max_size: usize) -> anyhow::Result<()> {
    let offset = if packet_num == 0 {
        let size = data.checked_get_u32_le()? as usize;
        if size > max_size {
            bail!("announced size of {} exceeds the limit of {}", size, max_size);
        }
        xfer.size = size;
        xfer.buffer = vec![0; size];
        0
    }
    else {
        packet_num as usize * XFER_CHUNK_SIZE
    };

    let end = offset + data.len();
    if end > xfer.buffer.len() {
        bail!("packet #{} exceeds the announced size of {}", packet_num, xfer.size);
    }
    xfer.buffer[offset..end].copy_from_slice(data);
    xfer.transferred += data.len();
    Ok(())
}

fn xfer_outcome(xfer: XferDownload, success: bool, error: TransferError) -> XferReceivedData {
    XferReceivedData {
        transfer_id: xfer.id,
        vfile_id: xfer.vfile_id,
        filename: xfer.filename,
        success,
        error,
        data: if success { Bytes::from(xfer.buffer) } else { Bytes::new() },
    }
}

/// Packet 0 carries the total size in front of its chunk, the last packet has the high bit of
///  its number set
fn next_upload_packet(upload: &mut AssetUpload, handle: u64) -> Packet {
    let size = upload.data.len();
    let packet_num = upload.packet_num;
    let offset = packet_num as usize * XFER_CHUNK_SIZE;
    let end = min(offset + XFER_CHUNK_SIZE, size);
    let chunk = upload.data.slice(offset..end);

    let data = if packet_num == 0 {
        let mut buf = BytesMut::with_capacity(4 + chunk.len());
        buf.put_u32_le(size as u32);
        buf.put_slice(&chunk);
        buf.freeze()
    }
    else {
        chunk
    };

    upload.transferred = end;
    upload.packet_num += 1;

    Packet::SendXferPacket {
        id: handle,
        packet: if end >= size { packet_num | XFER_LAST_PACKET_FLAG } else { packet_num },
        data,
    }
}

struct AssetPacketHandler {
    assets: Weak<AssetManager>,
}

#[async_trait]
impl PacketCallback for AssetPacketHandler {
    async fn on_packet(&self, packet: Arc<Packet>, circuit: Arc<Circuit>) {
        if let Some(assets) = self.assets.upgrade() {
            assets.on_packet(&packet, &circuit).await;
        }
    }
}
