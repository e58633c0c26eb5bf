use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::assets::transfer::Transfer;

/// The in-flight transfers, keyed by their 128-bit id. Xfer transfers are additionally
///  addressable by their legacy 64-bit handle once it is known, through a secondary index that is
///  maintained together with the primary table.
pub struct TransferTracker {
    table: Mutex<TransferTable>,
}

impl TransferTracker {
    pub fn new() -> TransferTracker {
        TransferTracker {
            table: Default::default(),
        }
    }

    /// The guard must not be held across an await
    pub fn lock(&self) -> MutexGuard<'_, TransferTable> {
        self.table.lock().unwrap()
    }

    pub fn insert(&self, transfer: Transfer) {
        self.lock().insert(transfer);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Transfer> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every record without reporting an outcome
    pub fn clear(&self) {
        let mut table = self.lock();
        if !table.records.is_empty() {
            warn!("abandoning {} in-flight transfers", table.records.len());
        }
        table.records.clear();
        table.handles.clear();
    }
}

impl Default for TransferTracker {
    fn default() -> Self {
        TransferTracker::new()
    }
}

#[derive(Default)]
pub struct TransferTable {
    records: FxHashMap<Uuid, Transfer>,
    handles: FxHashMap<u64, Uuid>,
}

impl TransferTable {
    pub fn insert(&mut self, transfer: Transfer) {
        trace!("tracking transfer {}", transfer.id());
        if let Some(previous) = self.records.insert(transfer.id(), transfer) {
            warn!("replaced transfer {} that was still in flight", previous.id());
        }
    }

    /// Makes the transfer addressable by its legacy handle. Returns false if there is no such
    ///  transfer.
    pub fn bind_handle(&mut self, handle: u64, id: Uuid) -> bool {
        if !self.records.contains_key(&id) {
            return false;
        }
        trace!("binding handle {} to transfer {}", handle, id);
        self.handles.insert(handle, id);
        true
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Transfer> {
        self.records.get_mut(id)
    }

    pub fn id_for_handle(&self, handle: u64) -> Option<Uuid> {
        self.handles.get(&handle).copied()
    }

    pub fn get_by_handle_mut(&mut self, handle: u64) -> Option<&mut Transfer> {
        let id = self.id_for_handle(handle)?;
        self.records.get_mut(&id)
    }

    /// Removes the record together with its handle binding
    pub fn remove(&mut self, id: &Uuid) -> Option<Transfer> {
        let removed = self.records.remove(id)?;
        self.handles.retain(|_, bound| bound != id);
        Some(removed)
    }

    pub fn remove_by_handle(&mut self, handle: u64) -> Option<Transfer> {
        let id = self.id_for_handle(handle)?;
        self.remove(&id)
    }

    /// The server confirms uploads by asset id only
    pub fn find_upload(&self, asset_id: &Uuid) -> Option<Uuid> {
        self.records.values()
            .find_map(|t| match t {
                Transfer::Upload(upload) if upload.asset_id == *asset_id => Some(upload.id),
                _ => None,
            })
    }
}
