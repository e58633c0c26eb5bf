use md5::{Digest, Md5};
use uuid::Uuid;

/// The legacy Xfer protocol identifies transfers by a 64-bit handle. Tracker records are keyed by
///  128-bit ids, and a handle maps to the id that carries it in its low 64 bits.
pub fn id_from_xfer_handle(handle: u64) -> Uuid {
    Uuid::from_u64_pair(0, handle)
}

pub fn xfer_handle_of(id: &Uuid) -> u64 {
    id.as_u64_pair().1
}

/// Derives an id from two others by hashing their concatenated bytes. The server derives the id
///  of an uploaded asset from the upload's transaction id and the secure session id this way.
pub fn combine_ids(first: &Uuid, second: &Uuid) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    Uuid::from_bytes(hasher.finalize().into())
}
