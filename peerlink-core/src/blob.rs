//! Blob storage capability: serialized packets waiting to go out or just received.

use std::collections::HashMap;

use crate::identity::BlobRef;

/// Temp storage for packet bytes. The dispatcher deletes each outbound blob exactly once,
/// after the work item owning it leaves the send queue.
pub trait BlobStore {
    /// Store `bytes` under a fresh handle. `category` is a hint (e.g. "outbox", "inbox").
    fn write(&mut self, category: &str, bytes: &[u8]) -> Result<BlobRef, BlobError>;
    fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError>;
    fn delete(&mut self, blob: &BlobRef);
    fn exists(&self, blob: &BlobRef) -> bool;
    /// Keep a malformed blob aside (tagged `.bad`) instead of deleting it.
    fn quarantine(&mut self, blob: &BlobRef);
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(BlobRef),
    #[error("blob i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory [`BlobStore`]. Quarantined blobs move to a separate map.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: HashMap<BlobRef, Vec<u8>>,
    quarantined: HashMap<BlobRef, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &BlobRef> {
        self.quarantined.keys()
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&mut self, category: &str, bytes: &[u8]) -> Result<BlobRef, BlobError> {
        let blob = BlobRef::new(format!("{}-{}", category, uuid::Uuid::new_v4()));
        self.blobs.insert(blob.clone(), bytes.to_vec());
        Ok(blob)
    }

    fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .get(blob)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(blob.clone()))
    }

    fn delete(&mut self, blob: &BlobRef) {
        self.blobs.remove(blob);
    }

    fn exists(&self, blob: &BlobRef) -> bool {
        self.blobs.contains_key(blob)
    }

    fn quarantine(&mut self, blob: &BlobRef) {
        if let Some(bytes) = self.blobs.remove(blob) {
            self.quarantined
                .insert(BlobRef::new(format!("{}.bad", blob)), bytes);
        }
    }
}
