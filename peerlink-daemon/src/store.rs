//! Blob store on disk: one file per blob under the store directory.

use std::io::ErrorKind;
use std::path::PathBuf;

use peerlink_core::{BlobError, BlobRef, BlobStore};
use tracing::warn;

/// Cheap to clone; every clone works on the same directory. The reactor owns one
/// through the dispatcher, transports keep their own to read outbound and write
/// inbound blobs.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Create the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Fresh blob name for `category`; nothing is written yet.
    pub fn new_ref(&self, category: &str) -> BlobRef {
        BlobRef::new(format!("{}-{}", category, uuid::Uuid::new_v4()))
    }

    pub fn path(&self, blob: &BlobRef) -> PathBuf {
        self.dir.join(blob.as_str())
    }
}

fn not_found(blob: &BlobRef, e: std::io::Error) -> BlobError {
    if e.kind() == ErrorKind::NotFound {
        BlobError::NotFound(blob.clone())
    } else {
        BlobError::Io(e)
    }
}

impl BlobStore for FsBlobStore {
    fn write(&mut self, category: &str, bytes: &[u8]) -> Result<BlobRef, BlobError> {
        let blob = self.new_ref(category);
        std::fs::write(self.path(&blob), bytes)?;
        Ok(blob)
    }

    fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        std::fs::read(self.path(blob)).map_err(|e| not_found(blob, e))
    }

    fn delete(&mut self, blob: &BlobRef) {
        if let Err(e) = std::fs::remove_file(self.path(blob)) {
            if e.kind() != ErrorKind::NotFound {
                warn!("failed to delete blob {}: {}", blob, e);
            }
        }
    }

    fn exists(&self, blob: &BlobRef) -> bool {
        self.path(blob).is_file()
    }

    fn quarantine(&mut self, blob: &BlobRef) {
        let from = self.path(blob);
        let to = self.dir.join(format!("{}.bad", blob));
        if let Err(e) = std::fs::rename(&from, &to) {
            warn!("failed to quarantine blob {}: {}", blob, e);
        }
    }
}
