use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use sha2::{Digest, Sha256};

use crate::FileId;

/// Produces identifiers for new uploads.
pub trait IdGenerator: Send + Sync {
    fn generate(&self, filename: &str, at: SystemTime) -> FileId;
}

/// SHA-256 over the filename, the upload time in nanoseconds and a process
/// local sequence number.
///
/// The sequence number keeps two uploads of the same filename within one
/// clock tick from hashing the same input.
#[derive(Debug, Default)]
pub struct Sha256IdGenerator {
    seq: AtomicU64,
}

impl Sha256IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for Sha256IdGenerator {
    fn generate(&self, filename: &str, at: SystemTime) -> FileId {
        let nanos = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        hasher.update(format!("-{}-{}", nanos, seq).as_bytes());
        FileId::new(hex::encode(hasher.finalize()))
    }
}
