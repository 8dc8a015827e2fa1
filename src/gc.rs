use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use blob_store::BlobStorage;
use data_model::StorageKey;
use metadata_store::MetadataStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Removes blobs that no file refers to anymore.
///
/// Keys arrive over a channel when a delete could not remove its blob. They
/// are retried on every tick until removal succeeds or the blob is gone.
pub struct Gc {
    blob_storage: Arc<BlobStorage>,
    metadata: Arc<MetadataStore>,
    rx: mpsc::UnboundedReceiver<StorageKey>,
    pending: HashSet<StorageKey>,
    retry_interval: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl Gc {
    pub fn new(
        blob_storage: Arc<BlobStorage>,
        metadata: Arc<MetadataStore>,
        rx: mpsc::UnboundedReceiver<StorageKey>,
        retry_interval: Duration,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            blob_storage,
            metadata,
            rx,
            pending: HashSet::new(),
            retry_interval,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) {
        let mut interval = tokio::time::interval(self.retry_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                key = self.rx.recv() => {
                    let Some(key) = key else {
                        info!("gc channel closed, stopping garbage collector");
                        return;
                    };
                    debug!(key = key.get(), "queued leaked blob");
                    self.pending.insert(key);
                }
                _ = interval.tick() => {
                    self.retry_pending().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if !self.pending.is_empty() {
                        warn!(
                            pending = self.pending.len(),
                            "shutting down with leaked blobs queued"
                        );
                    }
                    info!("gc executor shutting down");
                    return;
                }
            }
        }
    }

    /// Moves queued keys into the pending set and tries to remove each
    /// pending blob once. Returns how many are still pending.
    pub async fn retry_pending(&mut self) -> usize {
        while let Ok(key) = self.rx.try_recv() {
            self.pending.insert(key);
        }
        if self.pending.is_empty() {
            return 0;
        }

        let keys: Vec<StorageKey> = self.pending.iter().cloned().collect();
        for key in keys {
            match self.blob_storage.remove(&key).await {
                Ok(()) => {
                    info!(key = key.get(), "removed leaked blob");
                    self.pending.remove(&key);
                }
                Err(err) if err.is_not_found() => {
                    self.pending.remove(&key);
                }
                Err(err) => {
                    error!(key = key.get(), "error removing leaked blob: {}", err);
                }
            }
        }
        self.pending.len()
    }

    /// Removes every blob whose id has neither metadata nor an upload in
    /// flight. Returns how many blobs were removed.
    pub async fn sweep(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.blob_storage.list_keys().await? {
            if self.metadata.is_claimed(&key.file_id()).await {
                continue;
            }
            match self.blob_storage.remove(&key).await {
                Ok(()) => {
                    debug!(key = key.get(), "swept orphaned blob");
                    removed += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    error!(key = key.get(), "error sweeping orphaned blob: {}", err);
                }
            }
        }
        if removed > 0 {
            info!(removed, "swept orphaned blobs");
        }
        Ok(removed)
    }
}
