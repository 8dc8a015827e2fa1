//! File lifecycle: upload, list, download, rename and delete.
//!
//! The metadata store decides whether a file exists. Blob I/O always happens
//! outside the metadata lock, so every step re-validates against metadata
//! instead of assuming the state it saw earlier still holds.

use std::{sync::Arc, time::SystemTime};

use anyhow::Result;
use blob_store::{BlobError, BlobStorage};
use bytes::Bytes;
use data_model::{
    get_epoch_time_in_ms,
    guess_content_type,
    FileId,
    FileRecord,
    IdGenerator,
    StorageKey,
};
use futures::{stream::BoxStream, Stream};
use metadata_store::{IndexFile, MetadataError, MetadataStore};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How many ids an upload tries before giving up on a conflict.
pub const MAX_ID_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(FileId),

    #[error("file id already in use: {0}")]
    Conflict(FileId),

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("failed to store file contents: {0}")]
    Write(#[source] BlobError),

    #[error("failed to read file contents: {0}")]
    Read(#[source] BlobError),

    #[error("file {id} has metadata but its contents are missing at {key}")]
    ConsistencyViolation { id: FileId, key: StorageKey },

    #[error("file operation did not complete: {0}")]
    Interrupted(#[source] tokio::task::JoinError),
}

impl From<MetadataError> for FileError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound { id } => FileError::NotFound(id),
            MetadataError::Conflict { id } => FileError::Conflict(id),
        }
    }
}

pub type FileStream = BoxStream<'static, Result<Bytes>>;

#[derive(Clone)]
pub struct FileManager {
    blob_storage: Arc<BlobStorage>,
    metadata: Arc<MetadataStore>,
    index_file: Option<Arc<IndexFile>>,
    id_generator: Arc<dyn IdGenerator>,
    gc_tx: mpsc::UnboundedSender<StorageKey>,
}

impl FileManager {
    pub fn new(
        blob_storage: Arc<BlobStorage>,
        metadata: Arc<MetadataStore>,
        index_file: Option<Arc<IndexFile>>,
        id_generator: Arc<dyn IdGenerator>,
        gc_tx: mpsc::UnboundedSender<StorageKey>,
    ) -> Self {
        Self {
            blob_storage,
            metadata,
            index_file,
            id_generator,
            gc_tx,
        }
    }

    /// Stores `data` under a fresh id and records it as `filename`.
    pub async fn upload(
        &self,
        filename: &str,
        data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<FileRecord, FileError> {
        validate_name(filename)?;
        let created_at = get_epoch_time_in_ms();
        let id = self.reserve_id(filename).await?;
        let key = StorageKey::derive(&id, filename);
        let pending = PendingUpload::new(self.clone(), id.clone(), key.clone());

        let put_result = match self.blob_storage.put(&key, data).await {
            Ok(put_result) => put_result,
            Err(err) => {
                warn!(id = id.get(), "upload failed while writing contents: {}", err);
                pending.abandon().await;
                return Err(FileError::Write(err));
            }
        };

        let record = FileRecord {
            id: id.clone(),
            stored_name: key.clone(),
            original_name: filename.to_string(),
            size: put_result.size_bytes,
            content_type: guess_content_type(filename),
            created_at,
        };

        if let Err(err) = self.metadata.insert(record.clone()).await {
            error!(
                id = id.get(),
                "storing metadata failed after contents were written: {}", err
            );
            pending.abandon().await;
            return Err(err.into());
        }
        pending.commit();
        self.persist().await;

        info!(
            id = record.id.get(),
            name = record.original_name,
            size = record.size,
            sha256 = put_result.sha256_hash,
            "file uploaded"
        );
        Ok(record)
    }

    async fn reserve_id(&self, filename: &str) -> Result<FileId, FileError> {
        let mut attempt = 1;
        loop {
            let id = self.id_generator.generate(filename, SystemTime::now());
            match self.metadata.reserve(&id).await {
                Ok(()) => return Ok(id),
                Err(MetadataError::Conflict { id }) if attempt < MAX_ID_ATTEMPTS => {
                    warn!(id = id.get(), attempt, "generated id already in use, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn abandon_upload(&self, id: &FileId, key: &StorageKey) {
        self.discard_blob(key).await;
        self.metadata.release(id).await;
    }

    // Removes the blob of an upload that never got metadata.
    async fn discard_blob(&self, key: &StorageKey) {
        if let Err(err) = self.blob_storage.remove(key).await {
            if !err.is_not_found() {
                error!(key = key.get(), "failed to discard unreferenced blob: {}", err);
                self.leak(key);
            }
        }
    }

    pub async fn list(&self) -> Vec<FileRecord> {
        self.metadata.list_all().await
    }

    pub async fn get(&self, id: &FileId) -> Result<FileRecord, FileError> {
        self.metadata
            .get(id)
            .await
            .ok_or_else(|| FileError::NotFound(id.clone()))
    }

    /// Opens the contents of `id` for streaming.
    pub async fn download(&self, id: &FileId) -> Result<(FileRecord, FileStream), FileError> {
        let record = self.get(id).await?;
        self.open(record).await
    }

    /// Opens the contents behind a record that was looked up earlier.
    pub async fn open(&self, record: FileRecord) -> Result<(FileRecord, FileStream), FileError> {
        let id = &record.id;
        match self.blob_storage.get(record.storage_key()).await {
            Ok(stream) => Ok((record, stream)),
            Err(err) if err.is_not_found() => {
                // A delete may have won the race since the record was looked up.
                if self.metadata.contains(id).await {
                    error!(
                        id = id.get(),
                        key = record.storage_key().get(),
                        "metadata refers to missing contents"
                    );
                    Err(FileError::ConsistencyViolation {
                        id: id.clone(),
                        key: record.stored_name.clone(),
                    })
                } else {
                    debug!(id = id.get(), "file deleted during download");
                    Err(FileError::NotFound(id.clone()))
                }
            }
            Err(err) => Err(FileError::Read(err)),
        }
    }

    /// Changes the display name of `id`. The stored contents and storage key
    /// are untouched.
    pub async fn rename(&self, id: &FileId, new_name: &str) -> Result<FileRecord, FileError> {
        validate_name(new_name)?;
        let record = self.metadata.rename(id, new_name).await?;
        self.persist().await;
        info!(id = id.get(), name = new_name, "file renamed");
        Ok(record)
    }

    /// Deletes `id`. Once metadata is gone the file no longer exists; a
    /// failure to remove the blob afterwards is handed to the garbage
    /// collector instead of being reported.
    ///
    /// The work runs on its own task and finishes even if the caller stops
    /// waiting for it.
    pub async fn delete(&self, id: &FileId) -> Result<FileRecord, FileError> {
        let manager = self.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.delete_file(&id).await })
            .await
            .map_err(FileError::Interrupted)?
    }

    async fn delete_file(&self, id: &FileId) -> Result<FileRecord, FileError> {
        let record = self.metadata.remove(id).await?;
        self.persist().await;

        match self.blob_storage.remove(record.storage_key()).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!(
                    id = id.get(),
                    key = record.storage_key().get(),
                    "deleted file had no stored contents"
                );
            }
            Err(err) => {
                error!(
                    id = id.get(),
                    key = record.storage_key().get(),
                    "failed to remove contents of deleted file: {}",
                    err
                );
                self.leak(record.storage_key());
            }
        }
        info!(id = id.get(), name = record.original_name, "file deleted");
        Ok(record)
    }

    fn leak(&self, key: &StorageKey) {
        if self.gc_tx.send(key.clone()).is_err() {
            warn!(key = key.get(), "garbage collector is not running, blob leaked");
        }
    }

    // Failing to write the index does not fail the request; the next
    // mutation writes a newer snapshot.
    async fn persist(&self) {
        let Some(index_file) = &self.index_file else {
            return;
        };
        let snapshot = self.metadata.snapshot().await;
        if let Err(err) = index_file.write(&snapshot).await {
            error!(
                path = %index_file.path().display(),
                generation = snapshot.generation,
                "failed to write metadata index: {:?}",
                err
            );
        }
    }
}

// An upload that holds an id reservation. Dropping it without `commit`, as
// happens when the request future is cancelled, releases the id and removes
// any written contents on a background task.
struct PendingUpload {
    manager: Option<FileManager>,
    id: FileId,
    key: StorageKey,
}

impl PendingUpload {
    fn new(manager: FileManager, id: FileId, key: StorageKey) -> Self {
        Self {
            manager: Some(manager),
            id,
            key,
        }
    }

    fn commit(mut self) {
        self.manager = None;
    }

    async fn abandon(mut self) {
        if let Some(manager) = &self.manager {
            manager.abandon_upload(&self.id, &self.key).await;
        }
        self.manager = None;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        warn!(id = self.id.get(), "upload cancelled, cleaning up");
        let id = self.id.clone();
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { manager.abandon_upload(&id, &key).await });
            }
            Err(_) => manager.leak(&key),
        }
    }
}

fn validate_name(name: &str) -> Result<(), FileError> {
    if name.trim().is_empty() {
        return Err(FileError::InvalidName(name.to_string()));
    }
    Ok(())
}
