//! In-memory mapping from file id to [`FileRecord`].
//!
//! This is the authoritative existence check for stored files. All state
//! lives behind one lock; critical sections never await or touch the blob
//! store.

use std::collections::{HashMap, HashSet};

use data_model::{FileId, FileRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

pub mod index_file;

pub use index_file::IndexFile;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("file not found: {id}")]
    NotFound { id: FileId },

    #[error("file id already in use: {id}")]
    Conflict { id: FileId },
}

/// Point-in-time copy of the persisted part of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub generation: u64,
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub retired: Vec<FileId>,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    record: FileRecord,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<FileId, Entry>,
    // ids claimed by uploads whose blob is still being written
    reserved: HashSet<FileId>,
    // ids of deleted files, never handed out again
    retired: HashSet<FileId>,
    next_seq: u64,
    generation: u64,
}

impl State {
    fn is_taken(&self, id: &FileId) -> bool {
        self.files.contains_key(id) || self.retired.contains(id)
    }

    fn push(&mut self, record: FileRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.files.insert(record.id.clone(), Entry { seq, record });
    }
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    state: RwLock<State>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from a snapshot, keeping the snapshot's record order.
    pub fn from_snapshot(snapshot: MetadataSnapshot) -> Self {
        let mut state = State {
            generation: snapshot.generation,
            retired: snapshot.retired.into_iter().collect(),
            ..Default::default()
        };
        for record in snapshot.files {
            state.push(record);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Claims `id` for an upload in flight.
    ///
    /// Fails if the id belongs to a live file, another in-flight upload or a
    /// deleted file. Reserved ids are not visible to [`get`](Self::get) or
    /// [`list_all`](Self::list_all).
    pub async fn reserve(&self, id: &FileId) -> Result<(), MetadataError> {
        let mut state = self.state.write().await;
        if state.is_taken(id) || !state.reserved.insert(id.clone()) {
            return Err(MetadataError::Conflict { id: id.clone() });
        }
        Ok(())
    }

    /// Drops a reservation made by [`reserve`](Self::reserve).
    pub async fn release(&self, id: &FileId) {
        self.state.write().await.reserved.remove(id);
    }

    pub async fn insert(&self, record: FileRecord) -> Result<(), MetadataError> {
        let mut state = self.state.write().await;
        if state.is_taken(&record.id) {
            return Err(MetadataError::Conflict { id: record.id });
        }
        state.reserved.remove(&record.id);
        debug!(id = record.id.get(), "inserting file record");
        state.push(record);
        state.generation += 1;
        Ok(())
    }

    pub async fn get(&self, id: &FileId) -> Option<FileRecord> {
        self.state
            .read()
            .await
            .files
            .get(id)
            .map(|entry| entry.record.clone())
    }

    pub async fn contains(&self, id: &FileId) -> bool {
        self.state.read().await.files.contains_key(id)
    }

    /// True when `id` belongs to a live file or an upload in flight.
    pub async fn is_claimed(&self, id: &FileId) -> bool {
        let state = self.state.read().await;
        state.files.contains_key(id) || state.reserved.contains(id)
    }

    /// All live records in insertion order.
    pub async fn list_all(&self) -> Vec<FileRecord> {
        let state = self.state.read().await;
        let mut entries: Vec<&Entry> = state.files.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.record.clone()).collect()
    }

    pub async fn rename(
        &self,
        id: &FileId,
        new_name: &str,
    ) -> Result<FileRecord, MetadataError> {
        let mut state = self.state.write().await;
        let entry = state
            .files
            .get_mut(id)
            .ok_or_else(|| MetadataError::NotFound { id: id.clone() })?;
        entry.record.original_name = new_name.to_string();
        let record = entry.record.clone();
        state.generation += 1;
        Ok(record)
    }

    /// Removes the record and retires its id.
    pub async fn remove(&self, id: &FileId) -> Result<FileRecord, MetadataError> {
        let mut state = self.state.write().await;
        let entry = state
            .files
            .remove(id)
            .ok_or_else(|| MetadataError::NotFound { id: id.clone() })?;
        state.retired.insert(id.clone());
        state.generation += 1;
        Ok(entry.record)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.files.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> MetadataSnapshot {
        let state = self.state.read().await;
        let mut entries: Vec<&Entry> = state.files.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        let mut retired: Vec<FileId> = state.retired.iter().cloned().collect();
        retired.sort();
        MetadataSnapshot {
            generation: state.generation,
            files: entries.into_iter().map(|e| e.record.clone()).collect(),
            retired,
        }
    }
}
