//! Optional on-disk copy of the metadata store.
//!
//! The index is a JSON document holding a [`MetadataSnapshot`]. It is
//! replaced atomically: the snapshot is written to a temporary sibling and
//! renamed over the previous index.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::MetadataSnapshot;

pub struct IndexFile {
    path: PathBuf,
    // generation of the newest snapshot on disk; also serializes writers
    last_written: Mutex<u64>,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Reads the index, returning `None` if it does not exist yet.
    pub async fn load(&self) -> Result<Option<MetadataSnapshot>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no metadata index found, starting empty");
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading metadata index {}", self.path.display()))
            }
        };
        let snapshot: MetadataSnapshot = serde_json::from_slice(&contents)
            .with_context(|| format!("decoding metadata index {}", self.path.display()))?;
        *self.last_written.lock().await = snapshot.generation;
        info!(
            path = %self.path.display(),
            files = snapshot.files.len(),
            generation = snapshot.generation,
            "loaded metadata index"
        );
        Ok(Some(snapshot))
    }

    /// Writes `snapshot` unless a snapshot at least as new is already on
    /// disk. Returns whether the file was replaced.
    pub async fn write(&self, snapshot: &MetadataSnapshot) -> Result<bool> {
        let mut last_written = self.last_written.lock().await;
        if snapshot.generation <= *last_written {
            debug!(
                generation = snapshot.generation,
                last_written = *last_written,
                "skipping stale metadata snapshot"
            );
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec(snapshot)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        *last_written = snapshot.generation;
        Ok(true)
    }
}
