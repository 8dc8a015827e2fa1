//! Blob storage for uploaded file contents.
//!
//! Blobs are addressed by [`StorageKey`] relative to a configured root URL
//! (`file:///var/lib/filevault/blobs`, `memory:///`, ...). The store knows
//! nothing about file metadata; callers decide which keys exist.
//!
//! Writes are staged and published in one step. On the local filesystem
//! object_store writes into a temporary sibling file and renames it into
//! place on completion, so readers never observe a partially written blob.

use std::{env, sync::Arc};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use data_model::StorageKey;
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use object_store::{parse_url, path::Path, ObjectStore, WriteMultipart};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

mod error;
mod metrics;

pub use error::{BlobError, BlobResult};
pub use metrics::{BlobMetrics, Timer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Root URL for blobs, e.g. `file:///path` or `memory:///`.
    #[serde(default = "default_blob_store_path")]
    pub path: String,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            path: default_blob_store_path(),
        }
    }
}

pub fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join("filevault_storage/blobs")
            .to_str()
            .unwrap_or("./filevault_storage/blobs")
    )
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: StorageKey,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    metrics: BlobMetrics,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> BlobResult<Self> {
        let invalid_path = |reason: String| BlobError::InvalidPath {
            path: config.path.clone(),
            reason,
        };
        let url = config
            .path
            .parse::<Url>()
            .map_err(|e| invalid_path(e.to_string()))?;
        if url.scheme() == "file" {
            let dir = url
                .to_file_path()
                .map_err(|_| invalid_path("not an absolute file path".to_string()))?;
            std::fs::create_dir_all(&dir).map_err(|e| invalid_path(e.to_string()))?;
        }
        let (object_store, path) = parse_url(&url).map_err(|e| invalid_path(e.to_string()))?;
        info!("using blob store path: {}", config.path);

        let meter = opentelemetry::global::meter("filevault-server");
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
            metrics: BlobMetrics::new(&meter),
        })
    }

    fn object_path(&self, key: &StorageKey) -> BlobResult<Path> {
        let raw = key.get();
        let invalid = |reason: &str| BlobError::InvalidKey {
            key: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("empty key"));
        }
        if raw.contains('/') || raw.contains('\\') {
            return Err(invalid("path separators are not allowed"));
        }
        if raw.contains("..") {
            return Err(invalid("parent references are not allowed"));
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(invalid("control characters are not allowed"));
        }
        Ok(self.path.child(raw))
    }

    /// Streams `data` into a new blob at `key`.
    ///
    /// The blob becomes visible only once the whole stream has been written.
    /// If the stream yields an error or the backend fails, the staged upload
    /// is aborted and nothing is left at `key`.
    pub async fn put(
        &self,
        key: &StorageKey,
        data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> BlobResult<PutResult> {
        let _timer = self.metrics.timer("put");
        let path = self.object_path(key)?;

        let upload = self.object_store.put_multipart(&path).await.map_err(|e| {
            self.metrics.record_error("put");
            BlobError::write(key.get(), e)
        })?;
        let mut writer = WriteMultipart::new(upload);

        let (size_bytes, sha256_hash) = match write_chunks(&mut writer, data).await {
            Ok(written) => written,
            Err(err) => {
                self.metrics.record_error("put");
                if let Err(abort_err) = writer.abort().await {
                    warn!(key = key.get(), "failed to abort staged upload: {:?}", abort_err);
                }
                return Err(BlobError::write(key.get(), err));
            }
        };

        writer.finish().await.map_err(|e| {
            self.metrics.record_error("put");
            BlobError::write(key.get(), e)
        })?;
        debug!(key = key.get(), size_bytes, "blob written");

        Ok(PutResult {
            key: key.clone(),
            size_bytes,
            sha256_hash,
        })
    }

    /// Opens the blob at `key` for streaming.
    pub async fn get(&self, key: &StorageKey) -> BlobResult<BoxStream<'static, Result<Bytes>>> {
        let _timer = self.metrics.timer("get");
        let path = self.object_path(key)?;
        let get_result = self.object_store.get(&path).await.map_err(|e| {
            let err = BlobError::read(key.get(), e);
            if !err.is_not_found() {
                self.metrics.record_error("get");
            }
            err
        })?;

        let key = key.get().to_string();
        Ok(get_result
            .into_stream()
            .map_err(move |e| anyhow::anyhow!("error reading blob {:?}: {:?}", key, e))
            .boxed())
    }

    pub async fn read_bytes(&self, key: &StorageKey) -> BlobResult<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            let chunk = chunk.map_err(|e| BlobError::Read {
                key: key.get().to_string(),
                source: e,
            })?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes.into())
    }

    /// Removes the blob at `key`, failing with `NotFound` when there is none.
    pub async fn remove(&self, key: &StorageKey) -> BlobResult<()> {
        let _timer = self.metrics.timer("remove");
        let path = self.object_path(key)?;
        self.object_store
            .head(&path)
            .await
            .map_err(|e| BlobError::read(key.get(), e))?;
        self.object_store.delete(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => BlobError::NotFound {
                key: key.get().to_string(),
            },
            e => {
                self.metrics.record_error("remove");
                BlobError::write(key.get(), e)
            }
        })?;
        debug!(key = key.get(), "blob removed");
        Ok(())
    }

    /// Lists every blob directly under the root whose name is a valid
    /// storage key. Other objects are ignored.
    pub async fn list_keys(&self) -> BlobResult<Vec<StorageKey>> {
        let _timer = self.metrics.timer("list");
        let prefix = self.path.clone();
        let objects: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| BlobError::Read {
                key: prefix.to_string(),
                source: anyhow::Error::from(e),
            })?;

        let keys = objects
            .into_iter()
            .filter(|meta| {
                meta.location
                    .prefix_match(&prefix)
                    .map(|parts| parts.count() == 1)
                    .unwrap_or(false)
            })
            .filter_map(|meta| meta.location.filename().and_then(StorageKey::parse))
            .collect();
        Ok(keys)
    }
}

async fn write_chunks(
    writer: &mut WriteMultipart,
    mut data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut size_bytes = 0;
    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        writer.wait_for_capacity(1).await?;
        hasher.update(&chunk);
        size_bytes += chunk.len() as u64;
        writer.write(&chunk);
    }
    Ok((size_bytes, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_file_id;
    use futures::stream;

    use super::*;

    fn disk_storage(dir: &tempfile::TempDir) -> BlobStorage {
        let path = dir.path().join("blobs");
        BlobStorage::new(BlobStorageConfig::new(path.to_str().unwrap())).unwrap()
    }

    fn key(seed: u8, name: &str) -> StorageKey {
        StorageKey::derive(&mock_file_id(seed), name)
    }

    #[tokio::test]
    async fn test_put_get_remove() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = disk_storage(&temp_dir);
        let key = key(1, "hello.txt");

        let data = vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let res = storage.put(&key, stream::iter(data)).await?;
        assert_eq!(res.size_bytes, 11);
        assert_eq!(
            res.sha256_hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        assert_eq!(storage.read_bytes(&key).await?, Bytes::from("hello world"));
        assert!(temp_dir.path().join("blobs").join(key.get()).exists());

        storage.remove(&key).await?;
        assert!(storage.get(&key).await.err().unwrap().is_not_found());
        assert!(storage.remove(&key).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = disk_storage(&temp_dir);
        let key = key(2, "broken.bin");

        let data = vec![
            Ok(Bytes::from(vec![1u8; 1024])),
            Err(anyhow::anyhow!("client went away")),
        ];
        let err = storage.put(&key, stream::iter(data)).await.unwrap_err();
        assert!(matches!(err, BlobError::Write { .. }));
        assert!(storage.get(&key).await.err().unwrap().is_not_found());
        assert!(storage.list_keys().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_blob() -> Result<()> {
        let storage = BlobStorage::new(BlobStorageConfig {
            path: "memory:///".to_string(),
        })?;
        let key = key(3, "empty");
        let res = storage.put(&key, stream::empty()).await?;
        assert_eq!(res.size_bytes, 0);
        assert!(storage.read_bytes(&key).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_unsafe_keys() -> Result<()> {
        let storage = BlobStorage::new(BlobStorageConfig {
            path: "memory:///".to_string(),
        })?;
        for raw in ["", "../escape", "a/b", "a\\b", "bad\nkey"] {
            let key: StorageKey = key_from_raw(raw);
            let err = storage.put(&key, stream::empty()).await.unwrap_err();
            assert!(matches!(err, BlobError::InvalidKey { .. }), "{raw:?}");
        }
        Ok(())
    }

    // StorageKey has no public constructor from arbitrary strings; go
    // through serde the same way a corrupt index file would.
    fn key_from_raw(raw: &str) -> StorageKey {
        serde::Deserialize::deserialize(serde::de::value::StrDeserializer::<
            serde::de::value::Error,
        >::new(raw))
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_keys_ignores_foreign_objects() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = disk_storage(&temp_dir);
        let a = key(4, "a.pdf");
        let b = key(5, "b");
        storage.put(&a, stream::iter(vec![Ok(Bytes::from("a"))])).await?;
        storage.put(&b, stream::iter(vec![Ok(Bytes::from("b"))])).await?;
        std::fs::write(temp_dir.path().join("blobs").join("notes.txt"), b"x")?;

        let mut keys = storage.list_keys().await?;
        keys.sort_by(|x, y| x.get().cmp(y.get()));
        assert_eq!(keys, vec![a, b]);
        Ok(())
    }
}
