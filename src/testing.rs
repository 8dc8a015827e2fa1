use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use blob_store::BlobStorageConfig;
use bytes::Bytes;
use data_model::{FileRecord, IdGenerator, Sha256IdGenerator};
use futures::stream;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

pub const TEST_API_KEY: &str = "test-api-key";

pub struct TestService {
    pub service: Service,
    // keeping a reference to the temp dir to ensure it is not deleted
    pub temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::build(|_| {}, Arc::new(Sha256IdGenerator::new())).await
    }

    pub async fn with_config(update: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        Self::build(update, Arc::new(Sha256IdGenerator::new())).await
    }

    pub async fn with_id_generator(id_generator: Arc<dyn IdGenerator>) -> Result<Self> {
        Self::build(|_| {}, id_generator).await
    }

    async fn build(
        update: impl FnOnce(&mut ServerConfig),
        id_generator: Arc<dyn IdGenerator>,
    ) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let mut cfg = ServerConfig {
            api_key: Some(TEST_API_KEY.to_string()),
            blob_storage: BlobStorageConfig {
                path: format!(
                    "file://{}",
                    temp_dir.path().join("blob_store").to_str().unwrap()
                ),
            },
            ..Default::default()
        };
        update(&mut cfg);
        cfg.validate()?;
        let service = Service::with_id_generator(cfg, id_generator).await?;

        Ok(Self { service, temp_dir })
    }

    pub fn routes(&self) -> Router {
        self.service.routes().unwrap()
    }

    pub async fn upload(&self, filename: &str, contents: &'static [u8]) -> Result<FileRecord> {
        let data = stream::iter(vec![Ok(Bytes::from_static(contents))]);
        Ok(self.service.file_manager.upload(filename, data).await?)
    }

    pub async fn read(&self, record: &FileRecord) -> Result<Bytes> {
        let (_, stream) = self.service.file_manager.download(&record.id).await?;
        let chunks: Vec<Bytes> = futures::TryStreamExt::try_collect(stream).await?;
        Ok(chunks.concat().into())
    }
}
