use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use blob_store::BlobStorage;
use data_model::{IdGenerator, Sha256IdGenerator};
use metadata_store::{IndexFile, MetadataStore};
use tokio::{
    self,
    signal,
    sync::{mpsc, watch, Mutex},
};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    file_manager::FileManager,
    gc::Gc,
    metrics::{self, api_io_stats},
    middleware::InstanceRequestSpan,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub metadata: Arc<MetadataStore>,
    pub file_manager: Arc<FileManager>,
    pub gc_executor: Arc<Mutex<Gc>>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        Self::with_id_generator(config, Arc::new(Sha256IdGenerator::new())).await
    }

    pub async fn with_id_generator(
        config: ServerConfig,
        id_generator: Arc<dyn IdGenerator>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );

        let index_file = config
            .metadata
            .index_path
            .as_ref()
            .map(|path| Arc::new(IndexFile::new(PathBuf::from(path))));
        let metadata = match &index_file {
            Some(index_file) => {
                let snapshot = index_file
                    .load()
                    .await
                    .context("error loading metadata index")?;
                Arc::new(
                    snapshot
                        .map(MetadataStore::from_snapshot)
                        .unwrap_or_default(),
                )
            }
            None => Arc::new(MetadataStore::new()),
        };

        let (gc_tx, gc_rx) = mpsc::unbounded_channel();
        let file_manager = Arc::new(FileManager::new(
            blob_storage.clone(),
            metadata.clone(),
            index_file,
            id_generator,
            gc_tx,
        ));
        let gc_executor = Arc::new(Mutex::new(Gc::new(
            blob_storage.clone(),
            metadata.clone(),
            gc_rx,
            config.gc.retry_interval,
            shutdown_rx.clone(),
        )));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            metadata,
            file_manager,
            gc_executor,
        })
    }

    pub fn route_state(&self) -> Result<RouteState> {
        let api_key = self
            .config
            .api_key
            .clone()
            .context("api_key is not configured")?;
        Ok(RouteState {
            file_manager: self.file_manager.clone(),
            api_key: Arc::new(api_key),
            upload: Arc::new(self.config.upload.clone()),
            metrics: Arc::new(api_io_stats::Metrics::new()),
        })
    }

    pub fn routes(&self) -> Result<Router> {
        let request_span =
            InstanceRequestSpan::new(&self.config.env, &self.config.instance_id());
        Ok(create_routes(
            self.route_state()?,
            &self.config.cors,
            request_span,
        ))
    }

    pub async fn start(&mut self) -> Result<()> {
        let meter_provider = metrics::init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval,
            &self.config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        )?;

        if self.config.gc.sweep_on_startup {
            let gc_executor = self.gc_executor.lock().await;
            gc_executor
                .sweep()
                .await
                .context("error sweeping orphaned blobs")?;
        }

        let gc_executor = self.gc_executor.clone();
        tokio::spawn(async move {
            let mut gc_executor_guard = gc_executor.lock().await;
            gc_executor_guard.start().await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        let files = self.metadata.len().await;
        info!(files, "server api listening on {}", self.config.listen_addr);
        let routes = self.routes()?;
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        if let Some(meter_provider) = meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                error!("error shutting down meter provider: {:?}", err);
            }
        }
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    if shutdown_tx.send(()).is_err() {
        error!("no receivers for shutdown signal");
    }
    info!("signal received, shutting down server gracefully");
}
