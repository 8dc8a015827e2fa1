use std::{env, fmt::Debug, net::SocketAddr, path::Path, time::Duration};

use anyhow::Result;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const API_KEY_ENV: &str = "API_KEY";
const ENV_PREFIX: &str = "FILEVAULT_";

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde_inline_default("0.0.0.0:8080".to_string())]
    pub listen_addr: String,
    /// Shared secret expected in `Authorization: Bearer <api_key>`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            api_key: None,
            blob_storage: Default::default(),
            metadata: Default::default(),
            upload: Default::default(),
            cors: Default::default(),
            gc: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Loads the config from an optional YAML file, then applies
    /// `FILEVAULT_*` environment overrides (nested keys separated by `__`).
    /// `API_KEY` is used when no key is configured otherwise.
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(
            ServerConfig::default(),
        ));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file_exact(path));
        }
        let mut config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        if config.api_key.is_none() {
            config.api_key = env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        match &self.api_key {
            Some(key) if !key.is_empty() => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "api_key must be set in the config file or the {} environment variable",
                    API_KEY_ENV
                ))
            }
        }
        if self.upload.max_size_bytes == 0 {
            return Err(anyhow::anyhow!("upload.max_size_bytes must be positive"));
        }
        // Without an index every stored blob looks orphaned after a restart.
        if self.gc.sweep_on_startup && self.metadata.index_path.is_none() {
            return Err(anyhow::anyhow!(
                "gc.sweep_on_startup requires metadata.index_path to be set"
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataConfig {
    // Keep a JSON copy of the metadata here and restore it on startup.
    // Metadata lives only in memory when unset.
    #[serde(default)]
    pub index_path: Option<String>,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde_inline_default(100 * 1024 * 1024)]
    pub max_size_bytes: usize,
    // MIME type prefixes accepted on upload, e.g. `image/` or
    // `application/pdf`. Empty accepts everything.
    #[serde(default)]
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
            allowed_content_types: Vec::new(),
        }
    }
}

impl UploadConfig {
    pub fn is_allowed(&self, content_type: &str) -> bool {
        self.allowed_content_types.is_empty()
            || self
                .allowed_content_types
                .iter()
                .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    // "*" allows any origin.
    #[serde_inline_default(vec!["*".to_string()])]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(rename = "retry_interval_secs", with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(30))]
    pub retry_interval: Duration,
    // Remove blobs without metadata before serving requests.
    #[serde(default)]
    pub sweep_on_startup: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(30),
            sweep_on_startup: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Stdout,
    Otlp,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317.
    #[serde(default)]
    pub endpoint: Option<String>,
    // No traces are exported when unset.
    #[serde(default)]
    pub tracing_exporter: Option<TracingExporter>,
    #[serde(rename = "metrics_interval_secs", with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(10))]
    pub metrics_interval: Duration,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
