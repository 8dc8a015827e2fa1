use std::time::Duration;

use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "filevault"))
        .with_attribute(KeyValue::new("service.name", "filevault-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub mod api_io_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub uploads: Counter<u64>,
        pub upload_bytes: Counter<u64>,
        pub downloads: Counter<u64>,
        pub renames: Counter<u64>,
        pub deletes: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("service-api");
            let uploads = meter
                .u64_counter("filevault.uploads")
                .with_description("number of files uploaded")
                .build();
            let upload_bytes = meter
                .u64_counter("filevault.upload_bytes")
                .with_description("number of bytes stored by uploads")
                .build();
            let downloads = meter
                .u64_counter("filevault.downloads")
                .with_description("number of downloads served")
                .build();
            let renames = meter
                .u64_counter("filevault.renames")
                .with_description("number of files renamed")
                .build();
            let deletes = meter
                .u64_counter("filevault.deletes")
                .with_description("number of files deleted")
                .build();
            Metrics {
                uploads,
                upload_bytes,
                downloads,
                renames,
                deletes,
            }
        }
    }
}
