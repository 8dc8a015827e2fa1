use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter as OtlpSpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{BatchSpanProcessor, SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use opentelemetry_stdout::SpanExporter as StdoutSpanExporter;
use tracing::Metadata;
use tracing_subscriber::{
    filter::FilterExt,
    layer::{self, Filter, SubscriberExt},
    Layer,
};

use crate::config::{ServerConfig, TracingExporter};

const SERVICE_NAME: &str = "filevault-server";

// Spans from the http stack and runtime are not worth exporting.
struct NoisyModulesFilter;

impl<S> Filter<S> for NoisyModulesFilter {
    fn enabled(&self, metadata: &Metadata<'_>, _: &layer::Context<'_, S>) -> bool {
        let target = metadata.target();
        !target.starts_with("h2::")
            && !target.starts_with("hyper")
            && !target.starts_with("tokio::")
    }
}

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true)
                .flatten_current_span_on_top_level(true),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .with_ansi(std::io::stderr().is_terminal())
            .compact(),
    )
}

type BoxedSubscriber = Box<dyn tracing::Subscriber + Send + Sync>;

/// Installs the global subscriber. Returns the tracer provider when span
/// export is configured so the caller can flush it on shutdown.
pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let (subscriber, tracer_provider) = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber)?;
    if let Some(tracer_provider) = &tracer_provider {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    }
    Ok(tracer_provider)
}

fn build_subscriber(config: &ServerConfig) -> Result<(BoxedSubscriber, Option<SdkTracerProvider>)> {
    let base = tracing_subscriber::Registry::default();

    let Some(tracing_exporter) = &config.telemetry.tracing_exporter else {
        let log_layer = get_log_layer(config).with_filter(get_env_filter());
        let subscriber: BoxedSubscriber = Box::new(base.with(log_layer));
        return Ok((subscriber, None));
    };

    let mut tracer_provider = TracerProviderBuilder::default().with_resource(
        Resource::builder_empty()
            .with_service_name(SERVICE_NAME)
            .build(),
    );
    match tracing_exporter {
        TracingExporter::Otlp => {
            let mut otlp = OtlpSpanExporter::builder().with_tonic();
            if let Some(endpoint) = &config.telemetry.endpoint {
                otlp = otlp.with_endpoint(endpoint);
            }
            let exporter = otlp.build()?;
            tracer_provider =
                tracer_provider.with_span_processor(BatchSpanProcessor::builder(exporter).build());
        }
        TracingExporter::Stdout => {
            tracer_provider = tracer_provider.with_simple_exporter(StdoutSpanExporter::default());
        }
    }
    let sdk_tracer = tracer_provider.build();

    let span_layer = tracing_opentelemetry::layer()
        .with_tracer(sdk_tracer.tracer(SERVICE_NAME))
        .with_filter(NoisyModulesFilter.and(get_env_filter()));

    let subscriber = base.with(span_layer);
    let log_layer = get_log_layer(config).with_filter(get_env_filter());
    let subscriber: BoxedSubscriber = Box::new(subscriber.with(log_layer));
    Ok((subscriber, Some(sdk_tracer)))
}
