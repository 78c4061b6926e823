use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> opentelemetry::sdk::trace::Tracer {
    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .expect("need an otel tracing collector configured");

    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)
        .expect("invalid OPENTELEMETRY_ENDPOINT_URL")
        .connect()
        .await
        .expect("connecting to the otel collector");

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_channel(channel),
        )
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "orc-operator",
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)
        .expect("installing the otlp tracing pipeline")
}

/// Initialize tracing
///
/// Log verbosity follows `RUST_LOG` (default `info`). Setting `LOG_FORMAT=json`
/// switches the fmt layer to structured JSON lines.
pub async fn init() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let (json_layer, compact_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().compact()))
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default log filter is valid");

    // Setup tracing layers
    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await);

    // Decide on layers
    #[cfg(feature = "telemetry")]
    let collector = Registry::default()
        .with(telemetry)
        .with(json_layer)
        .with(compact_layer)
        .with(filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default()
        .with(json_layer)
        .with(compact_layer)
        .with(filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector).expect("tracing subscriber is only set once");
}
