//! Telemetry setup
//!
//! TigerStyle: One global subscriber, installed once, filtered by default.
//!
//! The runtime logs per-message flow at `trace`/`debug` and lifecycle
//! transitions at `info`, with spans around activation, save and shutdown.
//! `init_telemetry` installs a `tracing-subscriber` registry with an env
//! filter and an optional fmt layer. With the `otel` feature it also
//! exports spans over OTLP and installs a Prometheus meter provider for the
//! counters in [`crate::metrics`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Env var holding a filter directive; falls back to `RUST_LOG`
pub const LOG_FILTER_ENV: &str = "TIDEPOOL_LOG";

/// Filter used when neither env var is set
const LOG_FILTER_DEFAULT: &str = "info";

/// Directive that turns on per-message tracing for the runtime crate
const MESSAGE_TRACING_DIRECTIVE: &str = "tidepool_runtime=trace";

/// Telemetry configuration
///
/// Loaded as the `telemetry` section of
/// [`RuntimeConfig`](crate::config::RuntimeConfig); every field has a
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Name reported as `service.name` in spans and metrics
    pub service_name: String,
    /// Filter directive (`EnvFilter` syntax) when no env var overrides it
    pub log_filter: String,
    /// Log every message offered, invoked and completed
    pub message_tracing: bool,
    /// Write formatted events to stdout
    pub stdout: bool,
    /// Emit an event when lifecycle spans close, with their duration
    pub lifecycle_spans: bool,
    /// OTLP collector endpoint (e.g. "http://localhost:4317"), `otel` only
    pub otlp_endpoint: Option<String>,
    /// Install the Prometheus meter provider, `otel` only
    pub metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tidepool".to_string(),
            log_filter: LOG_FILTER_DEFAULT.to_string(),
            message_tracing: false,
            stdout: true,
            lifecycle_spans: false,
            otlp_endpoint: None,
            metrics: false,
        }
    }
}

impl TelemetryConfig {
    /// Configuration for a named application
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn with_message_tracing(mut self) -> Self {
        self.message_tracing = true;
        self
    }

    pub fn with_lifecycle_spans(mut self) -> Self {
        self.lifecycle_spans = true;
        self
    }

    pub fn without_stdout(mut self) -> Self {
        self.stdout = false;
        self
    }

    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    /// Filter directive in effect
    ///
    /// `TIDEPOOL_LOG` wins over `RUST_LOG`, which wins over `log_filter`.
    /// Message tracing is appended last so it survives any of them.
    pub fn filter_directive(&self) -> String {
        let base = std::env::var(LOG_FILTER_ENV)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| self.log_filter.clone());
        if self.message_tracing {
            format!("{},{}", base, MESSAGE_TRACING_DIRECTIVE)
        } else {
            base
        }
    }
}

/// Keeps exporters alive; flushes spans when dropped
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    otlp: bool,
    #[cfg(feature = "otel")]
    registry: Option<prometheus::Registry>,
}

impl TelemetryGuard {
    /// Registry to serve from a Prometheus scrape endpoint
    #[cfg(feature = "otel")]
    pub fn metrics_registry(&self) -> Option<&prometheus::Registry> {
        self.registry.as_ref()
    }
}

#[cfg(feature = "otel")]
impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

fn env_filter(config: &TelemetryConfig) -> Result<tracing_subscriber::EnvFilter> {
    let directive = config.filter_directive();
    tracing_subscriber::EnvFilter::try_new(&directive).map_err(|e| {
        Error::InvalidConfiguration {
            field: "telemetry.log_filter".to_string(),
            reason: format!("{:?}: {}", directive, e),
        }
    })
}

fn fmt_layer<S>(config: &TelemetryConfig) -> Option<tracing_subscriber::fmt::Layer<S>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    use tracing_subscriber::fmt::format::FmtSpan;

    if !config.stdout {
        return None;
    }
    let spans = if config.lifecycle_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    Some(tracing_subscriber::fmt::layer().with_span_events(spans))
}

fn already_installed(e: impl std::fmt::Display) -> Error {
    Error::illegal_state(format!("tracing subscriber already installed: {}", e))
}

/// Install the global subscriber
///
/// Fails with `IllegalState` when a subscriber is already installed, and
/// with `InvalidConfiguration` for a filter that does not parse.
///
/// ```rust,ignore
/// use tidepool_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _guard = init_telemetry(TelemetryConfig::new("orders").with_message_tracing())?;
/// ```
#[cfg(not(feature = "otel"))]
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(env_filter(&config)?)
        .with(fmt_layer(&config))
        .try_init()
        .map_err(already_installed)?;

    tracing::info!(
        service = %config.service_name,
        message_tracing = config.message_tracing,
        "Telemetry initialized"
    );
    Ok(TelemetryGuard {})
}

/// Install the global subscriber with OTLP span export
#[cfg(feature = "otel")]
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::prelude::*;

    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = otlp_tracer(&config, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let otlp = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter(&config)?)
        .with(fmt_layer(&config))
        .with(otel_layer)
        .try_init()
        .map_err(already_installed)?;

    let registry = if config.metrics {
        Some(install_meter_provider(&config)?)
    } else {
        None
    };

    tracing::info!(
        service = %config.service_name,
        otlp_endpoint = ?config.otlp_endpoint,
        metrics = registry.is_some(),
        "Telemetry initialized"
    );
    Ok(TelemetryGuard { otlp, registry })
}

#[cfg(feature = "otel")]
fn service_resource(config: &TelemetryConfig) -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )])
}

#[cfg(feature = "otel")]
fn otlp_tracer(
    config: &TelemetryConfig,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default().with_resource(service_resource(config)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| Error::internal(format!("OTLP exporter for {}: {}", endpoint, e)))
}

/// Route [`crate::metrics`] into a fresh Prometheus registry
#[cfg(feature = "otel")]
fn install_meter_provider(config: &TelemetryConfig) -> Result<prometheus::Registry> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| Error::internal(format!("Prometheus exporter: {}", e)))?;

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(service_resource(config))
        .with_reader(exporter)
        .build();
    opentelemetry::global::set_meter_provider(provider);
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "tidepool");
        assert_eq!(config.log_filter, "info");
        assert!(config.stdout);
        assert!(!config.message_tracing);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: TelemetryConfig =
            serde_json::from_str(r#"{"service_name": "orders", "message_tracing": true}"#)
                .unwrap();
        assert_eq!(config.service_name, "orders");
        assert!(config.message_tracing);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_message_tracing_appends_runtime_directive() {
        let config = TelemetryConfig::new("orders")
            .with_log_filter("warn")
            .with_message_tracing();
        assert!(config
            .filter_directive()
            .ends_with(",tidepool_runtime=trace"));
    }

    #[test]
    fn test_bad_filter_is_a_config_error() {
        // Only meaningful when no env override is present
        if std::env::var(LOG_FILTER_ENV).is_ok() || std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = TelemetryConfig::default().with_log_filter("tidepool_runtime=loud");
        assert!(matches!(
            env_filter(&config),
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_second_init_reports_error() {
        let config = TelemetryConfig::new("tests").without_stdout();
        let _first = init_telemetry(config.clone());
        assert!(matches!(
            init_telemetry(config),
            Err(Error::IllegalState { .. })
        ));
    }
}
