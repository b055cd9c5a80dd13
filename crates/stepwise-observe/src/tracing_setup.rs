//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! // Human-readable logs only
//! stepwise_observe::tracing_setup::init_tracing(false).unwrap();
//!
//! // JSON logs plus OpenTelemetry spans on stdout
//! use stepwise_observe::tracing_setup::{init_tracing_with, LogFormat, TracingOptions};
//! init_tracing_with(TracingOptions {
//!     format: LogFormat::Json,
//!     enable_otel: true,
//!     ..TracingOptions::default()
//! })
//! .unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Directive used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVE: &str = "info,stepwise_core=info";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line, including the current span.
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingOptions {
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub enable_otel: bool,
    /// Filter applied when `RUST_LOG` is not set.
    pub default_directive: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            enable_otel: false,
            default_directive: DEFAULT_DIRECTIVE.to_string(),
        }
    }
}

/// Initialize the global tracing subscriber with pretty output.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with(TracingOptions {
        enable_otel,
        ..TracingOptions::default()
    })
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer (pretty or JSON) with span close timing.
/// - When `enable_otel` is true, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
/// - Respects `RUST_LOG`, falling back to `default_directive`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_directive));

    let (pretty_layer, json_layer) = match options.format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
        ),
    };

    let otel_layer = if options.enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepwise");

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// Install a test-friendly subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Safe to call even when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
