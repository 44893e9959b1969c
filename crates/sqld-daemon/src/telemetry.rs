use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SAMPLING_ENV: &str = "SQLD_OTEL_SAMPLING_RATE";
const FORMAT_ENV: &str = "SQLD_LOG_FORMAT";

/// Flushes the OTLP exporter on drop when one was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(raw: Option<&str>) -> (Self, Option<String>) {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("text") => (LogFormat::Text, None),
            Some("json") => (LogFormat::Json, None),
            Some(other) => (
                LogFormat::Text,
                Some(format!("{FORMAT_ENV}='{other}' is not text or json; using text")),
            ),
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (format, format_warning) = LogFormat::parse(env::var(FORMAT_ENV).ok().as_deref());
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_ENV).ok().as_deref());

    let (tracer, otel_error) = match build_tracer(service_name, sampling_rate) {
        Ok(tracer) => (tracer, None),
        Err(error) => (None, Some(error)),
    };
    let guard = TelemetryGuard {
        tracer_installed: tracer.is_some(),
    };

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .init();

    for message in [format_warning, sampling_warning].into_iter().flatten() {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTLP exporter; logging to stdout only");
    }
    info!(sampling_rate, ?format, "telemetry configured");

    Ok(guard)
}

fn build_tracer(service_name: &str, sampling_rate: f64) -> Result<Option<trace::Tracer>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracer))
}

/// Trace export ratio. Unset means export is off.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (0.0, None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (0.0, None);
    }
    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_ENV}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            0.0,
            Some(format!(
                "{SAMPLING_ENV}='{trimmed}' is not a valid float; trace export disabled"
            )),
        ),
    }
}
