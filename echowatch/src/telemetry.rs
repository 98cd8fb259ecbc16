//! Metric sink and export.
//!
//! Every counter the probe publishes lives in a [`MetricRegistry`]. The
//! registry is rendered as Prometheus text on `/metrics` and, when an OTLP
//! endpoint is configured, pushed to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint Priority
//! 1. `otel_exporter_otlp_endpoint` setting (`ECHOWATCH__OTEL_EXPORTER_OTLP_ENDPOINT`)
//! 2. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 3. Neither set: OTLP export disabled

use anyhow::{Context, Result, bail};
use log::{info, warn};
use once_cell::sync::Lazy;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

static INVALID_METRIC_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_]").unwrap());

/// Live binding to one named counter in a [`MetricSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterHandle {
    id: u64,
    name: Arc<str>,
}

impl CounterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named monotonic counters that can be created, incremented and removed.
///
/// Creating a name that is already live, or removing a handle twice, is a
/// caller bug and reported as an error.
pub trait MetricSink: Send + Sync {
    fn create(&self, name: &str) -> Result<CounterHandle>;
    fn increment(&self, handle: &CounterHandle, amount: u64);
    fn remove(&self, handle: CounterHandle) -> Result<()>;
}

struct CounterEntry {
    name: Arc<str>,
    value: u64,
}

#[derive(Default)]
struct RegistryInner {
    counters: HashMap<u64, CounterEntry>,
    by_name: HashMap<Arc<str>, u64>,
}

/// In-process [`MetricSink`] shared by the collector, the echo sessions and
/// every exporter.
#[derive(Default)]
pub struct MetricRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live counter by name.
    pub fn value(&self, name: &str) -> Option<u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let id = inner.by_name.get(name)?;
        inner.counters.get(id).map(|entry| entry.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name-sorted copy of every live counter.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .counters
            .values()
            .map(|entry| (entry.name.to_string(), entry.value))
            .collect()
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.snapshot() {
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}

impl MetricSink for MetricRegistry {
    fn create(&self, name: &str) -> Result<CounterHandle> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.by_name.contains_key(name) {
            bail!("metric {} is already registered", name);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(name);
        inner.by_name.insert(name.clone(), id);
        inner.counters.insert(
            id,
            CounterEntry {
                name: name.clone(),
                value: 0,
            },
        );

        Ok(CounterHandle { id, name })
    }

    fn increment(&self, handle: &CounterHandle, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // removed handles are ignored
        if let Some(entry) = inner.counters.get_mut(&handle.id) {
            entry.value = entry.value.saturating_add(amount);
        }
    }

    fn remove(&self, handle: CounterHandle) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.counters.remove(&handle.id).is_none() {
            bail!("metric {} is not registered", handle.name);
        }
        inner.by_name.remove(&handle.name);
        Ok(())
    }
}

/// Turns an arbitrary label (interface name, host:port) into a valid metric name.
pub fn sanitize_metric_name(raw: &str) -> String {
    let name = INVALID_METRIC_CHARS.replace_all(raw, "_");
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", name)
    } else {
        name.into_owned()
    }
}

fn get_otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = match configured {
        Some(ep) if !ep.is_empty() => ep.to_string(),
        _ => std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?,
    };
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC and registers one
/// observable counter that reports every live registry counter, labelled
/// with its name. Skips initialization if no endpoint is configured.
pub fn init_metrics(configured_endpoint: Option<&str>, registry: Arc<MetricRegistry>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTLP endpoint not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "echowatch"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("echowatch");

    // one series per live registry counter, read at collection time
    let _registry_counter = meter
        .u64_observable_counter("echowatch_counter")
        .with_description("Probe counters, one series per registered metric")
        .with_callback(move |observer| {
            for (name, value) in registry.snapshot() {
                observer.observe(value, &[KeyValue::new("metric", name)]);
            }
        })
        .build();

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
