use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use echowatch::EchoWatchEngine;
use echowatch::settings::Settings;
use echowatch::telemetry::{self, MetricRegistry};
use log::info;

#[derive(Debug, Parser)]
#[clap(about = "Continuous TCP/UDP echo probe and network interface counter exporter")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Configuration file (YAML); optional
    #[clap(short, long, env = "ECHOWATCH_CONFIG")]
    config: Option<String>,

    /// Hosts to probe, appended to the configured targets
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;
    let targets = settings.all_targets(&opt.targets);
    info!("Probing {} targets: {:?}", targets.len(), targets);

    let registry = Arc::new(MetricRegistry::new());
    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref(), registry.clone())?;

    let engine = EchoWatchEngine::new(settings, targets, registry);
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
