mod config;
mod influx;
mod ingest;
mod mqtt;
mod pipeline;
mod telemetry;

use crate::config::Config;
use crate::influx::InfluxWriter;
use crate::ingest::SampleMerger;
use crate::pipeline::{spawn_worker, BridgeStats, PipelineHandle, WriteCommand};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,aquarium_bridge=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "aquarium-bridge"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let writer = InfluxWriter::new(config.influx_settings())?;
    tracing::info!(
        url=%writer.write_url(),
        measurement=%config.influx_measurement,
        "writing combined samples to InfluxDB"
    );

    let stats = Arc::new(BridgeStats::new());
    let (tx, rx) = mpsc::channel::<WriteCommand>(config.max_queue);
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let worker_handle = spawn_worker(writer, rx, stats.clone(), config.write_retry());

    let merger = SampleMerger::new(
        config.mqtt_namespace.clone(),
        config.influx_measurement.clone(),
        pipeline,
    );

    let mut mqtt_handle = {
        let config_clone = config.clone();
        let merger_clone = merger.clone();
        tokio::spawn(async move { mqtt::run_listener(config_clone, merger_clone).await })
    };

    let status_handle = {
        let stats = stats.clone();
        let interval = config.status_log_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_summary();
            }
        })
    };

    let outcome: Result<()> = tokio::select! {
        res = &mut mqtt_handle => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::error!(error=%err, "MQTT listener exited");
                Err(err)
            }
            Err(err) => {
                tracing::error!(error=%err, "MQTT task failed");
                Err(err.into())
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    mqtt_handle.abort();
    status_handle.abort();

    let pending = merger.pending().await;
    if !pending.is_empty() {
        tracing::warn!(filled = pending.filled(), "discarding partial sample on shutdown");
    }
    merger.reset().await;

    match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, merger.flush()).await {
        Ok(Ok(())) => tracing::info!("write queue drained"),
        Ok(Err(err)) => tracing::warn!(error=%err, "could not drain write queue"),
        Err(_) => tracing::warn!("timed out draining write queue"),
    }
    drop(merger);
    worker_handle.abort();
    stats.log_summary();

    outcome
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
