//! # Prometheus Metrics
//!
//! Per creation-site goroutine counters and an uptime histogram, served as
//! text exposition on `/metrics`.
//!
//! Every series carries `stack_0`..`stack_4`, the innermost five frames of the
//! creation stack (`stack_0` is the innermost) as hex addresses. Shorter
//! stacks are padded with `none`.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{info, warn};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::trace_data::{StackSignature, SIGNATURE_DEPTH};

const NAMESPACE: &str = "gmon";

pub const STACK_LABELS: [&str; SIGNATURE_DEPTH] =
    ["stack_0", "stack_1", "stack_2", "stack_3", "stack_4"];

/// Upper bounds, in seconds, of the uptime histogram buckets
pub const UPTIME_BUCKETS: [f64; 8] = [1.0, 3.0, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0];

/// Default port of the metrics endpoint
pub const DEFAULT_METRICS_PORT: u16 = 5500;

/// Label values for a creation site
#[must_use]
pub fn stack_labels(signature: &StackSignature) -> [String; SIGNATURE_DEPTH] {
    std::array::from_fn(|i| {
        signature.0.get(i).map_or_else(|| "none".to_string(), |addr| format!("0x{addr:x}"))
    })
}

/// Goroutine lifecycle metrics, cheap to clone (all handles are shared)
#[derive(Clone)]
pub struct LifecycleMetrics {
    registry: Registry,
    creation: IntCounterVec,
    exit: IntCounterVec,
    uptime: HistogramVec,
}

impl LifecycleMetrics {
    /// # Errors
    /// Returns an error if a metric is rejected by the registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let creation = IntCounterVec::new(
            Opts::new("goroutine_creation", "The number of goroutines that have been created")
                .namespace(NAMESPACE),
            &STACK_LABELS,
        )?;
        let exit = IntCounterVec::new(
            Opts::new("goroutine_exit", "The number of goroutines that have exited")
                .namespace(NAMESPACE),
            &STACK_LABELS,
        )?;
        let uptime = HistogramVec::new(
            HistogramOpts::new("goroutine_uptime", "Uptime of goroutines in seconds")
                .namespace(NAMESPACE)
                .buckets(UPTIME_BUCKETS.to_vec()),
            &STACK_LABELS,
        )?;

        registry.register(Box::new(creation.clone()))?;
        registry.register(Box::new(exit.clone()))?;
        registry.register(Box::new(uptime.clone()))?;

        Ok(Self { registry, creation, exit, uptime })
    }

    pub fn record_spawn(&self, signature: &StackSignature) {
        let labels = stack_labels(signature);
        self.creation.with_label_values(&label_refs(&labels)).inc();
    }

    /// Count an exit and observe its uptime under the creation site's labels
    pub fn record_exit(&self, signature: &StackSignature, uptime: Duration) {
        let labels = stack_labels(signature);
        let values = label_refs(&labels);
        self.exit.with_label_values(&values).inc();
        self.uptime.with_label_values(&values).observe(uptime.as_secs_f64());
    }

    /// Text exposition of every registered metric
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    fn creation_count(&self, signature: &StackSignature) -> u64 {
        self.creation.with_label_values(&label_refs(&stack_labels(signature))).get()
    }

    #[cfg(test)]
    fn exit_count(&self, signature: &StackSignature) -> u64 {
        self.exit.with_label_values(&label_refs(&stack_labels(signature))).get()
    }

    #[cfg(test)]
    fn uptime_histogram(&self, signature: &StackSignature) -> prometheus::Histogram {
        self.uptime.with_label_values(&label_refs(&stack_labels(signature)))
    }
}

fn label_refs(labels: &[String; SIGNATURE_DEPTH]) -> [&str; SIGNATURE_DEPTH] {
    std::array::from_fn(|i| labels[i].as_str())
}

async fn serve_metrics(State(metrics): State<LifecycleMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => {
            ([(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())], body)
                .into_response()
        }
        Err(e) => {
            warn!("Failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Router exposing `GET /metrics`
pub fn router(metrics: LifecycleMetrics) -> Router {
    Router::new().route("/metrics", get(serve_metrics)).with_state(metrics)
}

/// Bind `addr` and serve `/metrics` on the current runtime
///
/// Returns the bound address (useful when the port is 0).
///
/// # Errors
/// Returns an error if the address cannot be bound.
pub async fn spawn_metrics_server(addr: SocketAddr, metrics: LifecycleMetrics) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;
    let local = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(metrics)).await {
            warn!("Metrics server stopped: {e}");
        }
    });
    info!("Serving metrics on http://{local}/metrics");
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_labels_pad_with_none() {
        let labels = stack_labels(&StackSignature(vec![0x4a10, 0x4b20]));
        assert_eq!(labels, ["0x4a10", "0x4b20", "none", "none", "none"]);
        assert_eq!(stack_labels(&StackSignature(Vec::new())), ["none"; 5].map(String::from));
    }

    #[test]
    fn test_spawn_and_exit_update_series() {
        let metrics = LifecycleMetrics::new().unwrap();
        let site = StackSignature(vec![0x10, 0x20, 0x30]);
        let other = StackSignature(vec![0x99]);

        metrics.record_spawn(&site);
        metrics.record_spawn(&site);
        metrics.record_exit(&site, Duration::from_secs(4));

        assert_eq!(metrics.creation_count(&site), 2);
        assert_eq!(metrics.exit_count(&site), 1);
        assert_eq!(metrics.creation_count(&other), 0);

        let uptime = metrics.uptime_histogram(&site);
        assert_eq!(uptime.get_sample_count(), 1);
        assert!((uptime.get_sample_sum() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_render_uses_namespace_and_buckets() {
        let metrics = LifecycleMetrics::new().unwrap();
        let site = StackSignature(vec![0xabc]);
        metrics.record_spawn(&site);
        metrics.record_exit(&site, Duration::from_millis(2500));

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"gmon_goroutine_creation{stack_0="0xabc",stack_1="none",stack_2="none",stack_3="none",stack_4="none"} 1"#
        ));
        assert!(text.contains("gmon_goroutine_exit{"));
        assert!(text.contains(r#"le="3"} 1"#));
        assert!(text.contains(r#"le="1"} 0"#));
        assert!(text.contains(r#"le="180"} 1"#));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let metrics = LifecycleMetrics::new().unwrap();
        metrics.record_spawn(&StackSignature(vec![0x1]));
        let addr = spawn_metrics_server(([127, 0, 0, 1], 0).into(), metrics).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("gmon_goroutine_creation"));
    }
}
