use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::Response,
    routing::get,
};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Request counters for both request families served by the edge.
pub struct EdgeMetrics {
    registry: Registry,
    doh_requests_total: IntCounter,
    doh_json_responses_total: IntCounter,
    doh_decode_failures_total: IntCounter,
    doh_missing_responses_total: IntCounter,
    proxy_requests_total: IntCounter,
    proxy_cache_hits_total: IntCounter,
    proxy_cache_misses_total: IntCounter,
    proxy_upstream_failures_total: IntCounter,
    rejected_requests_total: IntCounter,
}

impl EdgeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let doh_requests_total = counter(
            "dohedge_doh_requests_total",
            "Total number of DoH requests received",
        )?;
        let doh_json_responses_total = counter(
            "dohedge_doh_json_responses_total",
            "Number of DoH responses rendered as JSON",
        )?;
        let doh_decode_failures_total = counter(
            "dohedge_doh_decode_failures_total",
            "Number of DoH requests rejected because the query could not be decoded",
        )?;
        let doh_missing_responses_total = counter(
            "dohedge_doh_missing_responses_total",
            "Number of DoH requests for which the resolution pipeline wrote no response",
        )?;
        let proxy_requests_total = counter(
            "dohedge_proxy_requests_total",
            "Total number of caching proxy requests received",
        )?;
        let proxy_cache_hits_total = counter(
            "dohedge_proxy_cache_hits_total",
            "Number of proxy responses served from the persistent cache",
        )?;
        let proxy_cache_misses_total = counter(
            "dohedge_proxy_cache_misses_total",
            "Number of proxy cache lookups that missed",
        )?;
        let proxy_upstream_failures_total = counter(
            "dohedge_proxy_upstream_failures_total",
            "Number of upstream resolver calls that failed",
        )?;
        let rejected_requests_total = counter(
            "dohedge_rejected_requests_total",
            "Number of requests rejected by the request validator",
        )?;

        Ok(Self {
            registry,
            doh_requests_total,
            doh_json_responses_total,
            doh_decode_failures_total,
            doh_missing_responses_total,
            proxy_requests_total,
            proxy_cache_hits_total,
            proxy_cache_misses_total,
            proxy_upstream_failures_total,
            rejected_requests_total,
        })
    }

    pub fn inc_doh_request(&self) {
        self.doh_requests_total.inc();
    }

    pub fn inc_doh_json_response(&self) {
        self.doh_json_responses_total.inc();
    }

    pub fn inc_doh_decode_failure(&self) {
        self.doh_decode_failures_total.inc();
    }

    pub fn inc_doh_missing_response(&self) {
        self.doh_missing_responses_total.inc();
    }

    pub fn inc_proxy_request(&self) {
        self.proxy_requests_total.inc();
    }

    pub fn inc_proxy_cache_hit(&self) {
        self.proxy_cache_hits_total.inc();
    }

    pub fn inc_proxy_cache_miss(&self) {
        self.proxy_cache_misses_total.inc();
    }

    pub fn inc_proxy_upstream_failure(&self) {
        self.proxy_upstream_failures_total.inc();
    }

    pub fn inc_rejected(&self) {
        self.rejected_requests_total.inc();
    }

    #[cfg(test)]
    pub(crate) fn proxy_cache_hits(&self) -> u64 {
        self.proxy_cache_hits_total.get()
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Serve `/metrics` over plain HTTP until `shutdown` flips to `true`.
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<EdgeMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting metrics server");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Metrics server terminated unexpectedly")
}

async fn metrics_handler(State(metrics): State<Arc<EdgeMetrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            let mut response = Response::new(Body::from(err.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_counters() {
        let metrics = EdgeMetrics::new().expect("metrics");
        metrics.inc_doh_request();
        metrics.inc_proxy_cache_hit();
        metrics.inc_proxy_cache_hit();

        let text = String::from_utf8(metrics.render().expect("render")).expect("utf8");
        assert!(text.contains("dohedge_doh_requests_total 1"));
        assert!(text.contains("dohedge_proxy_cache_hits_total 2"));
        assert!(text.contains("dohedge_rejected_requests_total 0"));
        assert_eq!(metrics.proxy_cache_hits(), 2);
    }
}
