//! Prometheus scrape endpoint.
//!
//! Renders the dataplane counters and the active routing epoch in
//! Prometheus exposition format. One axum route for scrapes, one liveness
//! probe, nothing else.

use std::net::SocketAddr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use maglev_lb_core::RouterControl;
use tracing::info;

use crate::worker::DataplaneStats;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Everything the scrape handler reads.
#[derive(Clone)]
pub struct Telemetry {
    pub interface: String,
    pub stats: Arc<DataplaneStats>,
    pub control: Arc<RouterControl>,
}

impl Telemetry {
    /// Serve the scrape endpoint until the surrounding task is aborted.
    pub async fn serve(self, bind: SocketAddr, path: String) -> Result<()> {
        info!(bind = %bind, path = %path, "starting telemetry endpoint");

        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding telemetry endpoint to {}", bind))?;

        let app = Router::new()
            .route(&path, get(scrape))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(self);

        axum::serve(listener, app)
            .await
            .context("telemetry endpoint error")
    }

    /// One exposition document: HELP/TYPE/value per series, all labeled
    /// with the steered interface.
    fn render(&self) -> String {
        let stats = &self.stats;
        let epoch = self.control.load();

        let series: [(&str, &str, &str, u64); 10] = [
            (
                "maglev_lb_packets_received_total",
                "counter",
                "Frames received",
                stats.pkts_received.load(Relaxed),
            ),
            (
                "maglev_lb_packets_steered_total",
                "counter",
                "Frames rewritten and re-emitted",
                stats.pkts_steered.load(Relaxed),
            ),
            (
                "maglev_lb_packets_ignored_total",
                "counter",
                "Non-IPv4 or undersized frames skipped",
                stats.pkts_ignored.load(Relaxed),
            ),
            (
                "maglev_lb_packets_tx_failed_total",
                "counter",
                "Frames that failed to send",
                stats.pkts_tx_failed.load(Relaxed),
            ),
            (
                "maglev_lb_bytes_received_total",
                "counter",
                "Bytes received",
                stats.bytes_received.load(Relaxed),
            ),
            (
                "maglev_lb_bytes_steered_total",
                "counter",
                "Bytes re-emitted",
                stats.bytes_steered.load(Relaxed),
            ),
            (
                "maglev_lb_flow_cache_hits_total",
                "counter",
                "Flow cache hits across workers",
                stats.cache_hits.load(Relaxed),
            ),
            (
                "maglev_lb_flow_cache_misses_total",
                "counter",
                "Flow cache misses across workers",
                stats.cache_misses.load(Relaxed),
            ),
            (
                "maglev_lb_backends",
                "gauge",
                "Backends in the active epoch",
                epoch.backends().len() as u64,
            ),
            (
                "maglev_lb_epoch",
                "gauge",
                "Sequence number of the active routing epoch",
                epoch.seq(),
            ),
        ];

        let mut doc = String::with_capacity(2048);
        for (name, kind, help, value) in series {
            doc.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name}{{interface=\"{iface}\"}} {value}\n",
                iface = self.interface,
            ));
        }
        doc
    }
}

async fn scrape(State(telemetry): State<Telemetry>) -> impl IntoResponse {
    ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], telemetry.render())
}
