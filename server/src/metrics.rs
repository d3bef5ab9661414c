//! Prometheus metrics.
//!
//! Counters are emitted with the `metrics` macros where the events happen;
//! this module describes them, installs the Prometheus recorder and serves
//! the scrape endpoint on its own listener.

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::broadcast;

/// Buckets for processor call latency, in seconds.
const GATEWAY_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0];

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter configuration was rejected.
    #[error("Invalid Prometheus exporter configuration: {0}")]
    Exporter(String),
    /// A different global recorder is already installed.
    #[error("Could not install Prometheus recorder: {0}")]
    Recorder(String),
    /// The scrape listener failed.
    #[error("Metrics listener failed: {0}")]
    Listener(#[from] std::io::Error),
}

/// Scrape endpoint for the service's counters and histograms.
pub struct MetricsServer {
    addr: SocketAddr,
    recorder: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Scrape endpoint to be bound on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            recorder: None,
        }
    }

    /// Describe every metric and install the global Prometheus recorder.
    ///
    /// Installing twice in one process is not an error; the second server
    /// then has nothing to render.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Exporter`] or [`MetricsError::Recorder`].
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("gateway.request_duration_seconds".to_string()),
                GATEWAY_LATENCY_BUCKETS,
            )
            .map_err(|e| MetricsError::Exporter(e.to_string()))?
            .install_recorder();

        match recorder {
            Ok(handle) => self.recorder = Some(handle),
            Err(e) if e.to_string().contains("already initialized") => {
                tracing::warn!("Prometheus recorder was installed earlier, metrics endpoint will be empty");
            }
            Err(e) => return Err(MetricsError::Recorder(e.to_string())),
        }
        Ok(())
    }

    /// Current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.recorder.as_ref().map(PrometheusHandle::render)
    }

    /// Serve `GET /metrics` until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Listener`] if the address cannot be bound or
    /// the listener fails.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), MetricsError> {
        let Some(recorder) = self.recorder else {
            tracing::warn!("No Prometheus recorder, not serving metrics");
            return Ok(());
        };
        let app = Router::new().route("/metrics", get(move || async move { recorder.render() }));
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "Serving metrics");
        let stop = async move {
            let _ = shutdown.recv().await;
        };
        axum::serve(listener, app).with_graceful_shutdown(stop).await?;
        Ok(())
    }
}

/// Describe every metric the service emits.
pub fn register_metrics() {
    describe_counter!("tickets.allocated", "Tickets issued, by path");
    describe_counter!("payments.approved", "Payments approved on the approval callback");
    describe_counter!("payments.settled", "Settlements that issued tickets, by path");
    describe_counter!(
        "payments.settle_replayed",
        "Settlements that returned stored tickets without writing"
    );
    describe_counter!(
        "allocation.rejected",
        "Reservations refused by the allocator, by reason and path"
    );
    describe_counter!(
        "ledger.duplicate_payment",
        "Payment ids reused with differing contents"
    );

    describe_counter!("reconciliation.recovered", "Payments settled by recovery");
    describe_counter!(
        "reconciliation.already_recovered",
        "Recoveries of payments that already had tickets"
    );
    describe_counter!("reconciliation.failed", "Recoveries that failed, by reason");
    describe_counter!("reconciliation.sweeps", "Reconciliation sweeps run");
    describe_counter!(
        "reconciliation.cancelled",
        "Unsettled records cancelled because the processor cancelled them"
    );
    describe_counter!(
        "reconciliation.abandoned",
        "Unsettled records failed after going unseen upstream"
    );

    describe_counter!("vouchers.redeemed", "Voucher redemptions that issued tickets");
    describe_counter!("vouchers.refused", "Voucher redemptions refused, by reason");
    describe_counter!("competitions.cancelled", "Competitions cancelled by an operator");

    describe_histogram!(
        "gateway.request_duration_seconds",
        "Payment processor call latency, by operation"
    );
    describe_counter!("gateway.errors", "Payment processor call failures, by operation and kind");
    describe_counter!("retry.attempts", "Retries of failed operations");
    describe_counter!("retry.exhausted", "Operations that failed after the last retry");
}
