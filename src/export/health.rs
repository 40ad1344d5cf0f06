use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::reader::stats::ReaderStatsSnapshot;
use crate::watcher::TickSummary;

const NAMESPACE: &str = "logwatch";

/// Prometheus metrics describing the monitor itself.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Reader ===
    /// Lines read from the access log.
    pub lines_read: Counter,
    /// Lines turned into events.
    pub events_ingested: Counter,
    /// Lines dropped because they could not be parsed.
    pub lines_dropped: Counter,

    // === Watcher ===
    pub ticks: Counter,
    pub alert_errors: Counter,
    pub alerts_raised: Counter,
    pub alerts_released: Counter,
    pub alerts_active: Gauge,
    /// Live time buckets.
    pub buckets: Gauge,
    /// Greatest section count seen in a reduced window.
    pub max_section_count_ever: Gauge,
    /// Virtual clock of the last tick, in epoch seconds.
    pub virtual_time: Gauge,
    pub tick_duration: Histogram,
}

impl HealthMetrics {
    /// Creates the metrics with all of them registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_read = counter("lines_read_total", "Total lines read from the access log.")?;
        let events_ingested = counter(
            "events_ingested_total",
            "Total access log events dispatched to the statistics.",
        )?;
        let lines_dropped = counter(
            "lines_dropped_total",
            "Total access log lines dropped as unparsable.",
        )?;
        let ticks = counter("ticks_total", "Total watch cycles.")?;
        let alert_errors = counter(
            "alert_errors_total",
            "Total alert checks that failed to evaluate.",
        )?;
        let alerts_raised = counter("alerts_raised_total", "Total alerts raised.")?;
        let alerts_released = counter("alerts_released_total", "Total alerts released.")?;
        let alerts_active = gauge("alerts_active", "Number of currently raised alerts.")?;
        let buckets = gauge("buckets", "Number of live time buckets.")?;
        let max_section_count_ever = gauge(
            "max_section_count_ever",
            "Greatest number of sections seen in a reduced window.",
        )?;
        let virtual_time = gauge(
            "virtual_time_seconds",
            "Reader clock instant of the last watch cycle.",
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tick_duration_seconds",
                "Time spent in a single watch cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;

        registry.register(Box::new(lines_read.clone()))?;
        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(lines_dropped.clone()))?;
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(alert_errors.clone()))?;
        registry.register(Box::new(alerts_raised.clone()))?;
        registry.register(Box::new(alerts_released.clone()))?;
        registry.register(Box::new(alerts_active.clone()))?;
        registry.register(Box::new(buckets.clone()))?;
        registry.register(Box::new(max_section_count_ever.clone()))?;
        registry.register(Box::new(virtual_time.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_read,
            events_ingested,
            lines_dropped,
            ticks,
            alert_errors,
            alerts_raised,
            alerts_released,
            alerts_active,
            buckets,
            max_section_count_ever,
            virtual_time,
            tick_duration,
        })
    }

    /// Adds a reader counter delta.
    pub fn record_reader(&self, delta: ReaderStatsSnapshot) {
        self.lines_read.inc_by(delta.lines_read as f64);
        self.events_ingested.inc_by(delta.events as f64);
        self.lines_dropped.inc_by(delta.lines_dropped as f64);
    }

    pub fn record_tick(&self, summary: &TickSummary) {
        self.ticks.inc();
        self.alert_errors.inc_by(summary.alert_errors as f64);
        self.alerts_raised.inc_by(summary.alerts_raised as f64);
        self.alerts_released.inc_by(summary.alerts_released as f64);
        self.alerts_active.set(summary.alerts_active as f64);
        self.buckets.set(summary.bucket_count as f64);
        self.max_section_count_ever
            .set(summary.max_section_count_ever as f64);
        if let Some(at_millis) = summary.at_millis {
            self.virtual_time.set(at_millis as f64 / 1000.0);
        }
        self.tick_duration.observe(summary.elapsed.as_secs_f64());
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" binds every interface.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(
        Opts::new(name, help).namespace(NAMESPACE),
    )?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_record_tick_updates_metrics() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.record_tick(&TickSummary {
            at_millis: Some(5_000),
            alerts_raised: 1,
            alerts_active: 1,
            bucket_count: 12,
            max_section_count_ever: 4,
            elapsed: Duration::from_micros(200),
            ..Default::default()
        });
        metrics.record_reader(ReaderStatsSnapshot {
            lines_read: 10,
            events: 9,
            lines_dropped: 1,
        });

        assert_eq!(metrics.alerts_raised.get(), 1.0);
        assert_eq!(metrics.buckets.get(), 12.0);
        assert_eq!(metrics.virtual_time.get(), 5.0);
        assert_eq!(metrics.lines_dropped.get(), 1.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("logwatch_lines_read_total 10"));
        assert!(text.contains("logwatch_max_section_count_ever 4"));
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.start().await.expect("start");
        metrics.stop().await.expect("stop");
        assert!(metrics.shutdown.lock().is_none());
    }
}
