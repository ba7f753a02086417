//! Prometheus metrics
//!
//! Exposed over HTTP for scraping. All counters are process-wide; sessions
//! update them through the global accessor.

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    /// Total client sessions accepted
    pub sessions_total: IntCounter,
    /// Currently active client sessions
    pub sessions_active: IntGauge,

    /// Statements routed, by target role
    pub queries_routed_total: IntCounterVec,
    /// Statement latency by target role
    pub query_duration_seconds: HistogramVec,
    /// Query errors by kind
    pub query_errors_total: IntCounterVec,

    /// Successfully replayed transactions
    pub trx_replay_total: IntCounter,
    /// Transactions that outgrew the replay size cap
    pub trx_too_big_total: IntCounter,
    /// Causal reads that timed out waiting for a replica
    pub causal_timeouts_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "hermes_sessions_total",
            "Total number of client sessions accepted",
        )
        .unwrap();

        let sessions_active = IntGauge::new(
            "hermes_sessions_active",
            "Current number of active client sessions",
        )
        .unwrap();

        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "hermes_queries_routed_total",
                "Statements routed, by target role",
            ),
            &["target"],
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "hermes_query_duration_seconds",
                "Statement latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                10.0,
            ]),
            &["target"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("hermes_query_errors_total", "Query errors by kind"),
            &["kind"],
        )
        .unwrap();

        let trx_replay_total = IntCounter::new(
            "hermes_trx_replay_total",
            "Transactions successfully replayed after a backend failure",
        )
        .unwrap();

        let trx_too_big_total = IntCounter::new(
            "hermes_trx_too_big_total",
            "Transactions that exceeded the replay size cap",
        )
        .unwrap();

        let causal_timeouts_total = IntCounter::new(
            "hermes_causal_timeouts_total",
            "Causal reads failed because the replica did not catch up in time",
        )
        .unwrap();

        registry.register(Box::new(sessions_total.clone())).unwrap();
        registry.register(Box::new(sessions_active.clone())).unwrap();
        registry
            .register(Box::new(queries_routed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry.register(Box::new(trx_replay_total.clone())).unwrap();
        registry
            .register(Box::new(trx_too_big_total.clone()))
            .unwrap();
        registry
            .register(Box::new(causal_timeouts_total.clone()))
            .unwrap();

        Self {
            registry,
            sessions_total,
            sessions_active,
            queries_routed_total,
            query_duration_seconds,
            query_errors_total,
            trx_replay_total,
            trx_too_big_total,
            causal_timeouts_total,
        }
    }

    pub fn record_session_started(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn record_session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn record_route(&self, target: &str) {
        self.queries_routed_total.with_label_values(&[target]).inc();
    }

    pub fn record_query(&self, target: &str, seconds: f64) {
        self.query_duration_seconds
            .with_label_values(&[target])
            .observe(seconds);
    }

    pub fn record_query_error(&self, kind: &str) {
        self.query_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_trx_replay(&self) {
        self.trx_replay_total.inc();
    }

    pub fn record_trx_too_big(&self) {
        self.trx_too_big_total.inc();
    }

    pub fn record_causal_timeout(&self) {
        self.causal_timeouts_total.inc();
    }

    /// Metrics in Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
