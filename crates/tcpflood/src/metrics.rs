use crate::listener::ACTIVE_CONNECTIONS;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CONNECTION_GAUGE: Gauge = Gauge::new(
        "tcpflood_active_connections",
        "Number of connections currently held by the listener"
    )
    .expect("metric can be created");
    pub static ref ACCEPTED_CONNECTIONS: IntCounter = IntCounter::new(
        "tcpflood_accepted_connections_total",
        "Total number of connections accepted by the listener"
    )
    .expect("metric can be created");
    /// Listener connections by first-payload classification
    pub static ref CLASSIFIED_CONNECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tcpflood_classified_connections_total",
            "Listener connections by first-payload classification"
        ),
        &["class"]
    )
    .expect("metric can be created");
    pub static ref GREETING_REPLIES: IntCounter = IntCounter::new(
        "tcpflood_greeting_replies_total",
        "Greeting connections that received a reply"
    )
    .expect("metric can be created");
    /// Greeting connections past the per-epoch reply cap
    pub static ref GREETINGS_SUPPRESSED: IntCounter = IntCounter::new(
        "tcpflood_greetings_suppressed_total",
        "Greeting connections refused a reply by the per-epoch cap"
    )
    .expect("metric can be created");
    pub static ref STREAM_BYTES_SENT: IntCounter = IntCounter::new(
        "tcpflood_stream_bytes_sent_total",
        "Bytes written to stream-request connections"
    )
    .expect("metric can be created");
    pub static ref LAST_EPOCH_CONNECTIONS: IntGauge = IntGauge::new(
        "tcpflood_last_epoch_connections",
        "Connections accepted during the most recently completed epoch"
    )
    .expect("metric can be created");
    pub static ref SENDER_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tcpflood_sender_attempts_total",
            "Connection attempts issued by the sender per mode"
        ),
        &["mode"]
    )
    .expect("metric can be created");
    pub static ref SENDER_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tcpflood_sender_failures_total",
            "Failed connection attempts per sender mode"
        ),
        &["mode"]
    )
    .expect("metric can be created");
}

pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(CONNECTION_GAUGE.clone()));
    let _ = REGISTRY.register(Box::new(ACCEPTED_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(CLASSIFIED_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(GREETING_REPLIES.clone()));
    let _ = REGISTRY.register(Box::new(GREETINGS_SUPPRESSED.clone()));
    let _ = REGISTRY.register(Box::new(STREAM_BYTES_SENT.clone()));
    let _ = REGISTRY.register(Box::new(LAST_EPOCH_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(SENDER_ATTEMPTS.clone()));
    let _ = REGISTRY.register(Box::new(SENDER_FAILURES.clone()));
}

fn update_metrics() {
    let count = ACTIVE_CONNECTIONS.load(Ordering::SeqCst) as f64;
    CONNECTION_GAUGE.set(count);
}

pub fn render_metrics() -> String {
    update_metrics();

    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| "# Error: Invalid UTF8".to_string())
}

async fn metrics_handler(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match req.uri().path() {
        "/health" => Ok(Response::new(Body::from("OK"))),
        "/metrics" => Ok(Response::new(Body::from(render_metrics()))),
        _ => {
            let mut not_found = Response::new(Body::from("Not Found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

/// Serves `/metrics` and `/health` until `cancel` fires.
pub async fn serve(port: u16, cancel: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    register_metrics();

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(metrics_handler)) });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Metrics server could not bind");
            return;
        }
    };

    info!(port = port, "Observability server online");

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = server.with_graceful_shutdown(shutdown).await {
        error!(error = %e, "Observability server failed");
    }
}
