use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct MetricsHandles {
    messages_inspected: IntCounterVec,
    inspection_duration: Histogram,
    spam_classified: IntCounterVec,
    messages_quarantined: IntCounter,
    sessions_active: IntGauge,
}

static METRICS: Lazy<MetricsHandles> = Lazy::new(|| MetricsHandles {
    messages_inspected: register_int_counter_vec!(
        "gatekeeper_messages_inspected_total",
        "Messages run through attachment inspection, by verdict.",
        &["verdict"]
    )
    .expect("register gatekeeper_messages_inspected_total counter vec"),
    inspection_duration: register_histogram!(
        "gatekeeper_inspection_duration_seconds",
        "Time spent inspecting a message's attachments.",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("register gatekeeper_inspection_duration_seconds histogram"),
    spam_classified: register_int_counter_vec!(
        "gatekeeper_spam_classified_total",
        "Messages classified by bogofilter, by class.",
        &["class"]
    )
    .expect("register gatekeeper_spam_classified_total counter vec"),
    messages_quarantined: register_int_counter!(
        "gatekeeper_messages_quarantined_total",
        "Locally submitted spam put on hold."
    )
    .expect("register gatekeeper_messages_quarantined_total counter"),
    sessions_active: register_int_gauge!(
        "gatekeeper_sessions_active",
        "Milter connections currently being served."
    )
    .expect("register gatekeeper_sessions_active gauge"),
});

/// Counts an inspection result: `allow`, `error` or a deny label.
pub fn message_inspected(verdict: &str) {
    METRICS
        .messages_inspected
        .with_label_values(&[verdict])
        .inc();
}

pub fn observe_inspection(duration: Duration) {
    METRICS.inspection_duration.observe(duration.as_secs_f64());
}

pub fn spam_classified(class: &str) {
    METRICS.spam_classified.with_label_values(&[class]).inc();
}

pub fn message_quarantined() {
    METRICS.messages_quarantined.inc();
}

/// Keeps the active session gauge raised while alive.
pub struct SessionGuard(());

impl Drop for SessionGuard {
    fn drop(&mut self) {
        METRICS.sessions_active.dec();
    }
}

pub fn active_sessions() -> i64 {
    METRICS.sessions_active.get()
}

pub fn session_guard() -> SessionGuard {
    METRICS.sessions_active.inc();
    SessionGuard(())
}

/// Spawns the HTTP server that exposes Prometheus-compatible metrics.
pub fn spawn_metrics_server(addr: SocketAddr, shutdown: CancellationToken) {
    info!(%addr, "starting metrics endpoint");

    tokio::spawn(async move {
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(handle_metrics_request))
        });

        let server = Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        if let Err(err) = server.await {
            error!(%addr, error = %err, "metrics server exited unexpectedly");
        } else {
            info!(%addr, "metrics server stopped");
        }
    });
}

async fn handle_metrics_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") | (&Method::HEAD, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();

            if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
                warn!(error = %err, "failed to encode metrics payload");
                let response = Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("failed to encode metrics"))
                    .expect("failed to build metrics error response");
                return Ok(response);
            }

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                .body(Body::from(buffer))
                .expect("failed to build metrics response");
            Ok(response)
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("failed to build metrics 404 response")),
    }
}
