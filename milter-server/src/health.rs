use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::callbacks::Filters;
use crate::metrics;

/// What `/healthz` reports on: the milter listener, shutdown and the filters.
#[derive(Debug, Clone)]
pub struct Health {
    listening: Arc<AtomicBool>,
    shutdown: CancellationToken,
    filters: Arc<Filters>,
}

impl Health {
    pub fn new(filters: Arc<Filters>, shutdown: CancellationToken) -> Self {
        Self {
            listening: Arc::new(AtomicBool::new(false)),
            shutdown,
            filters,
        }
    }

    /// Called once the milter socket accepts connections.
    pub fn mark_listening(&self) {
        self.listening.store(true, Ordering::Release);
    }

    async fn status(&self) -> (StatusCode, &'static str) {
        if self.shutdown.is_cancelled() {
            return (StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }
        if !self.listening.load(Ordering::Acquire) {
            return (StatusCode::SERVICE_UNAVAILABLE, "starting");
        }
        if let Some(spam) = &self.filters.spam {
            if !tokio::fs::try_exists(spam.db()).await.unwrap_or(false) {
                return (StatusCode::SERVICE_UNAVAILABLE, "bogofilter database missing");
            }
        }
        (StatusCode::OK, "ok")
    }

    fn report(&self, state: &str) -> String {
        let on_off = |enabled: bool| if enabled { "on" } else { "off" };
        format!(
            "{state}\nattachments={}\nspam={}\nsessions={}\n",
            on_off(self.filters.attachments.is_some()),
            on_off(self.filters.spam.is_some()),
            metrics::active_sessions(),
        )
    }
}

/// Spawns a small HTTP server answering `/healthz` until shutdown.
pub fn spawn_health_server(addr: SocketAddr, health: Health) {
    info!(%addr, "starting health endpoint");

    tokio::spawn(async move {
        let shutdown = health.shutdown.clone();
        let make_svc = make_service_fn(move |_conn| {
            let health = health.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let health = health.clone();
                    async move { handle_health_request(req, &health).await }
                }))
            }
        });

        let server = Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        if let Err(err) = server.await {
            error!(%addr, error = %err, "health server exited unexpectedly");
        } else {
            info!(%addr, "health server stopped");
        }
    });
}

async fn handle_health_request(
    req: Request<Body>,
    health: &Health,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") | (&Method::HEAD, "/healthz") => {
            let (status, state) = health.status().await;
            Ok(Response::builder()
                .status(status)
                .body(Body::from(health.report(state)))
                .expect("failed to build health response"))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("failed to build health 404 response")),
    }
}
