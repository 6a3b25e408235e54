use clap::Parser;
use miette::{miette, Context, IntoDiagnostic, Result};
use milter::{actions, protocol, Milter, MilterServer};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod callbacks;
mod config;
mod filters;
mod health;
mod inspect;
mod metrics;

use callbacks::{FilterSession, Filters};
use config::{Cfg, CfgLog, LogFormat, Proto};
use health::Health;

#[derive(Parser, Debug)]
#[command(version, about = "Milter rejecting dangerous attachments and tagging spam")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GATEKEEPER_CONFIG", default_value = "config.toml")]
    config: String,

    /// Listener kind, overrides `server.proto`.
    #[arg(long, value_enum)]
    proto: Option<Proto>,

    /// Socket path or host:port, overrides `server.addr`.
    #[arg(long)]
    addr: Option<String>,
}

fn init_tracing(log: &CfgLog) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid log level {:?}", log.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Fmt => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| miette!("failed to set up logging: {err}"))
}

fn parse_addr(addr: &str, key: &str) -> Result<SocketAddr> {
    addr.parse()
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid {key} {addr:?}"))
}

fn spawn_session<S>(server: &MilterServer, socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server = server.clone();
    tokio::spawn(async move {
        let _guard = metrics::session_guard();
        if let Err(err) = server.handle_client(socket).await {
            warn!(error = ?err, "milter session failed");
        }
    });
}

async fn serve_tcp(
    listener: TcpListener,
    server: MilterServer,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted
                    .into_diagnostic()
                    .wrap_err("error accepting tcp connection")?;
                debug!(%peer, "accepted milter connection");
                spawn_session(&server, socket);
            }
        }
    }
}

async fn serve_unix(
    listener: UnixListener,
    server: MilterServer,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, _) = accepted
                    .into_diagnostic()
                    .wrap_err("error accepting unix connection")?;
                debug!("accepted milter connection");
                spawn_session(&server, socket);
            }
        }
    }
}

async fn bind_unix(path: &str, mode: u32) -> Result<UnixListener> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path, "removed stale socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to remove stale socket {path}"))
        }
    }

    let listener = UnixListener::bind(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind unix socket {path}"))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to set permissions on {path}"))?;
    Ok(listener)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = Cfg::load(&args.config)?;
    if let Some(proto) = args.proto {
        cfg.server.proto = proto;
    }
    if let Some(addr) = args.addr {
        cfg.server.addr = addr;
    }
    init_tracing(&cfg.log)?;

    let shutdown = CancellationToken::new();
    if let Some(addr) = &cfg.server.metrics_addr {
        let addr = parse_addr(addr, "server.metrics_addr")?;
        metrics::spawn_metrics_server(addr, shutdown.clone());
    }

    let filters = Arc::new(Filters::from_config(&cfg));
    info!(
        attachments = filters.attachments.is_some(),
        spam = filters.spam.is_some(),
        "filters configured"
    );
    let health = Health::new(filters.clone(), shutdown.clone());
    if let Some(addr) = &cfg.server.health_addr {
        let addr = parse_addr(addr, "server.health_addr")?;
        health::spawn_health_server(addr, health.clone());
    }
    let server = MilterServer::new(
        move || Box::new(FilterSession::new(filters.clone())) as Box<dyn Milter>,
        actions::ADD_HEADERS | actions::CHANGE_HEADERS | actions::QUARANTINE,
        protocol::NO_CONNECT | protocol::NO_HELO | protocol::NO_RCPT,
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested");
        signal_token.cancel();
    });

    let addr = cfg.server.addr.clone();
    match cfg.server.proto {
        Proto::Tcp => {
            let listener = TcpListener::bind(&addr)
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to bind {addr}"))?;
            info!(%addr, "gatekeeper listening on tcp");
            health.mark_listening();
            serve_tcp(listener, server, shutdown).await
        }
        Proto::Unix => {
            let listener = bind_unix(&addr, cfg.socket_mode()?).await?;
            info!(%addr, "gatekeeper listening on unix socket");
            health.mark_listening();
            let served = serve_unix(listener, server, shutdown).await;
            if let Err(err) = tokio::fs::remove_file(&addr).await {
                warn!(%addr, error = %err, "failed to remove socket");
            }
            served
        }
    }
}
