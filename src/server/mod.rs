mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::GatewayState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Bind the proxy listener and run its accept loop until shutdown.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listener bound, addr={}", addr);
    serve_proxy(listener, state, shutdown).await
}

/// Accept loop over an already-bound listener. Split from
/// `run_proxy_server` so tests can bind an ephemeral port first.
///
/// On shutdown the listener closes immediately and in-flight connections
/// (long model streams included) get a bounded window to finish.
pub async fn serve_proxy(
    listener: TcpListener,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let open_conns = Arc::new(AtomicI64::new(0));

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("server: shutdown signal, closing proxy listener");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    metrics::counter!(
                        "gateway_connections_total",
                        "status" => "accepted",
                    )
                    .increment(1);
                    spawn_connection(stream, peer_addr, state.clone(), open_conns.clone());
                }
                Err(e) => {
                    metrics::counter!(
                        "gateway_connections_total",
                        "status" => "error",
                    )
                    .increment(1);
                    error!("server: accept error: {}", e);
                }
            },
        }
    }

    drain_connections(&open_conns).await;
    Ok(())
}

/// Drive one downstream connection to completion on its own task, keeping
/// the open-connection count (the drain signal) accurate on every exit.
fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: GatewayState,
    open_conns: Arc<AtomicI64>,
) {
    metrics::gauge!("gateway_connections_active").increment(1.0);
    open_conns.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(async move {
        let svc = service_fn({
            let state = state.clone();
            move |req: Request<Incoming>| {
                let state = state.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            }
        });

        let served = auto::Builder::new(TokioExecutor::new())
            .http1()
            .keep_alive(true)
            .http2()
            .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
            .serve_connection_with_upgrades(TokioIo::new(stream), svc)
            .await;

        if let Err(e) = served {
            let msg = e.to_string();
            if !msg.contains("connection closed") {
                error!("server: connection to {} failed: {}", peer_addr, msg);
            }
        }

        open_conns.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("gateway_connections_active").decrement(1.0);
    });
}

/// Wait for open connections to wind down after the accept loop stops,
/// giving up once the drain window elapses.
async fn drain_connections(open_conns: &AtomicI64) {
    const DRAIN_LIMIT: std::time::Duration = std::time::Duration::from_secs(30);
    const POLL_EVERY: std::time::Duration = std::time::Duration::from_millis(100);

    let open = open_conns.load(Ordering::Relaxed);
    if open == 0 {
        return;
    }
    info!("server: draining {} open connections", open);

    let deadline = tokio::time::Instant::now() + DRAIN_LIMIT;
    loop {
        let open = open_conns.load(Ordering::Relaxed);
        if open == 0 {
            info!("server: drain complete");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "server: drain window of {:?} elapsed, {} connections abandoned",
                DRAIN_LIMIT, open
            );
            return;
        }
        tokio::time::sleep(POLL_EVERY).await;
    }
}

/// Admin listener: health/readiness plus the Prometheus scrape endpoint.
/// Plain HTTP/1 accept loop, no drain handling needed.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listener bound, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            let served = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(TokioIo::new(stream), svc)
                .await;

            if let Err(e) = served {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin connection failed: {}", e);
                }
            }
        });
    }
}
