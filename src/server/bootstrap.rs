use crate::{config, discovery, server, tools};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → probe → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: load config and build state. A parse failure here is fatal;
    // the process exits non-zero before binding anything.
    let gateway = config::GatewayConfig::load(&args.config_path)?;
    let state = server::GatewayState::new(gateway)?;

    let shutdown = Arc::new(Notify::new());

    // Phase 2: background loops.
    start_health_check_loop(&state, &shutdown);
    start_admin_server(&state, &args);

    // Phase 3: consul self-registration (agent probes our /health from here).
    let consul_registry = setup_consul_registry(&state, &args).await;

    tracing::info!("server: gateway starting, listen={}", args.listen);

    let proxy_handle = {
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server::run_proxy_server(&listen, state, shutdown).await })
    };

    // Phase 4: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    if let Some(ref reg) = consul_registry {
        if let Err(e) = reg.deregister().await {
            tracing::error!("consul: deregister on shutdown failed: {}", e);
        }
    }

    // Wait for the proxy to finish draining.
    match proxy_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown finished");
    Ok(())
}

/// JSON log lines on stdout through a non-blocking writer, so a slow log
/// sink cannot stall request handling. `RUST_LOG` filters; info otherwise.
fn init_tracing() {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    // The writer thread must outlive every logging call site.
    std::mem::forget(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn start_health_check_loop(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    let monitor = state.tools.clone();
    let hc = state.config.load().health_check.clone();
    let shutdown = shutdown.clone();

    if monitor.service_count() == 0 {
        tracing::info!("health: no tool services configured, prober disabled");
        return;
    }

    tokio::spawn(async move {
        let client = tools::health::build_probe_client(&hc);
        let mut ticker = tokio::time::interval(Duration::from_secs(hc.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval() fires immediately; swallow that tick so the first
        // probe round happens one interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tools::health::run_probe_round(&monitor, &client, &hc).await;
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let state = state.clone();
    let listen = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: admin listener exited: {}", e);
        }
    });
}

async fn setup_consul_registry(
    state: &server::GatewayState,
    args: &BootstrapArgs,
) -> Option<Arc<discovery::ConsulRegistry>> {
    let cfg = state.config.load_full();
    if !cfg.registration.enabled {
        tracing::info!("consul: self-registration is off");
        return None;
    }

    let client = discovery::ConsulClient::new(
        &cfg.consul.address,
        cfg.consul.token.clone(),
        cfg.consul.datacenter.clone(),
    );

    let registry = match discovery::ConsulRegistry::new(client, &args.listen, &cfg.registration) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!("consul: registry setup failed: {}", e);
            return None;
        }
    };

    // A failed initial registration is not fatal: the gateway serves
    // traffic regardless, and operators can re-register out of band.
    if let Err(e) = registry.register().await {
        tracing::error!("consul: initial registration was rejected: {}", e);
    }
    Some(registry)
}

/// Block until SIGINT or SIGTERM, then wake every background loop.
async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler install failed");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("server: interrupt received, beginning shutdown");
            }
            _ = term.recv() => {
                tracing::info!("server: terminate signal received, beginning shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("server: interrupt received, beginning shutdown");
    }

    shutdown.notify_waiters();
}
