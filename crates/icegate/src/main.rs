//! icegate: session-aware WebRTC proxy/relay.

mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use icegate_relay_core::cache::Cache;
use icegate_relay_core::config::ListenerUri;
use icegate_relay_core::geo::{GeoOracle, RouteOracle};
use icegate_relay_core::signal::{router, run_http_listener, signal_state};
use icegate_relay_core::transport::tcp::{tls_acceptor, TcpRelayListener};
use icegate_relay_core::transport::udp::UdpRelayListener;
use icegate_relay_core::Hub;

#[derive(Debug, Parser)]
#[command(name = "icegate", about = "Session-aware WebRTC proxy/relay")]
struct Args {
    /// Config file.
    #[arg(short = 'f', value_name = "FILE", default_value = "icegate.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let file = match config::load(&args.config) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("icegate: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&file.log);

    if let Err(e) = run(file).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(file: config::FileConfig) -> Result<(), Box<dyn std::error::Error>> {
    let relay = file.relay;
    info!(version = icegate_relay_core::signal::AGENT_VERSION, "starting");

    let cache = Arc::new(match relay.cache_ttl() {
        Some(ttl) => Cache::with_ttl(ttl),
        None => Cache::new(),
    });

    let oracle: Arc<dyn RouteOracle> = Arc::new(match &relay.geoip_db {
        Some(path) => GeoOracle::open(path),
        None => GeoOracle::disabled(),
    });

    let proxy_candidates = relay.proxy_candidates()?;
    if proxy_candidates.is_empty() {
        warn!("no proxy candidates configured, every session will go direct");
    }

    let state = signal_state(
        cache.clone(),
        oracle,
        proxy_candidates,
        relay.http.request_id_header.as_deref(),
    );
    let signal_router = router(state);

    let tls = match &relay.tls {
        Some(tls) => Some(tls_acceptor(&tls.cert, &tls.key)?),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let hub = Hub::new(cache.clone(), relay.upstream.clone());
    let intake = hub.intake();
    tasks.push(tokio::spawn(hub.clone().run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(cache.clone().run_sweeper(shutdown_rx.clone())));

    for listener in relay.ice_listeners()? {
        match listener {
            ListenerUri::Udp(addr) => {
                let listener = UdpRelayListener::bind(addr).await?;
                tasks.push(tokio::spawn(
                    listener.run(intake.clone(), shutdown_rx.clone()),
                ));
            }
            ListenerUri::Tcp(addr) => {
                let listener = TcpRelayListener::bind(
                    addr,
                    intake.clone(),
                    signal_router.clone(),
                    tls.clone(),
                )
                .await?;
                tasks.push(tokio::spawn(listener.run(shutdown_rx.clone())));
            }
        }
    }

    for addr in &relay.http.addrs {
        let addr = addr
            .parse()
            .map_err(|e| format!("bad http address {addr:?}: {e}"))?;
        let router = signal_router.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_http_listener(addr, router, shutdown).await {
                error!(%addr, error = %e, "http listener failed");
            }
        }));
    }

    info!("running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
    }
    Ok(())
}
