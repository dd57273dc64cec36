//! blockserver -- replicated key-value block server.
//!
//! Every node starts as a follower with an empty log and store. State lives
//! only in memory; a restarted node catches up from the current leader.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use blockserver::auth::{JwtVerifier, TokenVerifier};
use blockserver::cluster::{ConsensusNode, HttpTransport, PeerTransport, Timing};
use blockserver::config::{Config, LoggingConfig};

/// Command-line arguments for the block server.
#[derive(Parser, Debug)]
#[command(
    name = "blockserver",
    version,
    about = "Replicated key-value block server"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Position of this node in the member list.
    #[arg(short, long)]
    index: Option<usize>,

    /// File listing every member address, one per line.
    #[arg(short, long)]
    peers: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => blockserver::config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(index) = cli.index {
        config.cluster.node_index = index;
    }
    if let Some(peers) = &cli.peers {
        config.cluster.peers.clear();
        config.cluster.peers_file = Some(peers.clone());
    }

    init_tracing(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {path}");
    }
    config.cluster.validate()?;

    let fallback = format!("http://127.0.0.1:{}", config.server.port);
    let bootstrap = config.cluster.bootstrap(&fallback)?;
    let port = bootstrap.port().unwrap_or(config.server.port);
    let bind_addr = cli
        .bind
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.server.host, port));
    info!(
        "Node {} with {} peers: {:?}",
        bootstrap.address,
        bootstrap.peers.len(),
        bootstrap.peers
    );

    if config.observability.metrics {
        blockserver::metrics::init_metrics()?;
        blockserver::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::from_config(&config.auth)?);
    info!(
        "Verifying {} tokens from issuer {}",
        config.auth.algorithm, config.auth.issuer
    );

    let timing = Timing::from_config(&config.cluster);
    let transport: Arc<dyn PeerTransport> = Arc::new(HttpTransport::new(timing.rpc_timeout)?);
    let node = Arc::new(ConsensusNode::new(
        bootstrap.address,
        bootstrap.peers,
        timing,
        transport,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consensus = tokio::spawn(node.clone().run(shutdown_rx.clone()));

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(blockserver::AppState {
        config,
        node,
        verifier,
    });
    let app = blockserver::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("blockserver listening on {}", bind_addr);

    let mut serve_rx = shutdown_rx;
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        joined = &mut server => {
            let _ = shutdown_tx.send(true);
            joined??;
            return Ok(());
        }
    }

    // Stop accepting connections and give in-flight requests a bounded
    // window to finish. There is nothing to flush.
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(shutdown_timeout, &mut server).await {
        Ok(joined) => joined??,
        Err(_) => {
            warn!("in-flight requests still running after {shutdown_timeout:?}, exiting");
            server.abort();
        }
    }
    let _ = consensus.await;

    info!("blockserver shut down");
    Ok(())
}

/// Initialize the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
