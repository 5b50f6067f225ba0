use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use megaswarm::api::create_api_server;
use megaswarm::directory::{MemoryReplica, RemoteReplicaFactory, ReplicatedDirectory};
use megaswarm::metrics::{start_metrics_server, MetricsConfig};
use megaswarm::network::{
    ChunkStore, ChunkTransport, ConnectionConfig, PeerService, QuicTransport, TransferRateLimiter,
};
use megaswarm::peer::{PeerAddress, PeerId, PeerNode, PeerTable};
use megaswarm::relay::RelayClient;
use megaswarm::{Config, NetworkManager};

/// Run a megaswarm peer.
#[derive(Parser, Debug)]
#[command(name = "megaswarm-node", version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for peer traffic, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peers to contact on startup, in addition to configured ones
    #[arg(short, long)]
    bootstrap: Vec<SocketAddr>,

    /// Serve the REST API on this address
    #[arg(long)]
    api: Option<SocketAddr>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    config.bootstrap_peers.extend(args.bootstrap.iter().copied());
    config.validate()?;

    let metrics_config = match args.metrics {
        Some(addr) => MetricsConfig::with_addr(addr),
        None => MetricsConfig::recorder_only(),
    };
    start_metrics_server(metrics_config)?;

    let quic = Arc::new(QuicTransport::new(ConnectionConfig {
        bind_addr: config.listen_addr,
        max_message_size: config.max_message_size,
        ..Default::default()
    })?);
    let local_addr = quic.local_addr()?;

    let id = PeerId::from_name(&config.node_name);
    let descriptor = PeerNode::new(id, PeerAddress::Quic(local_addr), config.storage_limit)
        .with_relay(config.relay_capable);
    let peers = Arc::new(PeerTable::new());
    let replica = Arc::new(MemoryReplica::new(id));
    let service = Arc::new(PeerService::new(
        descriptor,
        Arc::new(ChunkStore::new(config.storage_limit)),
        replica.clone(),
        peers.clone(),
    ));
    if config.relay_capable {
        service.set_forwarder(quic.clone());
    }
    let server = quic.serve(service.clone());

    let directory = ReplicatedDirectory::new(replica, config.directory_replication, config.directory_timeout)
        .with_factory(Arc::new(RemoteReplicaFactory::new(quic.clone())));

    let mut transport = ChunkTransport::new(quic.clone(), config.retry.clone())
        .with_rate_limiter(TransferRateLimiter::new(config.upload_limit_bps, 0));
    if config.relay_fallback {
        transport = transport.with_relay(Arc::new(RelayClient::new(id, quic.clone(), peers.clone())));
    }

    let manager = Arc::new(
        NetworkManager::builder(config)
            .service(service)
            .directory(Arc::new(directory))
            .transport(Arc::new(transport))
            .peers(peers)
            .build()?,
    );

    info!(node = %id, addr = %local_addr, "Node listening");
    let joined = manager.join_bootstrap().await?;
    if joined == 0 && !manager.config().bootstrap_peers.is_empty() {
        warn!("No bootstrap peer answered; running alone");
    }

    let maintenance = manager.start_maintenance();

    let api = match args.api {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding API on {addr}"))?;
            info!(%addr, "REST API listening");
            let app = create_api_server(manager.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(error = %e, "REST API stopped");
                }
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    maintenance.stop().await;
    if let Some(api) = api {
        api.abort();
    }
    server.abort();
    quic.close();
    Ok(())
}
