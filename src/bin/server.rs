//! Consensus server binary
//!
//! Runs a single server with separate listeners for cluster RPC and the
//! client API.
//!
//! A brand-new cluster starts from one server launched with `--bootstrap`,
//! which seeds its log with a single-server configuration; further servers
//! start with empty logs and are added through membership changes
//! (`POST /client/configuration`).
//!
//! Example for growing a 3-server cluster:
//!   server 1: raftlog-server --id 1 --listen 127.0.0.1:8001 --api-listen 127.0.0.1:9001 --data-dir /tmp/raft1 --bootstrap
//!   server 2: raftlog-server --id 2 --listen 127.0.0.1:8002 --api-listen 127.0.0.1:9002 --data-dir /tmp/raft2
//!   server 3: raftlog-server --id 3 --listen 127.0.0.1:8003 --api-listen 127.0.0.1:9003 --data-dir /tmp/raft3
//!   then POST to server 1: /client/configuration with all three servers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftlog::api::client_http::create_client_router;
use raftlog::core::config::RaftOptions;
use raftlog::core::consensus::{bootstrap, ReplicatedLog};
use raftlog::core::message::ServerAddress;
use raftlog::storage::FileLog;
use raftlog::transport::http::{create_router, HttpTransport};

#[derive(Parser)]
#[command(name = "raftlog-server", about = "Replicated log consensus server")]
struct Args {
    /// Unique nonzero server id.
    #[arg(long)]
    id: u64,

    /// Address for cluster RPC traffic (/raft/*).
    #[arg(long)]
    listen: SocketAddr,

    /// Address for the client API (/client/*).
    #[arg(long)]
    api_listen: SocketAddr,

    /// Address peers should dial; defaults to --listen.
    #[arg(long)]
    advertise: Option<String>,

    /// Directory for the durable log and metadata.
    #[arg(long)]
    data_dir: PathBuf,

    /// Seed a fresh log with a single-server configuration. Only for the
    /// first server of a new cluster.
    #[arg(long)]
    bootstrap: bool,

    /// Follower inactivity timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    follower_timeout_ms: u64,

    /// Leader heartbeat period in milliseconds.
    #[arg(long, default_value_t = 50)]
    heartbeat_period_ms: u64,

    /// RPC timeout towards peers in milliseconds.
    #[arg(long, default_value_t = 5000)]
    rpc_timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let advertise = args
        .advertise
        .clone()
        .unwrap_or_else(|| args.listen.to_string());

    let mut store = FileLog::open(&args.data_dir).expect("failed to open log directory");
    if args.bootstrap {
        bootstrap(
            &mut store,
            ServerAddress { id: args.id, address: advertise.clone() },
        )
        .expect("failed to bootstrap configuration");
    }

    let options = RaftOptions::default()
        .with_follower_timeout(Duration::from_millis(args.follower_timeout_ms))
        .with_heartbeat_period(Duration::from_millis(args.heartbeat_period_ms));
    let transport = HttpTransport::new(Duration::from_millis(args.rpc_timeout_ms));
    let log = ReplicatedLog::spawn(
        args.id,
        &advertise,
        Box::new(store),
        Box::new(transport),
        options,
    );

    let raft_router = create_router(log.clone());
    let client_router = create_client_router(log.clone());

    let raft_listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .expect("failed to bind cluster listener");
    info!(id = args.id, listen = %args.listen, %advertise, "cluster RPC listening");

    let api_listener = tokio::net::TcpListener::bind(args.api_listen)
        .await
        .expect("failed to bind API listener");
    info!(id = args.id, api_listen = %args.api_listen, "client API listening");

    let (raft_result, api_result) = futures::future::join(
        async { axum::serve(raft_listener, raft_router).await },
        async { axum::serve(api_listener, client_router).await },
    )
    .await;
    raft_result.expect("cluster RPC server failed");
    api_result.expect("client API server failed");
}
