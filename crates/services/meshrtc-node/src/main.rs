//! Mesh node binary entry point
//!
//! Joins the signaling service, connects to every other registered node and
//! broadcasts a heartbeat on all open data channels.
//!
//! # Usage
//!
//! ```bash
//! # Static bearer token
//! cargo run -p meshrtc-node -- \
//!   --role provider \
//!   --signaling-url https://signal.example.com \
//!   --token "$MESH_TOKEN"
//!
//! # Refresh-token flow, persisting rotated refresh tokens
//! cargo run -p meshrtc-node -- \
//!   --role subscriber \
//!   --refresh-token-file ./refresh_token \
//!   --token-refresh-url https://auth.example.com/token
//!
//! # Everything from a TOML file, flags override
//! cargo run -p meshrtc-node -- --config ./mesh.toml --heartbeat-secs 10
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use meshrtc::auth::{self, ClientTokenProvider, StaticTokenProvider, TokenProvider};
use meshrtc::signaling::HttpSignalingClient;
use meshrtc::{MeshConfig, MeshEvent, PeerMesh, Role};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Mesh node
///
/// Keeps a WebRTC data connection to every other node registered with the
/// signaling service and broadcasts a periodic heartbeat.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long, env = "MESH_CONFIG")]
    config: Option<PathBuf>,

    /// Node role reported to signaling
    #[arg(short, long, env = "MESH_ROLE")]
    role: Option<Role>,

    /// Signaling service base URL
    #[arg(long, env = "MESH_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Client identity presented to signaling (random if unset)
    #[arg(long, env = "MESH_CLIENT_ID")]
    client_id: Option<Uuid>,

    /// Static bearer token
    #[arg(long, env = "MESH_TOKEN", conflicts_with = "refresh_token_file")]
    token: Option<String>,

    /// File holding the refresh token; rotated tokens are written back
    #[arg(long, env = "MESH_REFRESH_TOKEN_FILE", requires = "token_refresh_url")]
    refresh_token_file: Option<PathBuf>,

    /// Endpoint exchanging the refresh token for an access token
    #[arg(long, env = "MESH_TOKEN_REFRESH_URL")]
    token_refresh_url: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Option<Vec<String>>,

    /// Answer poll interval in milliseconds
    #[arg(long, env = "MESH_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Heartbeat broadcast interval in seconds, 0 to disable
    #[arg(long, default_value_t = 5, env = "MESH_HEARTBEAT_SECS")]
    heartbeat_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown = CancellationToken::new();
    let shutdown_handler = shutdown.clone();
    let signalled = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler(move || {
        if signalled.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }
        eprintln!("Ctrl+C received, shutting down...");
        shutdown_handler.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("mesh-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown))
}

async fn async_main(args: Args, shutdown: CancellationToken) -> anyhow::Result<()> {
    init_tracing();

    let config = build_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = %config.role,
        signaling_url = %config.signaling.base_url,
        stun_servers = config.ice.stun_servers.len(),
        turn_servers = config.ice.turn_servers.len(),
        poll_interval_ms = config.negotiation.poll_interval_ms,
        "Mesh node starting"
    );

    let tokens = build_token_provider(&args, &config, &shutdown)?;
    let signaling = Arc::new(HttpSignalingClient::new(&config.signaling, tokens)?);

    let (mesh, mut events) = PeerMesh::with_webrtc(config, signaling).await?;
    let client_id = mesh.client_id();
    info!(client_id = %client_id, "Mesh running. Press Ctrl+C to shutdown.");

    let heartbeat_period = (args.heartbeat_secs > 0).then(|| Duration::from_secs(args.heartbeat_secs));
    let mut heartbeat = tokio::time::interval(heartbeat_period.unwrap_or(Duration::from_secs(3600)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = heartbeat.tick(), if heartbeat_period.is_some() => {
                let message = format!("Hello from {} @ {}", client_id, chrono::Utc::now().to_rfc3339());
                let stats = mesh.broadcast(message).await;
                debug!(
                    connections = stats.total_connections,
                    sent = stats.sent_count,
                    failed = stats.failed_count,
                    "Heartbeat sent"
                );
            }
            event = events.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },
        }
    }

    info!("Shutdown signal received, cleaning up...");
    mesh.shutdown().await;
    info!("Mesh node shut down gracefully");

    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if let Some(role) = args.role {
        config.role = role;
    }
    if let Some(url) = &args.signaling_url {
        config.signaling.base_url = url.clone();
    }
    if args.client_id.is_some() {
        config.signaling.client_id = args.client_id;
    }
    if let Some(stun_servers) = &args.stun_servers {
        config.ice.stun_servers = stun_servers.clone();
    }
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.negotiation.poll_interval_ms = poll_interval_ms;
    }

    config.validate()?;
    Ok(config)
}

fn build_token_provider(
    args: &Args,
    config: &MeshConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<Arc<dyn TokenProvider>> {
    let timeout = Duration::from_secs(config.signaling.request_timeout_secs);

    if let Some(token) = &args.token {
        return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
    }

    if let (Some(path), Some(url)) = (&args.refresh_token_file, &args.token_refresh_url) {
        let refresh_token = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read refresh token from {}", path.display()))?;
        let provider = ClientTokenProvider::new(url.clone(), refresh_token.trim(), timeout)?;
        persist_rotated_refresh_tokens(&provider, path.clone(), shutdown.clone());
        return Ok(Arc::new(provider));
    }

    match &config.auth {
        Some(auth_config) => Ok(auth::provider_from_config(auth_config, timeout)?),
        None => bail!("No credentials: pass --token, --refresh-token-file or an [auth] section"),
    }
}

/// Write every rotated refresh token back to `path`
fn persist_rotated_refresh_tokens(
    provider: &ClientTokenProvider,
    path: PathBuf,
    shutdown: CancellationToken,
) {
    let mut rotations = provider.subscribe_refresh_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rotations.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let token = rotations.borrow_and_update().clone();
                    write_refresh_token(&path, &token).await;
                }
            }
        }
    });
}

async fn write_refresh_token(path: &Path, token: &str) {
    match tokio::fs::write(path, token).await {
        Ok(()) => info!(path = %path.display(), "Refresh token rotated"),
        Err(e) => warn!(path = %path.display(), "Failed to persist refresh token: {}", e),
    }
}

fn log_event(event: MeshEvent) {
    match event {
        MeshEvent::ConnectionEstablished { connection } => info!(
            client_id = ?connection.client_id,
            sdp_id = ?connection.sdp_id,
            origin = ?connection.origin,
            "Peer connected"
        ),
        MeshEvent::DataChannelOpened { connection, label } => info!(
            client_id = ?connection.client_id,
            label = %label,
            "Data channel open"
        ),
        MeshEvent::DataReceived {
            connection,
            label,
            data,
        } => info!(
            client_id = ?connection.client_id,
            label = %label,
            "Received: {}",
            String::from_utf8_lossy(&data)
        ),
        MeshEvent::DataChannelClosed { connection, label } => info!(
            client_id = ?connection.client_id,
            label = %label,
            "Data channel closed"
        ),
        MeshEvent::ConnectionClosed { client_id, .. } => {
            info!(client_id = %client_id, "Peer disconnected")
        }
        MeshEvent::NegotiationHalted { reason } => {
            warn!("Negotiation halted: {}", reason)
        }
    }
}

fn init_tracing() {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
