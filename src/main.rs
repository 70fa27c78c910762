use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod alert;
mod backup;
mod collector;
mod dispatcher;
mod docker;
mod errors;
mod logcapture;
mod message;
mod metrics;
mod playerstats;
mod ports;
mod rcon;
mod server;
mod session;
mod state;
mod update;

pub use errors::{AgentError, AgentResult};

use docker::DockerClient;
use logcapture::{CaptureLayer, LogCapture};
use message::ReplyInbox;
use metrics::HostMetricsCollector;
use playerstats::SharedPlayerStats;
use rcon::RconManager;
use server::ServerVolumeSizes;
use session::{OutageState, WsWrite};
use state::{AlertConfig, StateStore};
use update::AutoUpdater;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// EX_CONFIG: auth/configuration error, supervisors must not restart.
const EXIT_CODE_AUTH_FAILURE: i32 = 78;

#[derive(Parser, Debug)]
#[command(name = "zedops-agent", version = VERSION, about = "ZedOps host agent")]
struct Cli {
    /// Manager WebSocket URL (e.g., ws://localhost:8787/ws)
    #[arg(long = "manager-url")]
    manager_url: String,

    /// Ephemeral token for registration (required on first run only)
    #[arg(long)]
    token: Option<String>,

    /// Agent name (default: hostname)
    #[arg(long)]
    name: Option<String>,
}

/// Shared agent state. Cloning is cheap; every field is a handle.
#[derive(Clone)]
pub struct Agent {
    pub manager_url: String,
    pub agent_name: String,
    pub ephemeral_token: String,
    pub state: Arc<StateStore>,
    pub docker: Option<Arc<DockerClient>>,
    pub rcon: Option<Arc<RconManager>>,
    pub log_capture: Arc<LogCapture>,
    pub player_stats: SharedPlayerStats,
    pub(crate) permanent_token: Arc<RwLock<String>>,
    pub(crate) agent_id: Arc<RwLock<String>>,
    pub(crate) write: Arc<RwLock<Option<Arc<Mutex<WsWrite>>>>>,
    pub(crate) authenticated: Arc<AtomicBool>,
    pub(crate) inbox: Arc<ReplyInbox>,
    pub(crate) log_streams: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    pub(crate) agent_log_sub: Arc<Mutex<Option<(u64, JoinHandle<()>)>>>,
    pub(crate) volume_cache: Arc<RwLock<HashMap<String, (ServerVolumeSizes, Instant)>>>,
    pub(crate) host_metrics: Arc<Mutex<HostMetricsCollector>>,
    pub(crate) alert_config: Arc<RwLock<Option<AlertConfig>>>,
    pub(crate) outage: Arc<std::sync::Mutex<OutageState>>,
    pub(crate) updater: Option<Arc<AutoUpdater>>,
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Capture all log output early so agent.logs.* can replay it.
    let log_capture = LogCapture::new(1000);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(CaptureLayer::new(log_capture.clone()))
        .init();

    let agent_name = cli.name.filter(|n| !n.is_empty()).unwrap_or_else(hostname);

    let state = Arc::new(StateStore::new());
    state.migrate_from_legacy_dir();

    let permanent_token = match state.load_token() {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to load token: {}", e);
            std::process::exit(1);
        }
    };
    let ephemeral_token = match cli.token {
        Some(token) if !token.is_empty() => token,
        _ => state.load_ephemeral_token().unwrap_or_default(),
    };

    if permanent_token.is_empty() && ephemeral_token.is_empty() {
        error!("No permanent token found. Provide --token for first-time registration.");
        std::process::exit(1);
    }

    let docker = match DockerClient::new() {
        Ok(client) => {
            info!("Docker client initialized successfully");
            if let Err(e) = client.ensure_networks().await {
                warn!("Failed to ensure Docker networks: {}", e);
                warn!("Server creation may fail if networks are missing");
            }
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("Failed to initialize Docker client: {}", e);
            warn!("Container control features will be unavailable");
            None
        }
    };

    let rcon = docker.as_ref().map(|docker| RconManager::new(docker.clone()));

    let alert_config = state.load_alert_config().unwrap_or_else(|e| {
        warn!("Failed to load cached alert config: {}", e);
        None
    });

    let updater = {
        let mut updater = AutoUpdater::new(&cli.manager_url, VERSION);
        updater.set_before_restart(|| info!("Restarting to apply agent update"));
        Arc::new(updater)
    };

    let agent = Agent {
        manager_url: cli.manager_url,
        agent_name,
        ephemeral_token,
        state,
        docker: docker.clone(),
        rcon: rcon.clone(),
        log_capture,
        player_stats: Arc::new(RwLock::new(HashMap::new())),
        permanent_token: Arc::new(RwLock::new(permanent_token)),
        agent_id: Arc::new(RwLock::new(String::new())),
        write: Arc::new(RwLock::new(None)),
        authenticated: Arc::new(AtomicBool::new(false)),
        inbox: Arc::new(ReplyInbox::new()),
        log_streams: Arc::new(RwLock::new(HashMap::new())),
        agent_log_sub: Arc::new(Mutex::new(None)),
        volume_cache: Arc::new(RwLock::new(HashMap::new())),
        host_metrics: Arc::new(Mutex::new(HostMetricsCollector::new())),
        alert_config: Arc::new(RwLock::new(alert_config)),
        outage: Arc::new(std::sync::Mutex::new(OutageState::default())),
        updater: Some(updater.clone()),
    };

    // Background collectors only make sense with a working engine.
    let mut background: Vec<JoinHandle<()>> = Vec::new();
    if let Some(docker) = &docker {
        background.push(playerstats::spawn(
            agent.clone(),
            docker.clone(),
            agent.player_stats.clone(),
        ));
        background.push(collector::spawn(
            agent.clone(),
            docker.clone(),
            agent.player_stats.clone(),
        ));
    }

    updater.start();

    // Graceful shutdown on SIGINT/SIGTERM.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Received shutdown signal, closing connection...");
        let _ = shutdown_tx.send(true);
    });

    info!("Starting agent: {}", agent.agent_name);
    info!("Manager URL: {}", agent.manager_url);
    info!("Agent version: {}", VERSION);

    let result = agent.run_with_reconnect(shutdown_rx).await;

    for task in background {
        task.abort();
    }
    if let Some(rcon) = rcon {
        rcon.close().await;
    }

    match result {
        Err(AgentError::AuthRejected(_)) => {
            error!(
                "Exiting with code {} (auth failure - supervisor will not restart)",
                EXIT_CODE_AUTH_FAILURE
            );
            std::process::exit(EXIT_CODE_AUTH_FAILURE);
        }
        Err(e) => {
            error!("Agent error: {}", e);
            std::process::exit(1);
        }
        Ok(()) => info!("Agent stopped"),
    }
}
