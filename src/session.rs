use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::message::Message;
use crate::state::AlertConfig;
use crate::{alert, Agent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWrite = SplitSink<WsStream, WsMessage>;
type WsRead = SplitStream<WsStream>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Auth retries back off further: at the cap that is ~288 requests/day.
const MAX_AUTH_BACKOFF: Duration = Duration::from_secs(5 * 60);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Continuous failure beyond this fires the single per-outage alert.
const OUTAGE_ALERT_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Tracks one outage: when it started and whether the alert already fired.
#[derive(Default)]
pub struct OutageState {
    since: Option<Instant>,
    alerted: bool,
}

/// Handshake failures split into two retry policies: explicit rejection
/// stops the agent, everything else retries with backoff.
enum AuthFailure {
    Fatal(String),
    Transient(String),
}

impl Agent {
    /// Serialise an envelope and write it under the single writer lock.
    /// Fails with connection-not-ready when no connection exists.
    pub async fn send_message(&self, msg: Message) -> AgentResult<()> {
        let writer = { self.write.read().await.clone() };
        let Some(writer) = writer else {
            return Err(AgentError::NetworkError("connection not ready".into()));
        };

        let text = serde_json::to_string(&msg)?;
        let mut guard = writer.lock().await;
        guard.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }

    pub async fn agent_id(&self) -> String {
        self.agent_id.read().await.clone()
    }

    /// Run the session until shutdown or a fatal auth failure.
    pub async fn run_with_reconnect(&self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        let mut transient_retries = 0u64;
        let mut auth_backoff = INITIAL_BACKOFF;
        let mut first_failure = Instant::now();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let ws = tokio::select! {
                ws = self.connect_with_retry() => ws?,
                _ = shutdown.changed() => return Ok(()),
            };

            let (write, read) = ws.split();
            {
                let mut slot = self.write.write().await;
                *slot = Some(Arc::new(Mutex::new(write)));
            }

            let reader = {
                let agent = self.clone();
                tokio::spawn(async move { agent.reader_loop(read).await })
            };

            match self.register().await {
                Err(AuthFailure::Transient(reason)) => {
                    reader.abort();
                    self.cleanup_connection().await;

                    transient_retries += 1;
                    if transient_retries == 1 {
                        first_failure = Instant::now();
                    }
                    // Log every attempt for the first 10, then every 5th.
                    if transient_retries <= 10 || transient_retries % 5 == 0 {
                        warn!(
                            "Auth failed (transient), retrying (#{}, backoff {:?}, failing for {:?}): {}",
                            transient_retries,
                            auth_backoff,
                            first_failure.elapsed(),
                            reason
                        );
                    }
                    self.note_session_failure(&reason);

                    tokio::select! {
                        _ = tokio::time::sleep(auth_backoff) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    auth_backoff = (auth_backoff * 2).min(MAX_AUTH_BACKOFF);
                    continue;
                }
                Err(AuthFailure::Fatal(reason)) => {
                    reader.abort();
                    self.cleanup_connection().await;

                    error!("");
                    error!("========================================");
                    error!("AUTHENTICATION FAILED - AGENT STOPPING");
                    error!("========================================");
                    error!("Error: {}", reason);
                    error!("");
                    error!("Possible causes:");
                    error!("  - Agent was deleted from the manager");
                    error!("  - Token is invalid or expired");
                    error!("  - Agent name mismatch");
                    error!("");
                    error!("To fix:");
                    error!("  1. Generate a new token in the manager UI");
                    error!("  2. Re-run the install script with --token");
                    error!("  3. Restart the agent service");
                    error!("========================================");
                    return Err(AgentError::AuthRejected(reason));
                }
                Ok(()) => {}
            }

            transient_retries = 0;
            auth_backoff = INITIAL_BACKOFF;
            self.set_authenticated(true);
            self.note_session_recovery().await;
            info!("Agent authenticated successfully");

            let heartbeat = {
                let agent = self.clone();
                tokio::spawn(async move { agent.heartbeat_loop().await })
            };

            tokio::select! {
                _ = reader => {
                    heartbeat.abort();
                    self.cleanup_connection().await;
                    info!("Connection lost, reconnecting...");
                    tokio::time::sleep(INITIAL_BACKOFF).await;
                }
                _ = shutdown.changed() => {
                    heartbeat.abort();
                    info!("Shutting down...");
                    // Send the close frame under the writer lock, then drop
                    // the transport.
                    let writer = { self.write.read().await.clone() };
                    if let Some(writer) = writer {
                        let mut guard = writer.lock().await;
                        if let Err(e) = guard.send(WsMessage::Close(None)).await {
                            warn!("Error sending close message: {}", e);
                        }
                        let _ = guard.close().await;
                    }
                    self.cleanup_connection().await;
                    return Ok(());
                }
            }
        }
    }

    /// Dial the manager with exponential backoff, resetting on success.
    async fn connect_with_retry(&self) -> AgentResult<WsStream> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u64;

        // The name query parameter routes the session to a stable shard.
        let separator = if self.manager_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}name={}", self.manager_url, separator, self.agent_name);

        loop {
            attempt += 1;
            debug!("Connection attempt #{} (backoff: {:?})", attempt, backoff);

            match connect_async(&url).await {
                Ok((ws, _)) => {
                    info!("WebSocket connection established");
                    return Ok(ws);
                }
                Err(e) => {
                    warn!("Connection failed: {}", e);
                    self.note_session_failure(&e.to_string());
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Register with the ephemeral token or authenticate with the permanent
    /// one. The reader loop is already pumping; responses arrive through
    /// the reply inbox.
    async fn register(&self) -> Result<(), AuthFailure> {
        let permanent = { self.permanent_token.read().await.clone() };

        let (success_subject, request) = if !permanent.is_empty() {
            info!("Authenticating with permanent token...");
            (
                "agent.auth.success",
                Message::new("agent.auth", json!({"token": permanent})),
            )
        } else {
            info!("Registering with ephemeral token...");
            (
                "agent.register.success",
                Message::new(
                    "agent.register",
                    json!({"token": self.ephemeral_token, "agentName": self.agent_name}),
                ),
            )
        };

        let success_rx = self.inbox.register(success_subject);
        let error_rx = self.inbox.register("error");

        if let Err(e) = self.send_message(request).await {
            self.inbox.cancel(success_subject);
            self.inbox.cancel("error");
            return Err(AuthFailure::Transient(format!("failed to send handshake: {e}")));
        }

        let outcome = tokio::select! {
            result = success_rx => match result {
                Ok(msg) => Ok(msg),
                Err(_) => Err(AuthFailure::Transient("connection closed during handshake".into())),
            },
            result = error_rx => match result {
                Ok(msg) => {
                    let reason = msg.data.get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("manager rejected credentials")
                        .to_string();
                    Err(AuthFailure::Fatal(reason))
                }
                Err(_) => Err(AuthFailure::Transient("connection closed during handshake".into())),
            },
            _ = tokio::time::sleep(AUTH_TIMEOUT) => {
                Err(AuthFailure::Transient("handshake timeout".into()))
            }
        };
        self.inbox.cancel(success_subject);
        self.inbox.cancel("error");
        let msg = outcome?;

        let agent_id = msg
            .data
            .get("agentId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        {
            let mut guard = self.agent_id.write().await;
            *guard = agent_id.clone();
        }

        if success_subject == "agent.register.success" {
            let token = msg
                .data
                .get("token")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if token.is_empty() {
                return Err(AuthFailure::Transient("registration response missing token".into()));
            }
            if let Err(e) = self.state.save_token(&token) {
                return Err(AuthFailure::Transient(format!("failed to save token: {e}")));
            }
            // The ephemeral token is consumed exactly once.
            let _ = self.state.delete_ephemeral_token();
            {
                let mut guard = self.permanent_token.write().await;
                *guard = token;
            }
            info!("Registration successful! Agent ID: {}", agent_id);
            info!("Permanent token saved to {}", self.state.token_path().display());
        } else {
            info!("Authentication successful! Agent ID: {}", agent_id);
        }

        // The manager may attach a fresh alert config to the auth response;
        // cache it so alerts work while the manager is unreachable.
        if let Some(value) = msg.data.get("alertConfig") {
            match serde_json::from_value::<AlertConfig>(value.clone()) {
                Ok(config) => {
                    if let Err(e) = self.state.save_alert_config(&config) {
                        warn!("Failed to cache alert config: {}", e);
                    }
                    let mut guard = self.alert_config.write().await;
                    *guard = Some(config);
                }
                Err(e) => warn!("Failed to parse alert config from auth response: {}", e),
            }
        }

        Ok(())
    }

    /// Pump inbound envelopes: the reply inbox gets first refusal, the rest
    /// are dispatched concurrently.
    async fn reader_loop(&self, mut read: WsRead) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    let msg: Message = match serde_json::from_str(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Failed to parse inbound message: {}", e);
                            continue;
                        }
                    };
                    debug!("Received: {}", msg.subject);

                    if self.inbox.resolve(&msg) {
                        continue;
                    }

                    let agent = self.clone();
                    tokio::spawn(async move { agent.dispatch(msg).await });
                }
                Ok(WsMessage::Close(_)) => {
                    info!("Manager closed connection");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    return;
                }
            }
        }
    }

    /// Every 30 s while authenticated: heartbeat with a best-effort host
    /// metrics snapshot. Missing metrics never suppress the heartbeat.
    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;

            let agent_id = self.agent_id().await;
            let metrics = {
                let mut collector = self.host_metrics.lock().await;
                collector.collect(self.docker.as_deref()).await
            };

            let msg = match metrics {
                Ok(metrics) => {
                    debug!(
                        "Heartbeat with metrics (CPU: {:.1}%, Mem: {}MB/{}MB, {} disk(s))",
                        metrics.cpu_percent,
                        metrics.memory_used_mb,
                        metrics.memory_total_mb,
                        metrics.disks.len()
                    );
                    Message::new("agent.heartbeat", json!({"agentId": agent_id, "metrics": metrics}))
                }
                Err(e) => {
                    warn!("Failed to collect metrics: {}", e);
                    Message::new("agent.heartbeat", json!({"agentId": agent_id}))
                }
            };

            if let Err(e) = self.send_message(msg).await {
                warn!("Failed to send heartbeat: {}", e);
                return;
            }
        }
    }

    /// Reset per-connection state so a reconnect starts clean.
    async fn cleanup_connection(&self) {
        {
            let mut slot = self.write.write().await;
            *slot = None;
        }
        self.set_authenticated(false);
        self.inbox.clear();
        self.cleanup_on_disconnect().await;
    }

    /// Record a connect/auth failure; fire the one alert per outage once
    /// the threshold is crossed.
    fn note_session_failure(&self, reason: &str) {
        let fire = {
            let mut outage = self.outage.lock().unwrap_or_else(|e| e.into_inner());
            let since = *outage.since.get_or_insert_with(Instant::now);
            if !outage.alerted && since.elapsed() >= OUTAGE_ALERT_THRESHOLD {
                outage.alerted = true;
                Some(since.elapsed().as_secs() as i64 / 60)
            } else {
                None
            }
        };

        if let Some(minutes) = fire {
            let agent_name = self.agent_name.clone();
            let reason = reason.to_string();
            let alert_config = self.alert_config.clone();
            tokio::spawn(async move {
                let config = { alert_config.read().await.clone() };
                if let Some(config) = config {
                    alert::send_alert_email(&config, &agent_name, &reason, minutes).await;
                }
            });
        }
    }

    /// Record a successful authentication; send the recovery message when
    /// an alert had fired for this outage.
    async fn note_session_recovery(&self) {
        let downtime = {
            let mut outage = self.outage.lock().unwrap_or_else(|e| e.into_inner());
            let downtime = outage
                .alerted
                .then(|| outage.since.map(|s| s.elapsed().as_secs() as i64 / 60))
                .flatten();
            *outage = OutageState::default();
            downtime
        };

        if let Some(minutes) = downtime {
            let agent_name = self.agent_name.clone();
            let config = { self.alert_config.read().await.clone() };
            if let Some(config) = config {
                alert::send_recovery_email(&config, &agent_name, minutes).await;
            }
        }
    }
}
