use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::docker::DockerClient;
use crate::errors::{AgentError, AgentResult};

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;
const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// Sessions idle longer than this are closed by the sweeper.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Dial timeout for explicit manager-driven sessions.
pub const SESSION_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Dial timeout for pre-stop/pre-backup saves.
pub const SAVE_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A single Source-RCON connection: authenticate once, then request/response
/// text commands over TCP.
pub struct RconConnection {
    stream: TcpStream,
    next_id: i32,
}

impl RconConnection {
    /// Dial `addr` and authenticate with `password` within `timeout`.
    pub async fn connect(addr: &str, password: &str, timeout: Duration) -> AgentResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AgentError::RconError(format!("dial timeout connecting to {addr}")))?
            .map_err(|e| AgentError::RconError(format!("failed to connect to {addr}: {e}")))?;

        let mut conn = Self { stream, next_id: 0 };
        tokio::time::timeout(timeout, conn.authenticate(password))
            .await
            .map_err(|_| AgentError::RconError(format!("auth timeout for {addr}")))??;
        Ok(conn)
    }

    async fn authenticate(&mut self, password: &str) -> AgentResult<()> {
        let auth_id = self.send_packet(SERVERDATA_AUTH, password).await?;

        // Some servers send an empty RESPONSE_VALUE before the auth reply.
        loop {
            let (id, packet_type, _) = self.read_packet().await?;
            if packet_type == SERVERDATA_AUTH_RESPONSE {
                if id == -1 {
                    return Err(AgentError::RconError("authentication refused (bad password)".into()));
                }
                if id != auth_id {
                    return Err(AgentError::RconError("authentication response id mismatch".into()));
                }
                return Ok(());
            }
            if packet_type != SERVERDATA_RESPONSE_VALUE {
                return Err(AgentError::RconError(format!(
                    "unexpected packet type {packet_type} during auth"
                )));
            }
        }
    }

    /// Send a command and return the server's text response.
    pub async fn execute(&mut self, command: &str) -> AgentResult<String> {
        let id = self.send_packet(SERVERDATA_EXECCOMMAND, command).await?;
        let (resp_id, packet_type, body) = self.read_packet().await?;
        if packet_type != SERVERDATA_RESPONSE_VALUE || resp_id != id {
            return Err(AgentError::RconError(format!(
                "unexpected response (id {resp_id}, type {packet_type}) to command"
            )));
        }
        Ok(body)
    }

    async fn send_packet(&mut self, packet_type: i32, body: &str) -> AgentResult<i32> {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;

        let frame = encode_packet(id, packet_type, body);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| AgentError::RconError(format!("write failed: {e}")))?;
        Ok(id)
    }

    async fn read_packet(&mut self) -> AgentResult<(i32, i32, String)> {
        let mut size_buf = [0u8; 4];
        self.stream
            .read_exact(&mut size_buf)
            .await
            .map_err(|e| AgentError::RconError(format!("read failed: {e}")))?;
        let size = i32::from_le_bytes(size_buf);
        if !(10..=4106).contains(&size) {
            return Err(AgentError::RconError(format!("invalid packet size {size}")));
        }

        let mut payload = vec![0u8; size as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| AgentError::RconError(format!("read failed: {e}")))?;

        decode_packet(&payload)
    }
}

/// Frame a packet: little-endian size prefix, id, type, NUL-terminated body
/// plus the trailing empty-string terminator.
fn encode_packet(id: i32, packet_type: i32, body: &str) -> Vec<u8> {
    let size = (body.len() + 10) as i32;
    let mut frame = Vec::with_capacity(body.len() + 14);
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&packet_type.to_le_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame
}

/// Decode a packet payload (everything after the size prefix).
fn decode_packet(payload: &[u8]) -> AgentResult<(i32, i32, String)> {
    if payload.len() < 10 {
        return Err(AgentError::RconError("short packet".into()));
    }
    let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let packet_type = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let body = String::from_utf8_lossy(&payload[8..payload.len() - 2]).to_string();
    Ok((id, packet_type, body))
}

struct SessionEntry {
    server_id: String,
    conn: Arc<Mutex<RconConnection>>,
    created_at: Instant,
    last_used: Instant,
}

/// Pooled, idle-expired RCON sessions keyed by session id. Connections are
/// made to the container's address on the backend bridge network.
pub struct RconManager {
    docker: Arc<DockerClient>,
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RconManager {
    pub fn new(docker: Arc<DockerClient>) -> Arc<Self> {
        let manager = Arc::new(Self {
            docker,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sweeper: Mutex::new(None),
        });

        let sessions = manager.sessions.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let mut guard = sessions.write().await;
                let before = guard.len();
                guard.retain(|session_id, entry| {
                    let keep = entry.last_used.elapsed() <= IDLE_TIMEOUT;
                    if !keep {
                        info!(
                            "[RCON] Auto-disconnect idle session {} (server: {})",
                            session_id, entry.server_id
                        );
                    }
                    keep
                });
                if guard.len() != before {
                    debug!("[RCON] Sweep removed {} idle session(s)", before - guard.len());
                }
            }
        });
        // Stash the sweeper handle so Close can cancel it.
        if let Ok(mut slot) = manager.sweeper.try_lock() {
            *slot = Some(handle);
        }

        manager
    }

    /// Resolve the container's backend-network address, dial, authenticate,
    /// and register a fresh session id.
    pub async fn connect(
        &self,
        server_id: &str,
        container_id: &str,
        port: u16,
        password: &str,
    ) -> AgentResult<String> {
        let ip = self.docker.backend_ip(container_id).await?;
        let addr = format!("{ip}:{port}");

        info!(
            "[RCON] Connecting to container {} (addr: {})",
            short_id(container_id),
            addr
        );

        let conn = RconConnection::connect(&addr, password, SESSION_DIAL_TIMEOUT).await?;
        let session_id = Uuid::new_v4().to_string();

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.clone(),
            SessionEntry {
                server_id: server_id.to_string(),
                conn: Arc::new(Mutex::new(conn)),
                created_at: Instant::now(),
                last_used: Instant::now(),
            },
        );

        info!("[RCON] Connected to {} (session: {})", addr, session_id);
        Ok(session_id)
    }

    /// Execute a command on an existing session. A failed execution evicts
    /// the session so the next call re-establishes it.
    pub async fn execute(&self, session_id: &str, command: &str) -> AgentResult<String> {
        let conn = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| AgentError::RconError(format!("session not found: {session_id}")))?;
            entry.last_used = Instant::now();
            entry.conn.clone()
        };

        let result = {
            let mut conn = conn.lock().await;
            conn.execute(command).await
        };

        match result {
            Ok(response) => {
                debug!("[RCON] Executed command '{}' on session {}", command, session_id);
                Ok(response)
            }
            Err(e) => {
                warn!("[RCON] Command failed on session {}, evicting: {}", session_id, e);
                self.sessions.write().await.remove(session_id);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self, session_id: &str) -> AgentResult<()> {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(entry) => {
                info!(
                    "[RCON] Disconnected session {} (alive for {:?})",
                    session_id,
                    entry.created_at.elapsed()
                );
                Ok(())
            }
            None => Err(AgentError::RconError(format!("session not found: {session_id}"))),
        }
    }

    /// Cancel the sweeper and drop every session.
    pub async fn close(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        let mut sessions = self.sessions.write().await;
        for session_id in sessions.keys() {
            info!("[RCON] Closed session {}", session_id);
        }
        sessions.clear();
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

pub fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_encode_layout() {
        let frame = encode_packet(7, SERVERDATA_EXECCOMMAND, "players");
        // size = body(7) + 10
        assert_eq!(&frame[0..4], &17i32.to_le_bytes());
        assert_eq!(&frame[4..8], &7i32.to_le_bytes());
        assert_eq!(&frame[8..12], &SERVERDATA_EXECCOMMAND.to_le_bytes());
        assert_eq!(&frame[12..19], b"players");
        assert_eq!(&frame[19..], &[0, 0]);
    }

    #[test]
    fn packet_decode_roundtrip() {
        let frame = encode_packet(42, SERVERDATA_RESPONSE_VALUE, "Players connected: 0");
        let (id, packet_type, body) = decode_packet(&frame[4..]).unwrap();
        assert_eq!(id, 42);
        assert_eq!(packet_type, SERVERDATA_RESPONSE_VALUE);
        assert_eq!(body, "Players connected: 0");
    }

    #[test]
    fn decode_rejects_short_packets() {
        assert!(decode_packet(&[0, 0, 0]).is_err());
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
    }

    #[tokio::test]
    async fn connection_against_mock_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Auth request
            let mut size = [0u8; 4];
            socket.read_exact(&mut size).await.unwrap();
            let mut payload = vec![0u8; i32::from_le_bytes(size) as usize];
            socket.read_exact(&mut payload).await.unwrap();
            let (id, packet_type, body) = decode_packet(&payload).unwrap();
            assert_eq!(packet_type, SERVERDATA_AUTH);
            assert_eq!(body, "hunter2");
            socket
                .write_all(&encode_packet(id, SERVERDATA_AUTH_RESPONSE, ""))
                .await
                .unwrap();

            // Command
            socket.read_exact(&mut size).await.unwrap();
            let mut payload = vec![0u8; i32::from_le_bytes(size) as usize];
            socket.read_exact(&mut payload).await.unwrap();
            let (id, _, body) = decode_packet(&payload).unwrap();
            assert_eq!(body, "players");
            socket
                .write_all(&encode_packet(id, SERVERDATA_RESPONSE_VALUE, "Players connected: 2"))
                .await
                .unwrap();
        });

        let mut conn = RconConnection::connect(&addr.to_string(), "hunter2", Duration::from_secs(5))
            .await
            .unwrap();
        let response = conn.execute("players").await.unwrap();
        assert_eq!(response, "Players connected: 2");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn bad_password_is_rejected() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut size = [0u8; 4];
            socket.read_exact(&mut size).await.unwrap();
            let mut payload = vec![0u8; i32::from_le_bytes(size) as usize];
            socket.read_exact(&mut payload).await.unwrap();
            socket
                .write_all(&encode_packet(-1, SERVERDATA_AUTH_RESPONSE, ""))
                .await
                .unwrap();
        });

        let result = RconConnection::connect(&addr.to_string(), "wrong", Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}
