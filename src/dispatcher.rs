use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::docker;
use crate::message::Message;
use crate::Agent;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerOperation {
    #[serde(default)]
    container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStreamRequest {
    #[serde(default)]
    container_id: String,
    #[serde(default)]
    tail: i64,
}

impl Agent {
    /// Subject → handler table. Unknown subjects are logged and discarded.
    pub(crate) async fn dispatch(&self, msg: Message) {
        match msg.subject.as_str() {
            // Handshake and heartbeat acks are handled by the reply inbox
            // or need no action.
            "agent.register.success" | "agent.auth.success" | "agent.heartbeat.ack" => {}

            "container.list" => self.handle_container_list(msg).await,
            "container.start" => self.handle_container_start(msg).await,
            "container.stop" => self.handle_container_stop(msg).await,
            "container.restart" => self.handle_container_restart(msg).await,
            "container.metrics" => self.handle_container_metrics(msg).await,

            "log.stream.start" => self.handle_log_stream_start(msg).await,
            "log.stream.stop" => self.handle_log_stream_stop(msg).await,

            "server.create" => self.handle_server_create(msg).await,
            "server.delete" => self.handle_server_delete(msg).await,
            "server.rebuild" => self.handle_server_rebuild(msg).await,
            "server.adopt" => self.handle_server_adopt(msg).await,
            "server.inspect" => self.handle_server_inspect(msg).await,
            "server.checkdata" => self.handle_server_check_data(msg).await,
            "server.getdatapath" => self.handle_server_get_data_path(msg).await,
            "server.volumesizes" => self.handle_server_volume_sizes(msg).await,
            "server.movedata" => self.handle_server_move_data(msg).await,

            "port.check" => self.handle_port_check(msg).await,

            "rcon.connect" => self.handle_rcon_connect(msg).await,
            "rcon.command" => self.handle_rcon_command(msg).await,
            "rcon.disconnect" => self.handle_rcon_disconnect(msg).await,

            "images.inspect" => self.handle_image_inspect(msg).await,

            "backup.create" => self.handle_backup_create(msg).await,
            "backup.list" => self.handle_backup_list(msg).await,
            "backup.delete" => self.handle_backup_delete(msg).await,
            "backup.restore" => self.handle_backup_restore(msg).await,

            "agent.logs.subscribe" => self.handle_agent_logs_subscribe(msg).await,
            "agent.logs.unsubscribe" => self.handle_agent_logs_unsubscribe(msg).await,

            "agent.update" => {
                let version = msg
                    .data
                    .get("version")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                if let Some(updater) = &self.updater {
                    updater.clone().trigger_update(version);
                }
            }

            "error" => {
                let message = msg
                    .data
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                warn!("Error from manager: {}", message);
            }

            other => warn!("Unknown message subject: {}", other),
        }
    }

    // ==================== Container operations ====================

    async fn send_container_success(&self, container_id: &str, operation: &str, reply: &str) {
        let subject = if reply.is_empty() { "container.operation.success" } else { reply };
        let response = Message::new(
            subject,
            json!({
                "success": true,
                "containerId": container_id,
                "operation": operation,
            }),
        );
        let _ = self.send_message(response).await;
    }

    async fn send_container_error(
        &self,
        container_id: &str,
        operation: &str,
        error: &str,
        error_code: &str,
        reply: &str,
    ) {
        let subject = if reply.is_empty() { "container.operation.error" } else { reply };
        let response = Message::new(
            subject,
            json!({
                "success": false,
                "containerId": container_id,
                "operation": operation,
                "error": error,
                "errorCode": error_code,
            }),
        );
        let _ = self.send_message(response).await;
    }

    async fn handle_container_list(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_container_error("", "list", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };

        let containers = match docker.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Failed to list containers: {}", e);
                self.send_container_error("", "list", &e.to_string(), "DOCKER_LIST_FAILED", &reply)
                    .await;
                return;
            }
        };

        debug!("Listed {} containers", containers.len());
        let response = Message::new(
            msg.reply_subject("container.list.response"),
            json!({
                "containers": containers,
                "count": containers.len(),
            }),
        );
        let _ = self.send_message(response).await;
    }

    async fn handle_container_start(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_container_error("", "start", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };
        let op: ContainerOperation = match msg.parse_data() {
            Ok(op) => op,
            Err(_) => {
                self.send_container_error("", "start", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        match docker.start_container(&op.container_id).await {
            Ok(()) => self.send_container_success(&op.container_id, "start", &reply).await,
            Err(e) => {
                warn!("Failed to start container {}: {}", op.container_id, e);
                self.send_container_error(&op.container_id, "start", &e.to_string(), "DOCKER_START_FAILED", &reply)
                    .await;
            }
        }
    }

    async fn handle_container_stop(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_container_error("", "stop", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };
        let op: ContainerOperation = match msg.parse_data() {
            Ok(op) => op,
            Err(_) => {
                self.send_container_error("", "stop", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        match docker.stop_container(&op.container_id).await {
            Ok(()) => self.send_container_success(&op.container_id, "stop", &reply).await,
            Err(e) => {
                warn!("Failed to stop container {}: {}", op.container_id, e);
                self.send_container_error(&op.container_id, "stop", &e.to_string(), "DOCKER_STOP_FAILED", &reply)
                    .await;
            }
        }
    }

    async fn handle_container_restart(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_container_error("", "restart", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };
        let op: ContainerOperation = match msg.parse_data() {
            Ok(op) => op,
            Err(_) => {
                self.send_container_error("", "restart", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        match docker.restart_container(&op.container_id).await {
            Ok(()) => self.send_container_success(&op.container_id, "restart", &reply).await,
            Err(e) => {
                warn!("Failed to restart container {}: {}", op.container_id, e);
                self.send_container_error(&op.container_id, "restart", &e.to_string(), "DOCKER_RESTART_FAILED", &reply)
                    .await;
            }
        }
    }

    async fn handle_container_metrics(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_container_error("", "metrics", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };
        let op: ContainerOperation = match msg.parse_data() {
            Ok(op) => op,
            Err(_) => {
                self.send_container_error("", "metrics", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };
        if op.container_id.is_empty() {
            self.send_container_error("", "metrics", "Container ID is required", "MISSING_CONTAINER_ID", &reply)
                .await;
            return;
        }

        debug!("Collecting metrics for container: {}", op.container_id);
        match docker.collect_container_metrics(&op.container_id).await {
            Ok(metrics) => {
                let response = Message::new(msg.reply_subject("container.metrics.response"), metrics);
                let _ = self.send_message(response).await;
            }
            Err(e) => {
                warn!("Failed to collect metrics for container {}: {}", op.container_id, e);
                self.send_container_error(
                    &op.container_id,
                    "metrics",
                    &e.to_string(),
                    "METRICS_COLLECTION_FAILED",
                    &reply,
                )
                .await;
            }
        }
    }

    // ==================== Container log streaming ====================

    async fn send_log_stream_error(&self, container_id: &str, error: &str, error_code: &str, reply: &str) {
        let subject = if reply.is_empty() { "log.stream.error" } else { reply };
        let response = Message::new(
            subject,
            json!({
                "success": false,
                "containerId": container_id,
                "error": error,
                "errorCode": error_code,
            }),
        );
        let _ = self.send_message(response).await;
    }

    /// Start a per-container follower. Idempotent per container id:
    /// a duplicate start is refused.
    async fn handle_log_stream_start(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let Some(docker) = self.docker.clone() else {
            self.send_log_stream_error("", "Docker client not initialized", "DOCKER_NOT_AVAILABLE", &reply)
                .await;
            return;
        };
        let mut req: LogStreamRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_log_stream_error("", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };
        if req.tail == 0 {
            req.tail = 1000;
        }

        // Check and register under one lock so a duplicate start can never
        // race past the idempotence guard.
        {
            let mut streams = self.log_streams.write().await;
            if streams.contains_key(&req.container_id) {
                drop(streams);
                self.send_log_stream_error(
                    &req.container_id,
                    "Already streaming logs for this container",
                    "ALREADY_STREAMING",
                    &reply,
                )
                .await;
                return;
            }

            let task = {
                let agent = self.clone();
                let container_id = req.container_id.clone();
                tokio::spawn(async move {
                    let mut stream = docker.follow_logs(&container_id, req.tail);
                    while let Some(frame) = stream.next().await {
                        match frame {
                            Ok(output) => {
                                let line = docker::log_output_line(&container_id, output);
                                if agent.send_message(Message::new("log.line", line)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Log streaming error for {}: {}", container_id, e);
                                agent
                                    .send_log_stream_error(&container_id, &e.to_string(), "DOCKER_LOG_FAILED", "")
                                    .await;
                                break;
                            }
                        }
                    }
                    agent.log_streams.write().await.remove(&container_id);
                    info!("Stopped log stream for container: {}", container_id);
                })
            };
            streams.insert(req.container_id.clone(), task);
        }

        info!(
            "Starting log stream for container: {} (tail: {})",
            req.container_id, req.tail
        );

        if !reply.is_empty() {
            let ack = Message::new(
                reply,
                json!({
                    "success": true,
                    "containerId": req.container_id,
                    "message": "Log streaming started",
                }),
            );
            let _ = self.send_message(ack).await;
        }
    }

    async fn handle_log_stream_stop(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let req: LogStreamRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_log_stream_error("", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        let task = { self.log_streams.write().await.remove(&req.container_id) };
        let Some(task) = task else {
            self.send_log_stream_error(
                &req.container_id,
                "No active log stream for this container",
                "NOT_STREAMING",
                &reply,
            )
            .await;
            return;
        };
        task.abort();
        info!("Stopped log stream for container: {}", req.container_id);

        if !reply.is_empty() {
            let ack = Message::new(
                reply,
                json!({
                    "success": true,
                    "containerId": req.container_id,
                    "message": "Log streaming stopped",
                }),
            );
            let _ = self.send_message(ack).await;
        }
    }

    // ==================== Port checks ====================

    async fn handle_port_check(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }
        let Some(docker) = self.docker.clone() else {
            let _ = self
                .send_message(Message::new(
                    reply,
                    json!({"success": false, "error": "Docker client not initialized"}),
                ))
                .await;
            return;
        };

        let req: crate::ports::PortCheckRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": "Invalid port check request format"}),
                    ))
                    .await;
                return;
            }
        };

        debug!("Checking port availability for ports: {:?}", req.ports);
        match docker.check_port_availability(&req.ports).await {
            Ok(availability) => {
                debug!(
                    "Port check complete: {} available, {} unavailable",
                    availability.available.len(),
                    availability.unavailable.len()
                );
                let _ = self.send_message(Message::new(reply, availability)).await;
            }
            Err(e) => {
                warn!("Failed to check port availability: {}", e);
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": format!("Port check failed: {e}")}),
                    ))
                    .await;
            }
        }
    }

    // ==================== RCON ====================

    async fn send_rcon_error(&self, session_id: &str, error: &str, error_code: &str, reply: &str) {
        let subject = if reply.is_empty() { "rcon.error" } else { reply };
        let response = Message::new(
            subject,
            json!({
                "success": false,
                "sessionId": session_id,
                "error": error,
                "errorCode": error_code,
            }),
        );
        let _ = self.send_message(response).await;
    }

    async fn handle_rcon_connect(&self, msg: Message) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RconConnectRequest {
            #[serde(default)]
            server_id: String,
            #[serde(default)]
            container_id: String,
            #[serde(default)]
            port: u16,
            #[serde(default)]
            password: String,
        }

        let reply = msg.reply.clone().unwrap_or_default();
        let Some(rcon) = self.rcon.clone() else {
            self.send_rcon_error("", "RCON manager not available", "RCON_CONNECT_FAILED", &reply)
                .await;
            return;
        };
        let req: RconConnectRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_rcon_error("", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };
        if req.container_id.is_empty() {
            self.send_rcon_error("", "containerID is required", "INVALID_REQUEST", &reply)
                .await;
            return;
        }

        match rcon
            .connect(&req.server_id, &req.container_id, req.port, &req.password)
            .await
        {
            Ok(session_id) => {
                let response = Message::new(
                    msg.reply_subject("rcon.connect.response"),
                    json!({"success": true, "sessionId": session_id}),
                );
                let _ = self.send_message(response).await;
            }
            Err(e) => {
                warn!(
                    "[RCON] Connection failed for container {}: {}",
                    crate::rcon::short_id(&req.container_id),
                    e
                );
                self.send_rcon_error("", &e.to_string(), "RCON_CONNECT_FAILED", &reply).await;
            }
        }
    }

    async fn handle_rcon_command(&self, msg: Message) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RconCommandRequest {
            #[serde(default)]
            session_id: String,
            #[serde(default)]
            command: String,
        }

        let reply = msg.reply.clone().unwrap_or_default();
        let Some(rcon) = self.rcon.clone() else {
            self.send_rcon_error("", "RCON manager not available", "RCON_COMMAND_FAILED", &reply)
                .await;
            return;
        };
        let req: RconCommandRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_rcon_error("", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        match rcon.execute(&req.session_id, &req.command).await {
            Ok(response) => {
                let response = Message::new(
                    msg.reply_subject("rcon.command.response"),
                    json!({"success": true, "response": response}),
                );
                let _ = self.send_message(response).await;
            }
            Err(e) => {
                warn!("RCON command failed: {}", e);
                self.send_rcon_error(&req.session_id, &e.to_string(), "RCON_COMMAND_FAILED", &reply)
                    .await;
            }
        }
    }

    async fn handle_rcon_disconnect(&self, msg: Message) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RconDisconnectRequest {
            #[serde(default)]
            session_id: String,
        }

        let reply = msg.reply.clone().unwrap_or_default();
        let Some(rcon) = self.rcon.clone() else {
            self.send_rcon_error("", "RCON manager not available", "RCON_DISCONNECT_FAILED", &reply)
                .await;
            return;
        };
        let req: RconDisconnectRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(_) => {
                self.send_rcon_error("", "Invalid request format", "INVALID_REQUEST", &reply)
                    .await;
                return;
            }
        };

        match rcon.disconnect(&req.session_id).await {
            Ok(()) => {
                // Fire-and-forget unless the requester asked for an ack.
                if !reply.is_empty() {
                    let _ = self.send_message(Message::new(reply, json!({"success": true}))).await;
                }
            }
            Err(e) => {
                warn!("RCON disconnect failed: {}", e);
                self.send_rcon_error(&req.session_id, &e.to_string(), "RCON_DISCONNECT_FAILED", &reply)
                    .await;
            }
        }
    }

    // ==================== Image inspection ====================

    async fn handle_image_inspect(&self, msg: Message) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ImageInspectRequest {
            #[serde(default)]
            image_tag: String,
            /// When set, remote tags for this registry ride along in the
            /// response.
            #[serde(default)]
            registry: String,
        }

        let reply = msg.reply.clone().unwrap_or_default();
        if reply.is_empty() {
            return;
        }
        let Some(docker) = self.docker.clone() else {
            let _ = self
                .send_message(Message::new(
                    reply,
                    json!({"success": false, "error": "Docker client not initialized"}),
                ))
                .await;
            return;
        };

        let req: ImageInspectRequest = match msg.parse_data() {
            Ok(req) => req,
            Err(e) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": format!("Invalid request: {e}")}),
                    ))
                    .await;
                return;
            }
        };
        if req.image_tag.is_empty() {
            let _ = self
                .send_message(Message::new(reply, json!({"success": false, "error": "imageTag is required"})))
                .await;
            return;
        }

        info!("Inspecting image for defaults: {}", req.image_tag);
        match docker.get_image_defaults(&req.image_tag).await {
            Ok(defaults) => {
                let mut response = json!({"success": true, "defaults": defaults});
                if !req.registry.is_empty() {
                    match docker::list_registry_tags(&req.registry).await {
                        Ok(tags) => {
                            response["tags"] = json!(tags);
                        }
                        Err(e) => warn!("Failed to list registry tags for {}: {}", req.registry, e),
                    }
                }
                let _ = self.send_message(Message::new(reply, response)).await;
            }
            Err(e) => {
                let _ = self
                    .send_message(Message::new(
                        reply,
                        json!({"success": false, "error": format!("Failed to inspect image: {e}")}),
                    ))
                    .await;
            }
        }
    }

    // ==================== Agent self-logs ====================

    /// Ship history first, then stream live lines until unsubscribe or
    /// disconnect.
    async fn handle_agent_logs_subscribe(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let mut subscription = self.agent_log_sub.lock().await;

        if subscription.is_some() {
            info!("Agent logs: Already streaming to manager");
            if !reply.is_empty() {
                let _ = self
                    .send_message(Message::new(reply, json!({"success": true, "message": "Already subscribed"})))
                    .await;
            }
            return;
        }

        #[derive(Deserialize)]
        struct SubscribeRequest {
            #[serde(default)]
            tail: usize,
        }
        let tail = msg.parse_data::<SubscribeRequest>().map(|r| r.tail).unwrap_or(0);
        let tail = if tail == 0 { 500 } else { tail };

        info!("Agent logs: Starting stream (tail: {})", tail);

        let history = self.log_capture.history(tail);
        if !history.is_empty() {
            let _ = self
                .send_message(Message::new("agent.logs.history", json!({"lines": history})))
                .await;
        }

        let (id, mut rx) = self.log_capture.subscribe();
        let task = {
            let agent = self.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if agent
                        .send_message(Message::new("agent.logs.line", line))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                debug!("Agent logs: Stream ended");
            })
        };
        *subscription = Some((id, task));

        if !reply.is_empty() {
            let _ = self
                .send_message(Message::new(
                    reply,
                    json!({
                        "success": true,
                        "message": "Subscribed to agent logs",
                        "history": history.len(),
                    }),
                ))
                .await;
        }
    }

    async fn handle_agent_logs_unsubscribe(&self, msg: Message) {
        let reply = msg.reply.clone().unwrap_or_default();
        let mut subscription = self.agent_log_sub.lock().await;

        let Some((id, task)) = subscription.take() else {
            info!("Agent logs: Not currently streaming");
            if !reply.is_empty() {
                let _ = self
                    .send_message(Message::new(reply, json!({"success": true, "message": "Not subscribed"})))
                    .await;
            }
            return;
        };

        info!("Agent logs: Stopping stream");
        self.log_capture.unsubscribe(id);
        task.abort();

        if !reply.is_empty() {
            let _ = self
                .send_message(Message::new(
                    reply,
                    json!({"success": true, "message": "Unsubscribed from agent logs"}),
                ))
                .await;
        }
    }

    /// Reset per-connection subscriptions when the session drops so a fresh
    /// subscribe after reconnect starts cleanly.
    pub(crate) async fn cleanup_on_disconnect(&self) {
        let mut subscription = self.agent_log_sub.lock().await;
        if let Some((id, task)) = subscription.take() {
            info!("Agent logs: Cleaning up stream on disconnect");
            self.log_capture.unsubscribe(id);
            task.abort();
        }
    }
}
