use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// NATS-inspired message envelope exchanged with the manager.
///
/// A requester that expects an answer sets `reply` to a one-shot subject of
/// its choosing; the responder publishes exactly one message there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn new(subject: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_reply(subject: impl Into<String>, data: impl Serialize, reply: impl Into<String>) -> Self {
        let mut msg = Self::new(subject, data);
        msg.reply = Some(reply.into());
        msg
    }

    /// Deserialize `data` into a typed request payload.
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Subject the response to this message should be published on.
    pub fn reply_subject(&self, fallback: &str) -> String {
        match &self.reply {
            Some(reply) if !reply.is_empty() => reply.clone(),
            _ => fallback.to_string(),
        }
    }
}

/// Correlation registry mapping one-shot subjects to pending waiters.
///
/// The session's reader loop offers every inbound envelope to the inbox
/// before dispatching; a registered waiter consumes the message.
#[derive(Default)]
pub struct ReplyInbox {
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl ReplyInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `subject`. A second registration for the same
    /// subject replaces the first (the old waiter resolves with an error).
    pub fn register(&self, subject: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(subject.to_string(), tx);
        rx
    }

    /// Offer an inbound message. Returns true if a waiter consumed it.
    pub fn resolve(&self, msg: &Message) -> bool {
        let tx = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&msg.subject)
        };
        match tx {
            Some(tx) => tx.send(msg.clone()).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, subject: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(subject);
    }

    /// Drop all pending waiters; used when the connection is lost.
    pub fn clear(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_roundtrip() {
        let msg = Message::with_reply("container.start", json!({"containerId": "abc"}), "_reply.1");
        let wire = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.subject, "container.start");
        assert_eq!(parsed.reply.as_deref(), Some("_reply.1"));
        assert_eq!(parsed.data["containerId"], "abc");
        assert!(parsed.timestamp > 0);
    }

    #[test]
    fn reply_field_omitted_when_absent() {
        let msg = Message::new("agent.heartbeat", json!({}));
        let wire = serde_json::to_string(&msg).unwrap();
        assert!(!wire.contains("\"reply\""));
    }

    #[test]
    fn reply_subject_falls_back_when_empty() {
        let mut msg = Message::new("container.list", json!({}));
        assert_eq!(msg.reply_subject("container.list.response"), "container.list.response");
        msg.reply = Some(String::new());
        assert_eq!(msg.reply_subject("container.list.response"), "container.list.response");
        msg.reply = Some("_inbox.42".into());
        assert_eq!(msg.reply_subject("container.list.response"), "_inbox.42");
    }

    #[tokio::test]
    async fn inbox_resolves_registered_subject() {
        let inbox = ReplyInbox::new();
        let rx = inbox.register("agent.auth.success");

        let msg = Message::new("agent.auth.success", json!({"agentId": "a1"}));
        assert!(inbox.resolve(&msg));
        // A second resolve for the same subject finds no waiter.
        assert!(!inbox.resolve(&msg));

        let got = rx.await.unwrap();
        assert_eq!(got.data["agentId"], "a1");
    }

    #[tokio::test]
    async fn inbox_clear_drops_waiters() {
        let inbox = ReplyInbox::new();
        let rx = inbox.register("error");
        inbox.clear();
        assert!(rx.await.is_err());
        assert!(!inbox.resolve(&Message::new("error", json!({}))));
    }
}
