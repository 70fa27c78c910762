use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// A single captured agent log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogLine {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
}

/// Bounded ring buffer of the agent's own log lines with fan-out to
/// remote subscribers. A subscriber whose channel is full is skipped for
/// that line (drop-newest for slow consumers).
pub struct LogCapture {
    inner: Mutex<Inner>,
}

struct Inner {
    buffer: VecDeque<AgentLogLine>,
    capacity: usize,
    subscribers: HashMap<u64, mpsc::Sender<AgentLogLine>>,
    next_id: u64,
}

const SUBSCRIBER_BUFFER: usize = 100;

impl LogCapture {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                capacity,
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    pub fn push(&self, level: &tracing::Level, message: String) {
        let line = AgentLogLine {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level: level.to_string(),
            message,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.buffer.len() >= inner.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(line.clone());

        for tx in inner.subscribers.values() {
            // try_send: a full subscriber misses this line rather than
            // stalling the writer.
            let _ = tx.try_send(line.clone());
        }
    }

    /// Last `tail` lines, oldest first. `tail == 0` returns everything.
    pub fn history(&self, tail: usize) -> Vec<AgentLogLine> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let len = inner.buffer.len();
        let take = if tail == 0 || tail > len { len } else { tail };
        inner.buffer.iter().skip(len - take).cloned().collect()
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<AgentLogLine>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.remove(&id);
    }

    pub fn has_subscribers(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !inner.subscribers.is_empty()
    }
}

/// Tracing layer that tees every event into a [`LogCapture`].
pub struct CaptureLayer {
    capture: Arc<LogCapture>,
}

impl CaptureLayer {
    pub fn new(capture: Arc<LogCapture>) -> Self {
        Self { capture }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if !visitor.0.is_empty() {
            self.capture.push(event.metadata().level(), visitor.0);
        }
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let capture = LogCapture::new(3);
        for i in 0..5 {
            capture.push(&tracing::Level::INFO, format!("line {i}"));
        }
        let history = capture.history(0);
        let messages: Vec<_> = history.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn history_tail_returns_newest() {
        let capture = LogCapture::new(10);
        for i in 0..6 {
            capture.push(&tracing::Level::INFO, format!("line {i}"));
        }
        let history = capture.history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "line 4");
        assert_eq!(history[1].message, "line 5");
        // Tail larger than buffer returns everything.
        assert_eq!(capture.history(100).len(), 6);
    }

    #[tokio::test]
    async fn subscribers_receive_lines_and_full_channels_drop() {
        let capture = LogCapture::new(10);
        let (id, mut rx) = capture.subscribe();
        assert!(capture.has_subscribers());

        capture.push(&tracing::Level::WARN, "warned".into());
        let line = rx.recv().await.unwrap();
        assert_eq!(line.level, "WARN");
        assert_eq!(line.message, "warned");

        // Saturate the channel; extra lines are dropped, not queued.
        for i in 0..(SUBSCRIBER_BUFFER + 50) {
            capture.push(&tracing::Level::INFO, format!("flood {i}"));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);

        capture.unsubscribe(id);
        assert!(!capture.has_subscribers());
    }
}
