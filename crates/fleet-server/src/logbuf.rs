//! In-memory ring buffer of recent structured log lines, exposed over
//! `GET /logs` for operators without shelling into the host. A
//! `tracing_subscriber::Layer` pushes one formatted line per event; the
//! buffer itself is a plain mutex-guarded `VecDeque` with a fixed capacity.

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};

pub const DEFAULT_CAPACITY: usize = 2_048;

pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent `limit` lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// A `tracing_subscriber::Layer` that renders each event as a single line
/// and appends it to a shared `LogBuffer`.
pub struct LogBufferLayer {
    buffer: std::sync::Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: std::sync::Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{} {} {}: {}",
            chrono::Utc::now().to_rfc3339(),
            event.metadata().level(),
            event.metadata().target(),
            visitor.message
        );
        self.buffer.push(line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else if self.message.is_empty() {
            self.message = format!("{}={:?}", field.name(), value);
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_evicts_oldest_past_capacity() {
        let buffer = LogBuffer::new(2);
        buffer.push("a".to_string());
        buffer.push("b".to_string());
        buffer.push("c".to_string());
        assert_eq!(buffer.recent(10), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn recent_respects_limit() {
        let buffer = LogBuffer::new(10);
        for line in ["a", "b", "c"] {
            buffer.push(line.to_string());
        }
        assert_eq!(buffer.recent(2), vec!["b".to_string(), "c".to_string()]);
    }
}
