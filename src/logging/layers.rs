//! In-memory log buffer layer
//!
//! [`LogBufferLayer`] keeps the most recent records in a ring buffer;
//! [`LogBuffer`] handles read it from anywhere.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{field::Visit, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A buffered log record
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Value of a structured field, as recorded
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: Vec::new(),
        }
    }

    fn push(&mut self, field: &tracing::field::Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.push(field, value.to_string());
    }
}

/// Ring buffer layer
pub struct LogBufferLayer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_size: usize,
}

impl LogBufferLayer {
    /// Create a layer keeping at most `max_size` entries, plus its read handle
    pub fn new(max_size: usize) -> (Self, LogBuffer) {
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(max_size)));
        let handle = LogBuffer {
            buffer: Arc::clone(&buffer),
        };
        let layer = Self { buffer, max_size };
        (layer, handle)
    }
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        let entry = LogEntry {
            timestamp: Local::now(),
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        };

        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() >= self.max_size {
                buffer.pop_front();
            }
            buffer.push_back(entry);
        }
    }
}

/// Read handle over the buffered records
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("entries", &self.len())
            .finish()
    }
}

impl LogBuffer {
    pub fn get_entries(&self) -> Vec<LogEntry> {
        self.collect(|_| true)
    }

    /// Most recent `count` entries, oldest first
    pub fn get_recent(&self, count: usize) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .map(|guard| {
                let skip = guard.len().saturating_sub(count);
                guard.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Entries at `level` or more severe
    pub fn at_least(&self, level: Level) -> Vec<LogEntry> {
        self.collect(|e| e.level <= level)
    }

    /// Entries whose message contains `query` (case-insensitive)
    pub fn search(&self, query: &str) -> Vec<LogEntry> {
        let query = query.to_lowercase();
        self.collect(|e| e.message.to_lowercase().contains(&query))
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.buffer.lock() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, keep: impl Fn(&LogEntry) -> bool) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .map(|guard| guard.iter().filter(|e| keep(e)).cloned().collect())
            .unwrap_or_default()
    }
}
