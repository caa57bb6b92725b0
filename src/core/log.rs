//! Operator-facing event log
//!
//! Every entry is mirrored to `tracing` and kept in a bounded in-memory buffer
//! that a front end can page through or subscribe to.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    /// Bot the entry belongs to, if any
    pub bot_id: Option<String>,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Bounded, shareable log of operator events
pub struct EventLog {
    buffer: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
    sender: broadcast::Sender<LogEntry>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(256);
        Self {
            buffer: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.write(LogLevel::Info, None, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.write(LogLevel::Warning, None, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.write(LogLevel::Error, None, message.into());
    }

    /// Logger that tags every entry with `bot_id`
    pub fn scoped(self: &Arc<Self>, bot_id: impl Into<String>) -> BotLogger {
        BotLogger {
            log: Arc::clone(self),
            bot_id: bot_id.into(),
        }
    }

    /// Receive entries written from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    /// Copy of the buffered entries, oldest first
    pub fn recent_entries(&self) -> Vec<LogEntry> {
        self.buffer
            .read()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn write(&self, level: LogLevel, bot_id: Option<&str>, message: String) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }

        let bot = bot_id.unwrap_or("-");
        match level {
            LogLevel::Info => info!(bot, "{}", message),
            LogLevel::Warning => warn!(bot, "{}", message),
            LogLevel::Error => error!(bot, "{}", message),
        }

        let entry = LogEntry {
            timestamp: Local::now(),
            level,
            bot_id: bot_id.map(str::to_string),
            message: message.to_string(),
        };

        if let Ok(mut buffer) = self.buffer.write() {
            while buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        // No receivers is fine
        let _ = self.sender.send(entry);
    }
}

/// Per-bot handle onto the shared [`EventLog`]
#[derive(Clone)]
pub struct BotLogger {
    log: Arc<EventLog>,
    bot_id: String,
}

impl BotLogger {
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log
            .write(LogLevel::Info, Some(&self.bot_id), message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log
            .write(LogLevel::Warning, Some(&self.bot_id), message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log
            .write(LogLevel::Error, Some(&self.bot_id), message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_entries() {
        let log = EventLog::new(2);
        log.info("one");
        log.warn("two");
        log.error("three");

        let entries = log.recent_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].level, LogLevel::Error);
    }

    #[test]
    fn blank_messages_are_ignored() {
        let log = EventLog::new(8);
        log.info("   ");
        assert!(log.recent_entries().is_empty());
    }

    #[test]
    fn scoped_logger_tags_bot_and_broadcasts() {
        let log = Arc::new(EventLog::new(8));
        let mut rx = log.subscribe();

        log.scoped("bot1").info("  hello ");

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.bot_id.as_deref(), Some("bot1"));
        assert_eq!(entry.message, "hello");
    }
}
