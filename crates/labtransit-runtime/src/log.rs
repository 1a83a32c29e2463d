//! Workflow log: append-only progress messages and terminal notifications.
//!
//! Nothing here survives a restart. Live consumers subscribe to a broadcast
//! channel; late consumers read by sequence number.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Entries kept for late readers; older ones are dropped, `seq` keeps counting.
const LOG_HISTORY: usize = 10_000;
/// Notifications kept for late readers.
const NOTIFICATION_HISTORY: usize = 100;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
}

/// One summary per terminal operation.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
    pub message: String,
    #[serde(rename = "operationId")]
    pub operation_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LogEvent {
    Entry(LogEntry),
    Notification(Notification),
}

struct EntryBuffer {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

pub struct WorkflowLog {
    entries: RwLock<EntryBuffer>,
    capacity: usize,
    notifications: RwLock<VecDeque<Notification>>,
    events: broadcast::Sender<LogEvent>,
}

impl Default for WorkflowLog {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowLog {
    pub fn new() -> Self {
        Self::with_capacity(LOG_HISTORY)
    }

    /// Log that keeps at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(EntryBuffer {
                entries: VecDeque::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            notifications: RwLock::new(VecDeque::new()),
            events,
        }
    }

    /// Append a message; mirrored to `tracing` at the matching level.
    pub fn append(
        &self,
        operation_id: Option<Uuid>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> LogEntry {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }

        let entry = {
            let mut buffer = self.entries.write();
            let entry = LogEntry {
                seq: buffer.next_seq,
                timestamp: Utc::now(),
                level,
                message,
                operation_id,
            };
            buffer.next_seq += 1;
            if buffer.entries.len() == self.capacity {
                buffer.entries.pop_front();
            }
            buffer.entries.push_back(entry.clone());
            entry
        };

        // No receivers is fine.
        let _ = self.events.send(LogEvent::Entry(entry.clone()));
        entry
    }

    pub fn info(&self, operation_id: Option<Uuid>, message: impl Into<String>) -> LogEntry {
        self.append(operation_id, LogLevel::Info, message)
    }

    pub fn warn(&self, operation_id: Option<Uuid>, message: impl Into<String>) -> LogEntry {
        self.append(operation_id, LogLevel::Warn, message)
    }

    pub fn error(&self, operation_id: Option<Uuid>, message: impl Into<String>) -> LogEntry {
        self.append(operation_id, LogLevel::Error, message)
    }

    pub fn notify(&self, operation_id: Uuid, kind: NotificationKind, message: impl Into<String>) {
        let notification = Notification {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            operation_id,
        };
        {
            let mut notifications = self.notifications.write();
            if notifications.len() == NOTIFICATION_HISTORY {
                notifications.pop_front();
            }
            notifications.push_back(notification.clone());
        }
        let _ = self.events.send(LogEvent::Notification(notification));
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().entries.iter().cloned().collect()
    }

    /// Retained entries with `seq >= since`.
    pub fn entries_since(&self, since: u64) -> Vec<LogEntry> {
        let buffer = self.entries.read();
        let first = buffer.entries.front().map_or(buffer.next_seq, |e| e.seq);
        let skip = since.saturating_sub(first) as usize;
        buffer.entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries_for(&self, operation_id: Uuid) -> Vec<LogEntry> {
        self.entries
            .read()
            .entries
            .iter()
            .filter(|e| e.operation_id == Some(operation_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().entries.is_empty()
    }

    /// Most recent notifications, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}
