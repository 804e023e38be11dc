//! Bounded, broadcast-capable progress buffers

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Entries kept per bot before the oldest are dropped
pub const DEFAULT_CAPACITY: usize = 2000;

const SUBSCRIBER_BUFFER: usize = 256;

/// Severity of a progress entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    System,
    Info,
    Warning,
    Error,
    Success,
}

/// One line of build/start/stop progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Progress buffer of a single bot
pub struct BuildLog {
    bot_id: String,
    capacity: usize,
    entries: Mutex<VecDeque<BuildLogEntry>>,
    sender: Mutex<Option<broadcast::Sender<BuildLogEntry>>>,
}

impl BuildLog {
    pub fn new(bot_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            bot_id: bot_id.into(),
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Append an entry, trimming the oldest when over capacity, and notify subscribers
    pub fn append(&self, message: impl Into<String>, severity: Severity) -> BuildLogEntry {
        let entry = BuildLogEntry {
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        };

        match severity {
            Severity::Error => error!(bot_id = %self.bot_id, "{}", entry.message),
            Severity::Warning => warn!(bot_id = %self.bot_id, "{}", entry.message),
            Severity::System => debug!(bot_id = %self.bot_id, "{}", entry.message),
            Severity::Info | Severity::Success => info!(bot_id = %self.bot_id, "{}", entry.message),
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }

        // Sent under the entries lock so a snapshot+subscribe pair never misses or repeats
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(entry.clone());
        }

        entry
    }

    pub fn system(&self, message: impl Into<String>) {
        self.append(message, Severity::System);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(message, Severity::Info);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append(message, Severity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(message, Severity::Error);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.append(message, Severity::Success);
    }

    /// All buffered entries, oldest first
    pub fn snapshot(&self) -> Vec<BuildLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every buffered entry
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Live feed of new entries. `None` once the log has been destroyed.
    ///
    /// Dropping the receiver unregisters the subscriber.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BuildLogEntry>> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        sender.as_ref().map(|s| s.subscribe())
    }

    /// Current entries plus a feed starting right after them
    pub fn snapshot_and_subscribe(
        &self,
    ) -> (Vec<BuildLogEntry>, Option<broadcast::Receiver<BuildLogEntry>>) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let receiver = self.subscribe();
        (entries.iter().cloned().collect(), receiver)
    }

    /// Close every subscriber and drop the buffer
    pub fn destroy(&self) {
        self.clear();
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        sender.take();
    }

    pub fn subscriber_count(&self) -> usize {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        sender.as_ref().map(|s| s.receiver_count()).unwrap_or(0)
    }
}

/// Process-scoped registry of progress buffers, one per bot
pub struct LogCollector {
    capacity: usize,
    logs: Mutex<HashMap<String, Arc<BuildLog>>>,
}

impl LogCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer of a bot, created on first use
    pub fn get(&self, bot_id: &str) -> Arc<BuildLog> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(BuildLog::new(bot_id, self.capacity)))
            .clone()
    }

    /// Release a bot's buffer and its subscribers
    pub fn destroy(&self, bot_id: &str) {
        let removed = {
            let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
            logs.remove(bot_id)
        };
        if let Some(log) = removed {
            log.destroy();
        }
    }

    pub fn len(&self) -> usize {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogCollector {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
