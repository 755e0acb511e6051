// src/notify.rs
//! Coalesced notification dispatch. Repeated identical notifications keep
//! only the latest payload per event name and are flushed on a fixed tick,
//! bounding notification volume independent of event burstiness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

pub const STATE_CHANGED: &str = "state-changed";
pub const DATA_CHANGED: &str = "data-changed";
pub const LOG_CHANGED: &str = "log-changed";

/// Interval between flushes of postponed notifications.
pub const NOTIFY_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: String,
    pub message: Option<String>,
}

/// Latest-payload-per-event coalescer feeding an unbounded channel that a
/// presentation layer consumes.
#[derive(Clone)]
pub struct Notifier {
    pending: Arc<Mutex<HashMap<String, Notification>>>,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Notifier { pending: Arc::new(Mutex::new(HashMap::new())), tx };
        (notifier, rx)
    }

    /// Postpone notification to send many analogous notifications as one.
    pub fn postpone(&self, event: &str, message: Option<String>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                event.to_string(),
                Notification { event: event.to_string(), message },
            );
        }
    }

    /// Flush every postponed notification to the subscriber.
    pub fn flush(&self) {
        let drained: Vec<Notification> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, n)| n).collect(),
            Err(_) => return,
        };
        for notification in drained {
            let _ = self.tx.send(notification);
        }
    }

    /// Spawn the periodic flush task. The task runs until the notifier is
    /// dropped everywhere and the receiver is closed.
    pub fn spawn_flusher(&self) -> tokio::task::JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(NOTIFY_FLUSH_INTERVAL);
            loop {
                tick.tick().await;
                if notifier.tx.is_closed() {
                    break;
                }
                notifier.flush();
            }
        })
    }
}
