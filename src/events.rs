// SPDX-License-Identifier: MIT
//! Typed observability events.
//!
//! The runner and sync engine publish `job.*` / `sync.*` notifications here.
//! Events are advisory: nothing in the core consumes them as control input,
//! and a subscriber that falls behind simply loses the oldest entries.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// How many events a slow subscriber may lag behind before losing the
/// oldest. Sized for the chattiest realistic burst: one `job.started` +
/// `job.completed` pair per dispatched job, across a full queue drain.
const EVENT_BUFFER: usize = 256;

/// One notification: what happened, to which entity, and when.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Dot-separated kind, e.g. `job.completed`, `sync.started`.
    pub kind: String,
    /// Kind-specific detail (job id, sync id, error text, ...).
    pub payload: Value,
    /// Emission time, RFC 3339.
    pub at: String,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish an event. Succeeds whether or not anyone is listening.
    pub fn broadcast(&self, kind: &str, payload: Value) {
        let _ = self.tx.send(Event {
            kind: kind.to_string(),
            payload,
            at: Utc::now().to_rfc3339(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
