use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::types::AdminUpdate;

/// Suppresses repeated audit events for the same `(adminId, action,
/// targetId)` inside a short window.
#[derive(Debug)]
pub struct EventDeduplicator {
    window: Duration,
    retention: Duration,
    seen: HashMap<DedupKey, Instant>,
}

type DedupKey = (String, String, String);

impl EventDeduplicator {
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            window,
            retention,
            seen: HashMap::new(),
        }
    }

    /// Events without a derivable key are always processed.
    pub fn should_process(&mut self, event: &AdminUpdate, now: Instant) -> bool {
        let Some(key) = dedup_key(event) else {
            return true;
        };

        if let Some(last) = self.seen.get(&key) {
            if now.saturating_duration_since(*last) < self.window {
                debug!(?key, "suppressing duplicate admin event");
                return false;
            }
        }

        self.seen.insert(key, now);
        true
    }

    /// Drops entries older than the retention age. Returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let retention = self.retention;
        self.seen
            .retain(|_, last| now.saturating_duration_since(*last) < retention);
        let evicted = before - self.seen.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.seen.len(), "swept dedup table");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn dedup_key(event: &AdminUpdate) -> Option<DedupKey> {
    Some((
        event.admin_id.clone()?,
        event.action.clone()?,
        event.target_id.clone()?,
    ))
}
