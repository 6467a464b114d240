use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dedup::EventDeduplicator;
use crate::reconcile::{Reconciled, Reconciler};
use crate::types::{AdminUpdate, Entity, ServerMsg};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Classifies one inbound text frame. `Ok(None)` means the type is not one
/// this client handles.
pub fn classify(text: &str) -> Result<Option<ServerMsg>, DispatchError> {
    let frame: RawFrame = serde_json::from_str(text)?;

    match frame.kind.as_str() {
        "zone-update" => {
            let zone: Entity = serde_json::from_value(frame.payload).map_err(|source| {
                DispatchError::InvalidPayload {
                    kind: "zone-update",
                    source,
                }
            })?;
            Ok(Some(ServerMsg::ZoneUpdate(zone)))
        }
        "admin-update" => {
            let event: AdminUpdate = serde_json::from_value(frame.payload).map_err(|source| {
                DispatchError::InvalidPayload {
                    kind: "admin-update",
                    source,
                }
            })?;
            Ok(Some(ServerMsg::AdminUpdate(event)))
        }
        other => {
            debug!(kind = %other, "ignoring unrecognized frame type");
            Ok(None)
        }
    }
}

/// Routes classified frames: zone updates to the reconciler, admin updates
/// to the reconciler and, once deduplicated, to the audit channel.
pub struct Dispatcher {
    reconciler: Reconciler,
    dedup: EventDeduplicator,
    audit_tx: broadcast::Sender<AdminUpdate>,
}

impl Dispatcher {
    pub fn new(
        reconciler: Reconciler,
        dedup: EventDeduplicator,
        audit_tx: broadcast::Sender<AdminUpdate>,
    ) -> Self {
        Self {
            reconciler,
            dedup,
            audit_tx,
        }
    }

    pub fn dispatch(&mut self, text: &str, now: Instant) -> Result<Reconciled, DispatchError> {
        match classify(text)? {
            Some(msg) => Ok(self.handle(msg, now)),
            None => Ok(Reconciled::default()),
        }
    }

    pub fn handle(&mut self, msg: ServerMsg, now: Instant) -> Reconciled {
        match msg {
            ServerMsg::ZoneUpdate(zone) => self.reconciler.apply_zone_update(&zone),
            ServerMsg::AdminUpdate(event) => {
                let out = self.reconciler.apply_admin_update(&event);
                if self.dedup.should_process(&event, now) {
                    // no receivers just means nobody is showing the audit log
                    if self.audit_tx.send(event).is_err() {
                        debug!("no audit subscribers");
                    }
                }
                out
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_events(&self) -> usize {
        self.dedup.len()
    }

    pub fn sweep(&mut self, now: Instant) {
        let evicted = self.dedup.sweep(now);
        if evicted > 0 {
            debug!(evicted, "dedup sweep");
        }
    }
}

/// Logs and swallows dispatch failures so one bad frame never stops the
/// stream.
pub fn log_dispatch_error(err: &DispatchError) {
    warn!(error = %err, "dropping inbound frame");
}
