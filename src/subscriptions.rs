use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::types::{ClientMsg, GateId};

/// The gates the current views want pushes for. The set outlives transport
/// loss so it can be replayed on every open.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    topics: BTreeSet<GateId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the frame to send now, if the connection is open.
    pub fn subscribe(&mut self, gate_id: &str, open: bool) -> Option<ClientMsg> {
        self.topics.insert(Arc::from(gate_id));
        debug!(%gate_id, open, "subscribed");

        open.then(|| ClientMsg::Subscribe {
            gate_id: gate_id.to_string(),
        })
    }

    /// Returns the frame to send now. Nothing is sent for a connection that
    /// is not live.
    pub fn unsubscribe(&mut self, gate_id: &str, open: bool) -> Option<ClientMsg> {
        let removed = self.topics.remove(gate_id);
        debug!(%gate_id, removed, open, "unsubscribed");

        open.then(|| ClientMsg::Unsubscribe {
            gate_id: gate_id.to_string(),
        })
    }

    /// One subscribe frame per active gate.
    pub fn replay(&self) -> Vec<ClientMsg> {
        self.topics
            .iter()
            .map(|gate_id| ClientMsg::Subscribe {
                gate_id: gate_id.to_string(),
            })
            .collect()
    }
}
