use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::CachePort;
use crate::types::{AdminAction, AdminUpdate, CollectionKey, CollectionKind, Entity, RateChange};

/// What a reconciliation pass did to the cache.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciled {
    /// Collections that received a new snapshot.
    pub updated: Vec<CollectionKey>,
    /// Collections flagged for refresh on their next read.
    pub stale: Vec<CollectionKey>,
    /// Collections that should be fetched now because they are not cached.
    pub refresh: Vec<CollectionKey>,
}

impl Reconciled {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.stale.is_empty() && self.refresh.is_empty()
    }
}

/// Applies zone snapshots and admin changes to every cached collection that
/// holds the affected entities. Pushed events and local mutation responses
/// both go through here.
#[derive(Clone)]
pub struct Reconciler {
    cache: Arc<dyn CachePort>,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn CachePort>) -> Self {
        Self { cache }
    }

    /// A zone snapshot is complete: zone lists get it verbatim, the
    /// aggregate report gets it merged over its extra fields.
    pub fn apply_zone_update(&self, zone: &Entity) -> Reconciled {
        let mut out = Reconciled::default();
        let id = zone.id();

        for key in self.cache.collections_of_kind(CollectionKind::Zones) {
            if self.cache.replace_entity(&key, id, zone) {
                out.updated.push(key);
            }
        }

        let aggregate = CollectionKey::parking_state();
        if self.cache.snapshot(&aggregate).is_some() {
            if self.cache.merge_entity(&aggregate, id, zone.fields()) {
                out.updated.push(aggregate.clone());
            }
        } else {
            out.refresh.push(aggregate.clone());
        }

        self.cache.mark_stale(&aggregate);
        out.stale.push(aggregate);

        debug!(zone_id = %id, updated = out.updated.len(), "applied zone update");
        out
    }

    pub fn apply_admin_update(&self, event: &AdminUpdate) -> Reconciled {
        let Some(target_id) = event.target_id.as_deref() else {
            return Reconciled::default();
        };

        match event.action() {
            AdminAction::CategoryRatesChanged => {
                self.apply_category_rates(target_id, &event.rate_change())
            }
            AdminAction::ZoneOpened => self.apply_zone_open(target_id, true),
            AdminAction::ZoneClosed => self.apply_zone_open(target_id, false),
            AdminAction::Other => Reconciled::default(),
        }
    }

    /// Sets whichever rates are present on every zone of `category_id`.
    pub fn apply_category_rates(&self, category_id: &str, change: &RateChange) -> Reconciled {
        if change.is_empty() {
            return Reconciled::default();
        }

        let partial = change.to_partial();
        let mut out = self.merge_where(&partial, |entity| {
            entity.get("categoryId").and_then(Value::as_str) == Some(category_id)
        });
        self.mark_report_stale(&mut out);

        debug!(%category_id, updated = out.updated.len(), "applied category rates");
        out
    }

    pub fn apply_zone_open(&self, zone_id: &str, open: bool) -> Reconciled {
        let mut partial = Map::new();
        partial.insert("open".into(), Value::Bool(open));

        let mut out = self.merge_where(&partial, |entity| entity.id() == zone_id);
        self.mark_report_stale(&mut out);

        debug!(%zone_id, open, updated = out.updated.len(), "applied zone open flag");
        out
    }

    /// Flags every zone list and the report for refetch. Used after a
    /// mutation whose response carries no zone snapshot.
    pub fn invalidate_zones(&self) -> Reconciled {
        let mut out = Reconciled::default();
        for key in self.cache.collections_of_kind(CollectionKind::Zones) {
            self.cache.mark_stale(&key);
            out.stale.push(key);
        }
        self.mark_report_stale(&mut out);

        debug!(stale = out.stale.len(), "invalidated zone collections");
        out
    }

    /// Merges `partial` onto every matching entity of every zone list and of
    /// the aggregate report, when those are cached.
    fn merge_where<P>(&self, partial: &Map<String, Value>, matches: P) -> Reconciled
    where
        P: Fn(&Entity) -> bool,
    {
        let mut out = Reconciled::default();
        let mut keys = self.cache.collections_of_kind(CollectionKind::Zones);
        keys.push(CollectionKey::parking_state());

        for key in keys {
            let Some(snapshot) = self.cache.snapshot(&key) else {
                continue;
            };

            let mut changed = false;
            for entity in snapshot.iter().filter(|e| matches(e)) {
                changed |= self.cache.merge_entity(&key, entity.id(), partial);
            }
            if changed {
                out.updated.push(key);
            }
        }

        out
    }

    fn mark_report_stale(&self, out: &mut Reconciled) {
        let aggregate = CollectionKey::parking_state();
        self.cache.mark_stale(&aggregate);
        out.stale.push(aggregate);
    }
}
