use std::{fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type GateId = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Zones,
    ParkingState,
}

/// Identity of one cached collection: its kind plus an optional scope
/// (the gate id for per-gate zone lists).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub kind: CollectionKind,
    pub scope: Option<Arc<str>>,
}

impl CollectionKey {
    pub fn zones() -> Self {
        Self {
            kind: CollectionKind::Zones,
            scope: None,
        }
    }

    pub fn zones_for_gate(gate_id: &str) -> Self {
        Self {
            kind: CollectionKind::Zones,
            scope: Some(Arc::from(gate_id)),
        }
    }

    pub fn parking_state() -> Self {
        Self {
            kind: CollectionKind::ParkingState,
            scope: None,
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CollectionKind::Zones => "zones",
            CollectionKind::ParkingState => "parking-state",
        };
        match &self.scope {
            Some(scope) => write!(f, "{kind}/{scope}"),
            None => f.write_str(kind),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("entity is not a JSON object")]
    NotAnObject,
    #[error("entity has no string id")]
    MissingId,
}

/// A cached entity snapshot: a JSON object carrying a string `id`.
///
/// Entities stay untyped so the aggregate report, which carries more
/// fields than a plain zone, can be merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Entity(Map<String, Value>);

impl Entity {
    pub fn id(&self) -> &str {
        // checked on construction
        self.0.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Shallow merge: every field of `partial` overwrites the same field
    /// here, everything else is kept. The id never changes.
    pub fn merged(&self, partial: &Map<String, Value>) -> Entity {
        let mut fields = self.0.clone();
        for (name, value) in partial {
            if name == "id" {
                continue;
            }
            fields.insert(name.clone(), value.clone());
        }
        Entity(fields)
    }
}

impl TryFrom<Map<String, Value>> for Entity {
    type Error = EntityError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        match fields.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(Entity(fields)),
            _ => Err(EntityError::MissingId),
        }
    }
}

impl TryFrom<Value> for Entity {
    type Error = EntityError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Entity::try_from(fields),
            _ => Err(EntityError::NotAnObject),
        }
    }
}

impl From<Entity> for Map<String, Value> {
    fn from(entity: Entity) -> Self {
        entity.0
    }
}

impl TryFrom<&Zone> for Entity {
    type Error = EntityError;

    fn try_from(zone: &Zone) -> Result<Self, Self::Error> {
        let value = serde_json::to_value(zone).map_err(|_| EntityError::NotAnObject)?;
        Entity::try_from(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub category_id: String,
    #[serde(default)]
    pub gate_ids: Vec<String>,
    pub total_slots: u32,
    pub occupied: u32,
    pub free: u32,
    pub reserved: u32,
    pub available_for_visitors: u32,
    pub available_for_subscribers: u32,
    pub rate_normal: f64,
    pub rate_special: f64,
    pub open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    CategoryRatesChanged,
    ZoneOpened,
    ZoneClosed,
    Other,
}

impl AdminAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "category-rates-changed" => AdminAction::CategoryRatesChanged,
            "zone-opened" => AdminAction::ZoneOpened,
            "zone-closed" => AdminAction::ZoneClosed,
            _ => AdminAction::Other,
        }
    }
}

/// Payload of an `admin-update` push. Every field is optional on the wire;
/// consumers decide what they can do with a partial event.
///
/// Identifier fields accept numbers as well as strings; anything else reads
/// as absent, which only switches off deduplication for that event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminUpdate {
    #[serde(deserialize_with = "lenient_string")]
    pub admin_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub action: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub target_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: Option<Value>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

impl AdminUpdate {
    pub fn action(&self) -> AdminAction {
        self.action
            .as_deref()
            .map(AdminAction::parse)
            .unwrap_or(AdminAction::Other)
    }

    pub fn rate_change(&self) -> RateChange {
        let details = self.details.as_ref();
        let rate = |field: &str| details.and_then(|d| d.get(field)).and_then(Value::as_f64);
        RateChange {
            rate_normal: rate("rateNormal"),
            rate_special: rate("rateSpecial"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateChange {
    pub rate_normal: Option<f64>,
    pub rate_special: Option<f64>,
}

impl RateChange {
    pub fn is_empty(&self) -> bool {
        self.rate_normal.is_none() && self.rate_special.is_none()
    }

    /// Only the rates that are present; used as a merge patch.
    pub fn to_partial(&self) -> Map<String, Value> {
        let mut partial = Map::new();
        if let Some(rate) = self.rate_normal {
            partial.insert("rateNormal".into(), Value::from(rate));
        }
        if let Some(rate) = self.rate_special {
            partial.insert("rateSpecial".into(), Value::from(rate));
        }
        partial
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientMsg {
    Subscribe {
        #[serde(rename = "gateId")]
        gate_id: String,
    },
    Unsubscribe {
        #[serde(rename = "gateId")]
        gate_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    ZoneUpdate(Entity),
    AdminUpdate(AdminUpdate),
}
