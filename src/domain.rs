//! ==============================================================================
//! domain.rs - sensor records, the canonical collection, and push deltas
//! ==============================================================================
//!
//! purpose:
//!     the shapes shared by every part of the hub. the rest api, the push
//!     channel and the dashboard views all speak `SensorRecord`.
//!
//! relationships:
//!     - used by: sync.rs (owns a SensorCollection)
//!     - used by: channel/ (decodes raw payloads into DeltaEvent)
//!     - used by: proximity.rs, projector.rs, filter.rs (read-only views)
//!
//! ==============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DeltaError;
use crate::geo::GeoPoint;

// ==============================================================================
// identity
// ==============================================================================

/// opaque sensor identifier. the backend hands out integers, but string ids
/// are accepted and kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorId {
    Num(i64),
    Text(String),
}

impl SensorId {
    /// parse user-supplied text (path segments, search boxes)
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(n) => Self::Num(n),
            Err(_) => Self::Text(s.to_string()),
        }
    }

    /// the same id in its other wire form: `12` and `"12"`
    pub fn alternate(&self) -> Option<Self> {
        match self {
            Self::Num(n) => Some(Self::Text(n.to_string())),
            Self::Text(s) => s.parse().ok().map(Self::Num),
        }
    }

    /// the backend addresses sensors by their printed id
    pub fn same_key(&self, other: &Self) -> bool {
        self == other || self.to_string() == other.to_string()
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SensorId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for SensorId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ==============================================================================
// record
// ==============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Warning,
    #[default]
    Pending,
    Resolved,
}

impl SensorStatus {
    /// status color used by list rows
    pub fn color(self) -> &'static str {
        match self {
            Self::Active => "green",
            Self::Warning => "red",
            Self::Pending => "orange",
            Self::Resolved => "gray",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Warning => "warning",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

/// one sensor as the backend knows it.
///
/// updates replace every mutable field at once; there is no per-field merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    pub id: SensorId,
    /// decimal degrees; numeric strings are accepted on input
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// missing status is read as pending
    #[serde(default)]
    pub status: SensorStatus,
    /// celsius
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub smoke: Option<f64>,
    /// relative humidity (0-100%)
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SensorRecord {
    /// a bare record with only identity and status set
    pub fn new(id: impl Into<SensorId>, status: SensorStatus) -> Self {
        Self {
            id: id.into(),
            latitude: None,
            longitude: None,
            status,
            temperature: None,
            smoke: None,
            humidity: None,
            last_data_received_at: None,
            name: None,
            description: None,
        }
    }

    pub fn at(mut self, lat: f64, lon: f64) -> Self {
        self.latitude = Some(lat);
        self.longitude = Some(lon);
        self
    }

    /// position, if both coordinates are known
    pub fn position(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }
}

/// accepts numbers, numeric strings, empty strings and null
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrText {
        Num(f64),
        Text(String),
    }

    match Option::<NumOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrText::Num(v)) => Ok(Some(v)),
        Some(NumOrText::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(NumOrText::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid number {s:?}: {e}"))),
    }
}

// ==============================================================================
// collection
// ==============================================================================

/// insertion-ordered sensors, one entry per id.
///
/// absence of an id means "not known here", never "deleted".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<SensorRecord>", into = "Vec<SensorRecord>")]
pub struct SensorCollection {
    entries: IndexMap<SensorId, SensorRecord>,
}

impl SensorCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &SensorId) -> Option<&SensorRecord> {
        self.entries.get(id)
    }

    /// look up a user-supplied id (a path segment) in either wire form
    pub fn find(&self, raw: &str) -> Option<&SensorRecord> {
        let id = SensorId::parse(raw);
        self.get(&id)
            .or_else(|| id.alternate().and_then(|alt| self.get(&alt)))
    }

    pub fn contains(&self, id: &SensorId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &SensorRecord> {
        self.entries.values()
    }

    /// insert or fully replace. an existing id keeps its position.
    /// returns false when the stored record was already identical.
    pub fn upsert(&mut self, record: SensorRecord) -> bool {
        if self.entries.get(&record.id) == Some(&record) {
            return false;
        }
        self.entries.insert(record.id.clone(), record);
        true
    }

    /// remove while keeping the order of the remaining entries
    pub fn remove(&mut self, id: &SensorId) -> Option<SensorRecord> {
        self.entries.shift_remove(id)
    }

    pub fn to_vec(&self) -> Vec<SensorRecord> {
        self.entries.values().cloned().collect()
    }
}

impl From<Vec<SensorRecord>> for SensorCollection {
    fn from(records: Vec<SensorRecord>) -> Self {
        records.into_iter().collect()
    }
}

impl From<SensorCollection> for Vec<SensorRecord> {
    fn from(collection: SensorCollection) -> Self {
        collection.entries.into_values().collect()
    }
}

impl FromIterator<SensorRecord> for SensorCollection {
    /// later duplicates win
    fn from_iter<I: IntoIterator<Item = SensorRecord>>(iter: I) -> Self {
        let mut collection = Self::new();
        for record in iter {
            collection.upsert(record);
        }
        collection
    }
}

// ==============================================================================
// deltas
// ==============================================================================

/// an incremental change pushed after the snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    Upsert(SensorRecord),
    Delete(SensorId),
}

impl DeltaEvent {
    pub fn id(&self) -> &SensorId {
        match self {
            Self::Upsert(record) => &record.id,
            Self::Delete(id) => id,
        }
    }

    /// decode a raw push payload.
    ///
    /// the wire reuses the record shape for tombstones (`"deleted": true`);
    /// this is the only place that flag is looked at.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self, DeltaError> {
        let object = payload.as_object().ok_or(DeltaError::NotAnObject)?;

        let id = match object.get("id") {
            None | Some(serde_json::Value::Null) => return Err(DeltaError::MissingId),
            Some(raw) => serde_json::from_value::<SensorId>(raw.clone())
                .map_err(|e| DeltaError::InvalidRecord(format!("id: {e}")))?,
        };

        if object.get("deleted").and_then(serde_json::Value::as_bool) == Some(true) {
            return Ok(Self::Delete(id));
        }

        serde_json::from_value::<SensorRecord>(payload)
            .map(Self::Upsert)
            .map_err(|e| DeltaError::InvalidRecord(e.to_string()))
    }
}
