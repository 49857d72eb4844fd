// src/event.rs
//
// Alarm event data model shared by the feed store, the push channel, the
// polling pull and historical search.

use crate::error::{FeedError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Identifier of the originating equipment (keypoint). This is the unit of
/// authorization: viewers are granted sets of stations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub u64);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Event identity. Assigned monotonically by the source, so it doubles as the
/// ordering key (higher is newer).
pub type EventId = i64;

// ============================================================================
// PRIORITY
// ============================================================================

/// Alarm priority as reported by the SCADA master, 0 through 4.
///
/// Used for presentation only, never for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Highest level the source emits
    pub const MAX: u8 = 4;

    /// Raw ordinal
    pub fn level(self) -> u8 {
        self.0
    }

    /// Presentation class for color coding
    pub fn severity(self) -> Severity {
        match self.0 {
            0 => Severity::Info,
            1 => Severity::Low,
            2 => Severity::Medium,
            3 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

impl From<u8> for Priority {
    /// Out-of-range levels saturate at [`Priority::MAX`].
    fn from(level: u8) -> Self {
        Self(level.min(Self::MAX))
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// Display class derived from [`Priority`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

// ============================================================================
// ALERT EVENT
// ============================================================================

/// A single alarm record.
///
/// Field aliases accept both the feed spelling (`stationID`) and the
/// upstream column spelling (`STATIONPID`, `TEXT`, `TIME`) used by the
/// historical search API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(alias = "PKEY")]
    pub id: EventId,

    #[serde(alias = "TEXT", alias = "text", default)]
    pub message: String,

    /// When the alarm was raised at the source. May lag `id` order.
    #[serde(alias = "TIME", alias = "time", with = "flexible_time")]
    pub timestamp: DateTime<Utc>,

    #[serde(alias = "PRIORITY", default)]
    pub priority: Priority,

    #[serde(rename = "stationID", alias = "STATIONPID", alias = "station_id")]
    pub station_id: StationId,

    /// Human-readable station label, filled lazily
    #[serde(
        rename = "stationName",
        alias = "station_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub station_name: Option<String>,
}

impl AlertEvent {
    pub fn new(
        id: EventId,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        priority: u8,
        station_id: u64,
    ) -> Self {
        Self {
            id,
            message: message.into(),
            timestamp,
            priority: Priority::from(priority),
            station_id: StationId(station_id),
            station_name: None,
        }
    }

    pub fn with_station_name(mut self, name: impl Into<String>) -> Self {
        self.station_name = Some(name.into());
        self
    }
}

/// Accepts RFC 3339 timestamps and the naive `YYYY-MM-DD HH:MM:SS[.f]`
/// format the SCADA database emits (interpreted as UTC).
pub mod flexible_time {
    use super::*;
    use serde::{Deserializer, Serializer};

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Parse a timestamp in any accepted format
    pub fn parse(raw: &str) -> Result<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(naive.and_utc());
            }
        }
        Err(FeedError::Config(format!("Unrecognized timestamp '{}'", raw)))
    }
}

// ============================================================================
// LIVE MUTATIONS
// ============================================================================

/// Kind of change carried by a push frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Insert => write!(f, "insert"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A candidate change to the feed, as delivered by the push channel.
///
/// Delete frames frequently carry only the old row's key, so the station is
/// optional there.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveMutation {
    Insert(AlertEvent),
    Update(AlertEvent),
    Delete {
        id: EventId,
        station_id: Option<StationId>,
    },
}

impl LiveMutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            LiveMutation::Insert(_) => MutationKind::Insert,
            LiveMutation::Update(_) => MutationKind::Update,
            LiveMutation::Delete { .. } => MutationKind::Delete,
        }
    }

    pub fn id(&self) -> EventId {
        match self {
            LiveMutation::Insert(event) | LiveMutation::Update(event) => event.id,
            LiveMutation::Delete { id, .. } => *id,
        }
    }

    /// Station the mutation concerns, when the frame carries it
    pub fn station_id(&self) -> Option<StationId> {
        match self {
            LiveMutation::Insert(event) | LiveMutation::Update(event) => Some(event.station_id),
            LiveMutation::Delete { station_id, .. } => *station_id,
        }
    }

    /// Decode one push frame: `{"eventType": "...", "payload": {...}}`
    pub fn from_frame(frame: &str) -> Result<Self> {
        let wire: WireMutation = serde_json::from_str(frame)?;
        wire.try_into()
    }
}

#[derive(Debug, Deserialize)]
struct WireMutation {
    #[serde(rename = "eventType", alias = "event_type", alias = "type")]
    event_type: MutationKind,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeletedKey {
    #[serde(alias = "PKEY")]
    id: EventId,
    #[serde(rename = "stationID", alias = "STATIONPID", alias = "station_id", default)]
    station_id: Option<StationId>,
}

impl TryFrom<WireMutation> for LiveMutation {
    type Error = FeedError;

    fn try_from(wire: WireMutation) -> Result<Self> {
        Ok(match wire.event_type {
            MutationKind::Insert => LiveMutation::Insert(serde_json::from_value(wire.payload)?),
            MutationKind::Update => LiveMutation::Update(serde_json::from_value(wire.payload)?),
            MutationKind::Delete => {
                let key: DeletedKey = serde_json::from_value(wire.payload)?;
                LiveMutation::Delete {
                    id: key.id,
                    station_id: key.station_id,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_priority_saturates() {
        assert_eq!(Priority::from(2).level(), 2);
        assert_eq!(Priority::from(9).level(), Priority::MAX);
        assert_eq!(Priority::from(0).severity(), Severity::Info);
        assert_eq!(Priority::from(4).severity(), Severity::Critical);
    }

    #[test]
    fn test_decode_upstream_columns() {
        let json = r#"{
            "id": 812,
            "TEXT": "CB OPEN feeder 3",
            "TIME": "2025-07-01 08:15:30.250",
            "PRIORITY": 3,
            "STATIONPID": 1042,
            "station_name": "GI Cawang"
        }"#;

        let event: AlertEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.id, 812);
        assert_eq!(event.message, "CB OPEN feeder 3");
        assert_eq!(event.priority.level(), 3);
        assert_eq!(event.station_id, StationId(1042));
        assert_eq!(event.station_name.as_deref(), Some("GI Cawang"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2025, 7, 1, 8, 15, 30).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_decode_feed_spelling() {
        let json = r#"{
            "id": 5,
            "message": "Voltage low",
            "timestamp": "2025-07-01T08:15:30+07:00",
            "priority": 1,
            "stationID": 10
        }"#;

        let event: AlertEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.station_id, StationId(10));
        assert!(event.station_name.is_none());
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2025, 7, 1, 1, 15, 30).unwrap());
    }

    #[test]
    fn test_decode_frames() {
        let insert = r#"{"eventType":"insert","payload":{"id":7,"message":"Trip","timestamp":"2025-07-01T00:00:00Z","priority":4,"stationID":3}}"#;
        let mutation = LiveMutation::from_frame(insert).unwrap();
        assert_eq!(mutation.kind(), MutationKind::Insert);
        assert_eq!(mutation.id(), 7);
        assert_eq!(mutation.station_id(), Some(StationId(3)));

        let delete = r#"{"eventType":"delete","payload":{"id":7}}"#;
        let mutation = LiveMutation::from_frame(delete).unwrap();
        assert_eq!(mutation, LiveMutation::Delete { id: 7, station_id: None });
    }

    #[test]
    fn test_reject_bad_frames() {
        assert!(LiveMutation::from_frame(r#"{"eventType":"upsert","payload":{}}"#).is_err());
        assert!(LiveMutation::from_frame(r#"{"eventType":"update","payload":{"id":1}}"#).is_err());
        assert!(flexible_time::parse("yesterday").is_err());
    }
}
