//! Event records: the unit of persistence and transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use lifestream_core::{Subject, SubjectId, SubjectKind};

use crate::catalog::{EventKind, PayloadError};

/// Well-known event sources.
pub mod source {
    pub const CHROME: &str = "chrome";
    pub const PHONE: &str = "phone";
    pub const HOMEASSISTANT: &str = "homeassistant";
    pub const API: &str = "api";

    /// Source label for a worker agent, e.g. `agent:fetcher`.
    pub fn agent(name: &str) -> String {
        format!("agent:{name}")
    }

    /// Source label for an operator tool, e.g. `admin:set-visibility`.
    pub fn admin(tool: &str) -> String {
        format!("admin:{tool}")
    }
}

/// A fact as stored in the ledger and carried on the bus.
///
/// Append-only. The single permitted mutation is the `forwarded`
/// `false → true` transition once the outbox has published the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub subject_kind: SubjectKind,
    pub subject_id: SubjectId,
    pub event_type: String,
    pub schema_version: i32,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub forwarded: bool,
}

impl EventRecord {
    /// Typed view of the payload, `None` for catalog-unknown types.
    pub fn kind(&self) -> Result<Option<EventKind>, PayloadError> {
        EventKind::decode(&self.event_type, &self.payload)
    }
}

/// An event prepared for appending to the ledger.
///
/// `event_id` may be caller-supplied for idempotent re-emission (operator
/// tools derive deterministic ids); otherwise the ledger assigns a fresh
/// time-ordered id. `received_at` is always assigned by the ledger.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub subject: Subject,
    pub kind: EventKind,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
}

impl NewEvent {
    pub fn new(source: impl Into<String>, subject: Subject, kind: EventKind) -> Self {
        Self {
            event_id: None,
            occurred_at: Utc::now(),
            source: source.into(),
            subject,
            kind,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LinkAdded;

    #[test]
    fn record_round_trips_as_json() {
        let record = EventRecord {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            source: source::CHROME.to_string(),
            subject_kind: SubjectKind::Link,
            subject_id: SubjectId::from("link:abc"),
            event_type: "link.added".to_string(),
            schema_version: 1,
            payload: serde_json::json!({"url": "https://example.com/"}),
            correlation_id: Some(Uuid::now_v7()),
            causation_id: None,
            forwarded: false,
        };

        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: EventRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn typed_kind_comes_back_from_the_record() {
        let kind = EventKind::LinkAdded(LinkAdded {
            url: "https://example.com/".into(),
            url_norm: None,
        });
        let record = EventRecord {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            source: source::API.to_string(),
            subject_kind: SubjectKind::Link,
            subject_id: SubjectId::from("link:abc"),
            event_type: kind.event_type().to_string(),
            schema_version: kind.schema_version(),
            payload: kind.payload().unwrap(),
            correlation_id: None,
            causation_id: None,
            forwarded: false,
        };

        assert_eq!(record.kind().unwrap().unwrap(), kind);
    }
}
