//! The event catalog: every fact the pipeline understands.
//!
//! Payloads are stored as self-describing JSON next to an `event_type`
//! column; this module is the single place that turns `(event_type, payload)`
//! back into a typed value. Unknown event types are not an error; consumers
//! decide whether to drop or dead-end them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use lifestream_core::SubjectId;

use crate::status::Visibility;
use crate::work::WorkCommand;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {event_type} payload: {source}")]
    Serialize {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// `link.added`: a capture client persisted a new link reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAdded {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_norm: Option<String>,
}

/// `content.fetched`: the fetch worker retrieved and extracted a page.
///
/// A present `fetch_error` with a null `text_content` is a partial success
/// (the page answered but produced no readable body), not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFetched {
    pub final_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

impl ContentFetched {
    /// Whether the fetched body is usable for enrichment.
    pub fn has_usable_text(&self) -> bool {
        self.fetch_error.is_none()
            && self
                .text_content
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty())
    }
}

/// `enrichment.completed`: the enrich worker produced tags and summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentCompleted {
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_long: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

/// `publish.completed`: publication is itself a fact, for audit and
/// downstream triggering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishCompleted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// `link.visibility_changed`: operator changed a subject's visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkVisibilityChanged {
    pub visibility: Visibility,
}

/// `work.failed`: a worker could not complete a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFailed {
    pub work_message: WorkCommand,
    pub error: String,
    pub agent: String,
}

/// `temp.reading_recorded`: a sensor reported a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempReadingRecorded {
    pub celsius: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
}

/// `todo.created`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoCreated {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

/// `todo.completed`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoCompleted {}

/// `annotation.added`: a highlight or note attached to a link subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationAdded {
    pub annotation_id: String,
    pub link_subject_id: SubjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

/// Typed view over `(event_type, payload)`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    LinkAdded(LinkAdded),
    ContentFetched(ContentFetched),
    EnrichmentCompleted(EnrichmentCompleted),
    PublishCompleted(PublishCompleted),
    LinkVisibilityChanged(LinkVisibilityChanged),
    WorkFailed(WorkFailed),
    TempReadingRecorded(TempReadingRecorded),
    TodoCreated(TodoCreated),
    TodoCompleted(TodoCompleted),
    AnnotationAdded(AnnotationAdded),
}

impl EventKind {
    /// Stable event type identifier, e.g. `link.added`.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::LinkAdded(_) => "link.added",
            EventKind::ContentFetched(_) => "content.fetched",
            EventKind::EnrichmentCompleted(_) => "enrichment.completed",
            EventKind::PublishCompleted(_) => "publish.completed",
            EventKind::LinkVisibilityChanged(_) => "link.visibility_changed",
            EventKind::WorkFailed(_) => "work.failed",
            EventKind::TempReadingRecorded(_) => "temp.reading_recorded",
            EventKind::TodoCreated(_) => "todo.created",
            EventKind::TodoCompleted(_) => "todo.completed",
            EventKind::AnnotationAdded(_) => "annotation.added",
        }
    }

    /// Schema version for this event type.
    pub fn schema_version(&self) -> i32 {
        1
    }

    /// Serialize the payload for storage.
    pub fn payload(&self) -> Result<JsonValue, PayloadError> {
        let serialize = |r: Result<JsonValue, serde_json::Error>| {
            r.map_err(|source| PayloadError::Serialize {
                event_type: self.event_type(),
                source,
            })
        };
        match self {
            EventKind::LinkAdded(p) => serialize(serde_json::to_value(p)),
            EventKind::ContentFetched(p) => serialize(serde_json::to_value(p)),
            EventKind::EnrichmentCompleted(p) => serialize(serde_json::to_value(p)),
            EventKind::PublishCompleted(p) => serialize(serde_json::to_value(p)),
            EventKind::LinkVisibilityChanged(p) => serialize(serde_json::to_value(p)),
            EventKind::WorkFailed(p) => serialize(serde_json::to_value(p)),
            EventKind::TempReadingRecorded(p) => serialize(serde_json::to_value(p)),
            EventKind::TodoCreated(p) => serialize(serde_json::to_value(p)),
            EventKind::TodoCompleted(p) => serialize(serde_json::to_value(p)),
            EventKind::AnnotationAdded(p) => serialize(serde_json::to_value(p)),
        }
    }

    /// Decode a stored `(event_type, payload)` pair.
    ///
    /// Returns `Ok(None)` for event types this catalog does not know, so the
    /// caller can drop-with-warning instead of failing the stream.
    pub fn decode(event_type: &str, payload: &JsonValue) -> Result<Option<Self>, PayloadError> {
        fn parse<T: serde::de::DeserializeOwned>(
            event_type: &str,
            payload: &JsonValue,
        ) -> Result<T, PayloadError> {
            serde_json::from_value(payload.clone()).map_err(|source| PayloadError::Malformed {
                event_type: event_type.to_string(),
                source,
            })
        }

        let kind = match event_type {
            "link.added" => EventKind::LinkAdded(parse(event_type, payload)?),
            "content.fetched" => EventKind::ContentFetched(parse(event_type, payload)?),
            "enrichment.completed" => EventKind::EnrichmentCompleted(parse(event_type, payload)?),
            "publish.completed" => EventKind::PublishCompleted(parse(event_type, payload)?),
            "link.visibility_changed" => {
                EventKind::LinkVisibilityChanged(parse(event_type, payload)?)
            }
            "work.failed" => EventKind::WorkFailed(parse(event_type, payload)?),
            "temp.reading_recorded" => EventKind::TempReadingRecorded(parse(event_type, payload)?),
            "todo.created" => EventKind::TodoCreated(parse(event_type, payload)?),
            "todo.completed" => EventKind::TodoCompleted(parse(event_type, payload)?),
            "annotation.added" => EventKind::AnnotationAdded(parse(event_type, payload)?),
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_dispatches_on_event_type() {
        let payload = json!({"url": "https://example.com/", "url_norm": "https://example.com/"});
        let kind = EventKind::decode("link.added", &payload).unwrap().unwrap();
        match kind {
            EventKind::LinkAdded(p) => assert_eq!(p.url, "https://example.com/"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_not_an_error() {
        let decoded = EventKind::decode("link.starred", &json!({})).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let err = EventKind::decode("link.added", &json!({"no_url": true})).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { .. }));
    }

    #[test]
    fn payload_round_trips_through_the_catalog() {
        let kind = EventKind::EnrichmentCompleted(EnrichmentCompleted {
            tags: vec!["rust".into(), "event-sourcing".into()],
            summary_short: Some("short".into()),
            summary_long: None,
            language: Some("en".into()),
            model_version: Some("m-1".into()),
        });
        let payload = kind.payload().unwrap();
        let decoded = EventKind::decode(kind.event_type(), &payload)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, kind);
    }

    #[test]
    fn fetched_text_usability() {
        let with_text = ContentFetched {
            final_url: "https://example.com/".into(),
            title: Some("T".into()),
            text_content: Some("body".into()),
            html_storage_key: None,
            fetch_error: None,
        };
        assert!(with_text.has_usable_text());

        let partial = ContentFetched {
            text_content: None,
            fetch_error: Some("no readable body".into()),
            ..with_text.clone()
        };
        assert!(!partial.has_usable_text());

        let blank = ContentFetched {
            text_content: Some("   ".into()),
            ..with_text
        };
        assert!(!blank.has_usable_text());
    }
}
