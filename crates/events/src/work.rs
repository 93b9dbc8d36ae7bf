//! Work commands routed to per-stage worker pools.
//!
//! A work command is derived from facts, never from direct requests; the
//! router is the only producer. Commands are keyed by subject id on the bus
//! so per-subject order survives partitioning.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use lifestream_core::{DomainError, SubjectId};

/// Kind of work, one topic and worker pool per kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    FetchLink,
    EnrichLink,
    PublishLink,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::FetchLink => "fetch_link",
            WorkKind::EnrichLink => "enrich_link",
            WorkKind::PublishLink => "publish_link",
        }
    }

    /// Bus topic carrying this kind of work.
    pub fn topic(&self) -> &'static str {
        match self {
            WorkKind::FetchLink => "work.fetch_link",
            WorkKind::EnrichLink => "work.enrich_link",
            WorkKind::PublishLink => "work.publish_link",
        }
    }
}

impl core::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch_link" => Ok(WorkKind::FetchLink),
            "enrich_link" => Ok(WorkKind::EnrichLink),
            "publish_link" => Ok(WorkKind::PublishLink),
            other => Err(DomainError::validation(format!(
                "unknown work kind: {other}"
            ))),
        }
    }
}

/// Payload for `fetch_link` work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPayload {
    pub url: String,
}

/// Payload for `enrich_link` work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichPayload {
    pub title: Option<String>,
    pub text_content: String,
}

/// A unit of work derived from a fact and routed to a worker pool.
///
/// `attempt` is 1-indexed; retries carry the previous error and a fresh
/// `created_at` but are otherwise identical to the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkCommand {
    pub subject_id: SubjectId,
    pub work_type: WorkKind,
    pub correlation_id: Uuid,
    pub triggered_by_event_id: Uuid,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub payload: JsonValue,
}

impl WorkCommand {
    /// First attempt of a new unit of work.
    pub fn first_attempt(
        subject_id: SubjectId,
        work_type: WorkKind,
        correlation_id: Uuid,
        triggered_by_event_id: Uuid,
        max_attempts: u32,
        payload: JsonValue,
    ) -> Self {
        Self {
            subject_id,
            work_type,
            correlation_id,
            triggered_by_event_id,
            attempt: 1,
            max_attempts,
            created_at: Utc::now(),
            last_error: None,
            payload,
        }
    }

    /// Whether another attempt is allowed after a failure of this one.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// The follow-up command for a failed attempt.
    pub fn retry(&self, error: impl Into<String>) -> Self {
        Self {
            attempt: self.attempt + 1,
            created_at: Utc::now(),
            last_error: Some(error.into()),
            ..self.clone()
        }
    }

    /// Typed view of the payload for the stage that consumes it.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Record appended to the dead-letter topic once retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_work: WorkCommand,
    pub final_error: String,
    pub failed_at: DateTime<Utc>,
    pub agent: String,
}

impl DeadLetterRecord {
    pub fn new(original_work: WorkCommand, final_error: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            original_work,
            final_error: final_error.into(),
            failed_at: Utc::now(),
            agent: agent.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(attempt: u32, max: u32) -> WorkCommand {
        WorkCommand {
            subject_id: SubjectId::from("link:abc"),
            work_type: WorkKind::FetchLink,
            correlation_id: Uuid::now_v7(),
            triggered_by_event_id: Uuid::now_v7(),
            attempt,
            max_attempts: max,
            created_at: Utc::now(),
            last_error: None,
            payload: json!({"url": "https://example.com/"}),
        }
    }

    #[test]
    fn retry_bumps_attempt_and_records_error() {
        let first = command(1, 3);
        let second = first.retry("connect timeout");

        assert_eq!(second.attempt, 2);
        assert_eq!(second.last_error.as_deref(), Some("connect timeout"));
        assert_eq!(second.subject_id, first.subject_id);
        assert_eq!(second.triggered_by_event_id, first.triggered_by_event_id);
        assert!(second.created_at >= first.created_at);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        assert!(command(1, 3).can_retry());
        assert!(command(2, 3).can_retry());
        assert!(!command(3, 3).can_retry());
    }

    #[test]
    fn payload_decodes_for_the_stage() {
        let cmd = command(1, 3);
        let payload: FetchPayload = cmd.decode_payload().unwrap();
        assert_eq!(payload.url, "https://example.com/");
    }

    #[test]
    fn work_kind_maps_to_its_topic() {
        assert_eq!(WorkKind::FetchLink.topic(), "work.fetch_link");
        assert_eq!(WorkKind::EnrichLink.topic(), "work.enrich_link");
        assert_eq!(WorkKind::PublishLink.topic(), "work.publish_link");
    }
}
