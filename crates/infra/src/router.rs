//! Router: facts in, work commands out.
//!
//! Stateless beyond its bus consumer position. Correctness rests on the
//! idempotency checks agreeing with what the materializer ultimately writes:
//! a duplicate fact whose effect is already projected routes to nothing.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tracing::{error, info, warn};

use lifestream_core::SubjectId;
use lifestream_events::{
    DeadLetterRecord, EventKind, EventRecord, WorkCommand, WorkKind,
};

use crate::bus::{BusError, BusMessage, RedisBus, EVENTS_RAW};
use crate::config::WorkRetryConfig;
use crate::retry::RetryPolicy;

/// Consumer group the router reads `events.raw` with.
pub const ROUTER_GROUP: &str = "router";

/// Read-model lookups backing the idempotency checks.
#[async_trait]
pub trait ProjectionReads: Send + Sync {
    /// Is link content already present for this subject?
    async fn link_content_present(&self, subject_id: &SubjectId) -> Result<bool, sqlx::Error>;

    /// Is link metadata already filled (tags or a summary)?
    async fn link_metadata_filled(&self, subject_id: &SubjectId) -> Result<bool, sqlx::Error>;

    /// Is publish state clean (`!dirty ∧ published ≥ desired`)?
    async fn publish_state_clean(&self, subject_id: &SubjectId) -> Result<bool, sqlx::Error>;
}

/// Postgres-backed read-model lookups.
pub struct PgProjectionReads {
    pool: PgPool,
}

impl PgProjectionReads {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectionReads for PgProjectionReads {
    async fn link_content_present(&self, subject_id: &SubjectId) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 AS hit FROM link_content WHERE subject_id = $1")
            .bind(subject_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn link_metadata_filled(&self, subject_id: &SubjectId) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS hit FROM link_metadata
            WHERE subject_id = $1
              AND (cardinality(tags) > 0 OR summary_short IS NOT NULL)
            "#,
        )
        .bind(subject_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn publish_state_clean(&self, subject_id: &SubjectId) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT (NOT dirty AND published_version >= desired_version) AS clean
            FROM publish_state WHERE subject_id = $1
            "#,
        )
        .bind(subject_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<bool, _>("clean")).unwrap_or(false))
    }
}

/// What the router decided to do with a fact.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction {
    EmitWork(WorkCommand),
    DeadLetter(DeadLetterRecord),
    /// Recognized, but the idempotency check says the effect already exists.
    Skip(&'static str),
}

/// The dispatch table. Pure: all state comes in through `checks`.
///
/// Returns `None` for event types the router does not react to.
pub fn route_decision(
    record: &EventRecord,
    kind: &EventKind,
    checks: &RouterChecks,
    retry: &WorkRetryConfig,
) -> Option<RouterAction> {
    // A fresh pipeline run starts at the triggering fact.
    let correlation_id = record.correlation_id.unwrap_or(record.event_id);

    match kind {
        EventKind::LinkAdded(payload) => {
            if checks.content_present {
                return Some(RouterAction::Skip("link content already present"));
            }
            Some(RouterAction::EmitWork(WorkCommand::first_attempt(
                record.subject_id.clone(),
                WorkKind::FetchLink,
                correlation_id,
                record.event_id,
                retry.fetch,
                json!({ "url": payload.url }),
            )))
        }
        EventKind::ContentFetched(payload) => {
            if !payload.has_usable_text() {
                return Some(RouterAction::Skip("no usable text to enrich"));
            }
            if checks.metadata_filled {
                return Some(RouterAction::Skip("link metadata already filled"));
            }
            Some(RouterAction::EmitWork(WorkCommand::first_attempt(
                record.subject_id.clone(),
                WorkKind::EnrichLink,
                correlation_id,
                record.event_id,
                retry.enrich,
                json!({
                    "title": payload.title,
                    "text_content": payload.text_content,
                }),
            )))
        }
        EventKind::EnrichmentCompleted(_) => {
            if checks.publish_clean {
                return Some(RouterAction::Skip("publish state already clean"));
            }
            Some(RouterAction::EmitWork(WorkCommand::first_attempt(
                record.subject_id.clone(),
                WorkKind::PublishLink,
                correlation_id,
                record.event_id,
                retry.publish,
                json!({}),
            )))
        }
        EventKind::WorkFailed(payload) => {
            if payload.work_message.can_retry() {
                Some(RouterAction::EmitWork(
                    payload.work_message.retry(&payload.error),
                ))
            } else {
                Some(RouterAction::DeadLetter(DeadLetterRecord::new(
                    payload.work_message.clone(),
                    &payload.error,
                    &payload.agent,
                )))
            }
        }
        _ => None,
    }
}

/// Idempotency-check inputs for one decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterChecks {
    pub content_present: bool,
    pub metadata_filled: bool,
    pub publish_clean: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("router giving up on message {offset} after {attempts} attempts: {last_error}")]
    Fatal {
        offset: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub events_partitions: u32,
    pub work_partitions: u32,
    pub batch_size: usize,
    pub block: Duration,
    pub work_retry: WorkRetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            events_partitions: 3,
            work_partitions: 3,
            batch_size: 32,
            block: Duration::from_millis(250),
            work_retry: WorkRetryConfig::default(),
        }
    }
}

pub struct Router<R> {
    bus: RedisBus,
    reads: R,
    config: RouterConfig,
    consumer_name: String,
    transient: RetryPolicy,
}

impl<R: ProjectionReads> Router<R> {
    pub fn new(bus: RedisBus, reads: R, config: RouterConfig) -> Self {
        Self {
            bus,
            reads,
            config,
            consumer_name: format!("router-{}", std::process::id()),
            transient: RetryPolicy::poison_message(),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RouterError> {
        for partition in 0..self.config.events_partitions {
            self.bus
                .ensure_group(EVENTS_RAW, partition, ROUTER_GROUP)
                .await?;
        }

        loop {
            if *shutdown.borrow() {
                info!("router stopping");
                return Ok(());
            }

            let mut idle = true;
            for partition in 0..self.config.events_partitions {
                let batch = match self
                    .bus
                    .next_batch(
                        EVENTS_RAW,
                        partition,
                        ROUTER_GROUP,
                        &self.consumer_name,
                        self.config.batch_size,
                        self.config.block.as_millis() as u64,
                    )
                    .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(partition, error = %err, "bus read failed, will retry");
                        continue;
                    }
                };

                for message in batch {
                    idle = false;
                    self.handle_with_retries(&message).await?;
                    self.bus
                        .ack(EVENTS_RAW, partition, ROUTER_GROUP, &[message.offset])
                        .await?;
                }

                if *shutdown.borrow() {
                    break;
                }
            }

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.block) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Transient failures get bounded in-place retries; exhausting them is a
    /// process-level fatal so a supervisor restarts us (the message stays
    /// pending and is reclaimed on the next start).
    async fn handle_with_retries(&self, message: &BusMessage) -> Result<(), RouterError> {
        let mut attempt = 1u32;
        loop {
            match self.handle(message).await {
                Ok(()) => return Ok(()),
                Err(err) if self.transient.should_retry(attempt) => {
                    warn!(offset = %message.offset, attempt, error = %err, "routing failed, retrying");
                    tokio::time::sleep(self.transient.delay_for_attempt(attempt + 1)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(RouterError::Fatal {
                        offset: message.offset.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn handle(&self, message: &BusMessage) -> Result<(), RouterError> {
        let record: EventRecord = match serde_json::from_str(&message.payload) {
            Ok(record) => record,
            Err(err) => {
                error!(offset = %message.offset, error = %err, "undecodable message dropped");
                return Ok(());
            }
        };

        let kind = match record.kind() {
            Ok(Some(kind)) => kind,
            Ok(None) => return Ok(()),
            Err(err) => {
                error!(
                    event_type = %record.event_type,
                    subject_id = %record.subject_id,
                    error = %err,
                    "malformed payload dropped"
                );
                return Ok(());
            }
        };

        let checks = self.checks_for(&record, &kind).await?;
        let Some(action) = route_decision(&record, &kind, &checks, &self.config.work_retry)
        else {
            return Ok(());
        };

        match action {
            RouterAction::EmitWork(work) => {
                info!(
                    subject_id = %work.subject_id,
                    work_type = %work.work_type,
                    attempt = work.attempt,
                    correlation_id = %work.correlation_id,
                    "emitting work"
                );
                self.bus
                    .publish_work(&work, self.config.work_partitions)
                    .await?;
            }
            RouterAction::DeadLetter(dead) => {
                warn!(
                    subject_id = %dead.original_work.subject_id,
                    work_type = %dead.original_work.work_type,
                    attempts = dead.original_work.attempt,
                    error = %dead.final_error,
                    "work dead-lettered"
                );
                self.bus.publish_dead_letter(&dead).await?;
            }
            RouterAction::Skip(reason) => {
                info!(subject_id = %record.subject_id, event_type = %record.event_type, reason, "skipped");
            }
        }

        Ok(())
    }

    /// Fetch only the check the event type actually consults.
    async fn checks_for(
        &self,
        record: &EventRecord,
        kind: &EventKind,
    ) -> Result<RouterChecks, RouterError> {
        let mut checks = RouterChecks::default();
        match kind {
            EventKind::LinkAdded(_) => {
                checks.content_present =
                    self.reads.link_content_present(&record.subject_id).await?;
            }
            EventKind::ContentFetched(_) => {
                checks.metadata_filled =
                    self.reads.link_metadata_filled(&record.subject_id).await?;
            }
            EventKind::EnrichmentCompleted(_) => {
                checks.publish_clean =
                    self.reads.publish_state_clean(&record.subject_id).await?;
            }
            _ => {}
        }
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lifestream_core::SubjectKind;
    use lifestream_events::{ContentFetched, EnrichmentCompleted, LinkAdded, WorkFailed};
    use uuid::Uuid;

    fn record(kind: &EventKind) -> EventRecord {
        EventRecord {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            source: "chrome".into(),
            subject_kind: SubjectKind::Link,
            subject_id: SubjectId::from("link:abc"),
            event_type: kind.event_type().to_string(),
            schema_version: 1,
            payload: kind.payload().unwrap(),
            correlation_id: None,
            causation_id: None,
            forwarded: true,
        }
    }

    fn retry() -> WorkRetryConfig {
        WorkRetryConfig::default()
    }

    #[test]
    fn link_added_emits_fetch_work_when_content_is_missing() {
        let kind = EventKind::LinkAdded(LinkAdded {
            url: "https://example.com/a".into(),
            url_norm: None,
        });
        let record = record(&kind);

        let action =
            route_decision(&record, &kind, &RouterChecks::default(), &retry()).unwrap();
        let RouterAction::EmitWork(work) = action else {
            panic!("expected work emission");
        };
        assert_eq!(work.work_type, WorkKind::FetchLink);
        assert_eq!(work.attempt, 1);
        assert_eq!(work.max_attempts, 3);
        assert_eq!(work.triggered_by_event_id, record.event_id);
        // No prior correlation: the pipeline run starts here.
        assert_eq!(work.correlation_id, record.event_id);
        assert_eq!(work.payload["url"], "https://example.com/a");
    }

    #[test]
    fn link_added_skips_when_content_exists() {
        let kind = EventKind::LinkAdded(LinkAdded {
            url: "https://example.com/a".into(),
            url_norm: None,
        });
        let checks = RouterChecks {
            content_present: true,
            ..Default::default()
        };

        let action = route_decision(&record(&kind), &kind, &checks, &retry()).unwrap();
        assert!(matches!(action, RouterAction::Skip(_)));
    }

    #[test]
    fn content_fetched_routes_to_enrichment_only_with_usable_text() {
        let usable = EventKind::ContentFetched(ContentFetched {
            final_url: "https://example.com/a".into(),
            title: Some("T".into()),
            text_content: Some("body text".into()),
            html_storage_key: None,
            fetch_error: None,
        });
        let action = route_decision(
            &record(&usable),
            &usable,
            &RouterChecks::default(),
            &retry(),
        )
        .unwrap();
        assert!(matches!(
            action,
            RouterAction::EmitWork(WorkCommand {
                work_type: WorkKind::EnrichLink,
                ..
            })
        ));

        let partial = EventKind::ContentFetched(ContentFetched {
            final_url: "https://example.com/a".into(),
            title: None,
            text_content: None,
            html_storage_key: None,
            fetch_error: Some("no readable body".into()),
        });
        let action = route_decision(
            &record(&partial),
            &partial,
            &RouterChecks::default(),
            &retry(),
        )
        .unwrap();
        assert!(matches!(action, RouterAction::Skip(_)));
    }

    #[test]
    fn enrichment_completed_skips_when_publish_state_is_clean() {
        let kind = EventKind::EnrichmentCompleted(EnrichmentCompleted {
            tags: vec!["x".into()],
            summary_short: None,
            summary_long: None,
            language: None,
            model_version: None,
        });

        let dirty = route_decision(
            &record(&kind),
            &kind,
            &RouterChecks::default(),
            &retry(),
        )
        .unwrap();
        assert!(matches!(
            dirty,
            RouterAction::EmitWork(WorkCommand {
                work_type: WorkKind::PublishLink,
                ..
            })
        ));

        let clean = RouterChecks {
            publish_clean: true,
            ..Default::default()
        };
        let action = route_decision(&record(&kind), &kind, &clean, &retry()).unwrap();
        assert!(matches!(action, RouterAction::Skip(_)));
    }

    #[test]
    fn work_failed_retries_until_attempts_are_exhausted() {
        let work = WorkCommand::first_attempt(
            SubjectId::from("link:abc"),
            WorkKind::FetchLink,
            Uuid::now_v7(),
            Uuid::now_v7(),
            3,
            serde_json::json!({"url": "https://example.com/a"}),
        );
        let kind = EventKind::WorkFailed(WorkFailed {
            work_message: work.clone(),
            error: "connect timeout".into(),
            agent: "fetcher".into(),
        });

        let action =
            route_decision(&record(&kind), &kind, &RouterChecks::default(), &retry()).unwrap();
        let RouterAction::EmitWork(retried) = action else {
            panic!("expected a retry");
        };
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.last_error.as_deref(), Some("connect timeout"));
        assert_eq!(retried.triggered_by_event_id, work.triggered_by_event_id);
        assert_eq!(retried.correlation_id, work.correlation_id);
    }

    #[test]
    fn exhausted_work_goes_to_the_dead_letter_queue() {
        let mut work = WorkCommand::first_attempt(
            SubjectId::from("link:abc"),
            WorkKind::FetchLink,
            Uuid::now_v7(),
            Uuid::now_v7(),
            3,
            serde_json::json!({"url": "https://example.com/a"}),
        );
        work.attempt = 3;

        let kind = EventKind::WorkFailed(WorkFailed {
            work_message: work.clone(),
            error: "connect timeout".into(),
            agent: "fetcher".into(),
        });

        let action =
            route_decision(&record(&kind), &kind, &RouterChecks::default(), &retry()).unwrap();
        let RouterAction::DeadLetter(dead) = action else {
            panic!("expected a dead letter");
        };
        assert_eq!(dead.original_work.subject_id, work.subject_id);
        assert_eq!(dead.final_error, "connect timeout");
        assert_eq!(dead.agent, "fetcher");
    }

    #[test]
    fn uninteresting_events_route_to_nothing() {
        let kind = EventKind::TodoCompleted(Default::default());
        assert!(route_decision(
            &record(&kind),
            &kind,
            &RouterChecks::default(),
            &retry()
        )
        .is_none());
    }

    #[test]
    fn existing_correlation_id_is_preserved() {
        let kind = EventKind::EnrichmentCompleted(EnrichmentCompleted {
            tags: vec![],
            summary_short: None,
            summary_long: None,
            language: None,
            model_version: None,
        });
        let mut rec = record(&kind);
        let correlation = Uuid::now_v7();
        rec.correlation_id = Some(correlation);

        let action =
            route_decision(&rec, &kind, &RouterChecks::default(), &retry()).unwrap();
        let RouterAction::EmitWork(work) = action else {
            panic!("expected work emission");
        };
        assert_eq!(work.correlation_id, correlation);
    }
}
