//! Administrative operations.
//!
//! Every admin effect is an appended event, never a direct projection write;
//! the event log stays the total state description. The one exception is
//! `reset-bus`, which is an infrastructure reset enabling full replay.
//!
//! Event ids are UUIDv5 over the tool name, subject, and a fingerprint of
//! the state being acted on, so re-running a tool against unchanged state
//! appends nothing (the ledger treats the duplicate id as a no-op).

use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use lifestream_core::{Subject, SubjectId};
use lifestream_events::{
    source, EnrichmentCompleted, EventKind, LinkAdded, LinkStatus, LinkVisibilityChanged,
    NewEvent, Visibility, WorkKind,
};

use crate::bus::{stream_key, BusError, RedisBus, EVENTS_RAW, TAGS_CATALOG, WORK_DEAD_LETTER};
use crate::ledger::{EventLedger, LedgerError};
use crate::projections::progress;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("admin database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Which link subjects a tool acts on.
#[derive(Debug, Clone)]
pub enum AdminTarget {
    Subject(SubjectId),
    All { status: Option<LinkStatus> },
}

fn admin_event_id(tool: &str, subject_id: &SubjectId, fingerprint: &str) -> Uuid {
    let name = format!("lifestream:{tool}:{subject_id}:{fingerprint}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Emit `link.visibility_changed` for every matching link not already at the
/// requested visibility. Returns the affected subjects.
pub async fn set_visibility<L: EventLedger>(
    pool: &PgPool,
    ledger: &L,
    target: &AdminTarget,
    visibility: Visibility,
    dry_run: bool,
) -> Result<Vec<SubjectId>, AdminError> {
    let rows = match target {
        AdminTarget::Subject(subject_id) => {
            sqlx::query("SELECT subject_id FROM links WHERE subject_id = $1 AND visibility <> $2")
                .bind(subject_id.as_str())
                .bind(visibility.as_str())
                .fetch_all(pool)
                .await?
        }
        AdminTarget::All { status } => match status {
            Some(status) => sqlx::query(
                "SELECT subject_id FROM links WHERE status = $1 AND visibility <> $2 ORDER BY subject_id",
            )
            .bind(status.as_str())
            .bind(visibility.as_str())
            .fetch_all(pool)
            .await?,
            None => sqlx::query(
                "SELECT subject_id FROM links WHERE visibility <> $1 ORDER BY subject_id",
            )
            .bind(visibility.as_str())
            .fetch_all(pool)
            .await?,
        },
    };

    let mut affected = Vec::with_capacity(rows.len());
    for row in rows {
        let subject_id = SubjectId::from(row.get::<String, _>("subject_id").as_str());
        if !dry_run {
            let event_id = admin_event_id("set-visibility", &subject_id, visibility.as_str());
            ledger
                .append(
                    NewEvent::new(
                        source::admin("set-visibility"),
                        Subject::link(subject_id.clone()),
                        EventKind::LinkVisibilityChanged(LinkVisibilityChanged { visibility }),
                    )
                    .with_event_id(event_id),
                )
                .await?;
        }
        affected.push(subject_id);
    }

    info!(count = affected.len(), dry_run, "set-visibility");
    Ok(affected)
}

#[derive(Debug, Clone)]
pub struct RetryFailedOptions {
    pub subject_id: Option<SubjectId>,
    pub limit: u32,
    pub max_retries: u32,
}

impl Default for RetryFailedOptions {
    fn default() -> Self {
        Self {
            subject_id: None,
            limit: 50,
            max_retries: 3,
        }
    }
}

/// Give exhausted links another life: clear their content and metadata rows
/// and re-emit `link.added`, which routes a fresh fetch.
pub async fn retry_failed<L: EventLedger>(
    pool: &PgPool,
    ledger: &L,
    options: &RetryFailedOptions,
    dry_run: bool,
) -> Result<Vec<SubjectId>, AdminError> {
    let rows = match &options.subject_id {
        Some(subject_id) => sqlx::query(
            r#"
            SELECT subject_id, url, url_norm, retry_count FROM links
            WHERE subject_id = $1 AND status = 'error' AND retry_count >= $2
            "#,
        )
        .bind(subject_id.as_str())
        .bind(options.max_retries as i32)
        .fetch_all(pool)
        .await?,
        None => sqlx::query(
            r#"
            SELECT subject_id, url, url_norm, retry_count FROM links
            WHERE status = 'error' AND retry_count >= $1
            ORDER BY subject_id
            LIMIT $2
            "#,
        )
        .bind(options.max_retries as i32)
        .bind(options.limit as i64)
        .fetch_all(pool)
        .await?,
    };

    let mut affected = Vec::with_capacity(rows.len());
    for row in rows {
        let subject_id = SubjectId::from(row.get::<String, _>("subject_id").as_str());
        if !dry_run {
            sqlx::query("DELETE FROM link_content WHERE subject_id = $1")
                .bind(subject_id.as_str())
                .execute(pool)
                .await?;
            sqlx::query("DELETE FROM link_metadata WHERE subject_id = $1")
                .bind(subject_id.as_str())
                .execute(pool)
                .await?;

            let retry_count: i32 = row.get("retry_count");
            let event_id =
                admin_event_id("retry-failed", &subject_id, &retry_count.to_string());
            ledger
                .append(
                    NewEvent::new(
                        source::admin("retry-failed"),
                        Subject::link(subject_id.clone()),
                        EventKind::LinkAdded(LinkAdded {
                            url: row.get("url"),
                            url_norm: Some(row.get("url_norm")),
                        }),
                    )
                    .with_event_id(event_id),
                )
                .await?;
        }
        affected.push(subject_id);
    }

    info!(count = affected.len(), dry_run, "retry-failed");
    Ok(affected)
}

/// Re-emit a synthetic `enrichment.completed` from projected metadata for
/// links whose status never advanced past fetch (a lost completion fact).
pub async fn recover_stuck<L: EventLedger>(
    pool: &PgPool,
    ledger: &L,
    target: &AdminTarget,
    dry_run: bool,
) -> Result<Vec<SubjectId>, AdminError> {
    let filter_subject = match target {
        AdminTarget::Subject(subject_id) => Some(subject_id.as_str().to_string()),
        AdminTarget::All { .. } => None,
    };

    let rows = sqlx::query(
        r#"
        SELECT l.subject_id, m.tags, m.summary_short, m.summary_long,
               m.language, m.model_version, m.enriched_at
        FROM links l
        JOIN link_metadata m USING (subject_id)
        WHERE l.status IN ('new', 'fetched')
          AND (cardinality(m.tags) > 0 OR m.summary_short IS NOT NULL)
          AND ($1::text IS NULL OR l.subject_id = $1)
        ORDER BY l.subject_id
        "#,
    )
    .bind(filter_subject)
    .fetch_all(pool)
    .await?;

    let mut affected = Vec::with_capacity(rows.len());
    for row in rows {
        let subject_id = SubjectId::from(row.get::<String, _>("subject_id").as_str());
        if !dry_run {
            let enriched_at: Option<chrono::DateTime<chrono::Utc>> = row.get("enriched_at");
            let fingerprint = enriched_at
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_else(|| "projected".to_string());
            let event_id = admin_event_id("recover-stuck", &subject_id, &fingerprint);

            ledger
                .append(
                    NewEvent::new(
                        source::admin("recover-stuck"),
                        Subject::link(subject_id.clone()),
                        EventKind::EnrichmentCompleted(EnrichmentCompleted {
                            tags: row.get("tags"),
                            summary_short: row.get("summary_short"),
                            summary_long: row.get("summary_long"),
                            language: row.get("language"),
                            model_version: row.get("model_version"),
                        }),
                    )
                    .with_event_id(event_id),
                )
                .await?;
        }
        affected.push(subject_id);
    }

    info!(count = affected.len(), dry_run, "recover-stuck");
    Ok(affected)
}

/// Summary of a `reset-bus` run.
#[derive(Debug, Clone, Copy)]
pub struct ResetSummary {
    pub streams_deleted: usize,
    pub events_reflagged: u64,
}

/// Delete every topic, clear the idempotency ledger and consumer progress,
/// and clear the `forwarded` flag on all events, enabling full replay.
pub async fn reset_bus(
    pool: &PgPool,
    bus: &RedisBus,
    events_partitions: u32,
    work_partitions: u32,
) -> Result<ResetSummary, AdminError> {
    let mut keys = Vec::new();
    for partition in 0..events_partitions {
        keys.push(stream_key(EVENTS_RAW, partition));
    }
    for kind in [WorkKind::FetchLink, WorkKind::EnrichLink, WorkKind::PublishLink] {
        for partition in 0..work_partitions {
            keys.push(stream_key(kind.topic(), partition));
        }
    }
    keys.push(stream_key(TAGS_CATALOG, 0));
    keys.push(stream_key(WORK_DEAD_LETTER, 0));

    bus.delete_streams(&keys).await?;
    progress::clear_all(pool).await?;

    let reflagged = sqlx::query("UPDATE events SET forwarded = FALSE WHERE forwarded")
        .execute(pool)
        .await?
        .rows_affected();

    info!(
        streams = keys.len(),
        reflagged, "bus reset; full replay will follow"
    );
    Ok(ResetSummary {
        streams_deleted: keys.len(),
        events_reflagged: reflagged,
    })
}

/// Narrow read model used by the ingestion endpoint and CLI summaries.
pub async fn recent_events(
    pool: &PgPool,
    limit: u32,
) -> Result<Vec<serde_json::Value>, AdminError> {
    let rows = sqlx::query(
        r#"
        SELECT event_id, occurred_at, received_at, source, subject_kind,
               subject_id, event_type, schema_version, payload,
               correlation_id, causation_id, forwarded
        FROM events
        ORDER BY received_at DESC, event_id DESC
        LIMIT $1
        "#,
    )
    .bind(i64::from(limit.min(1_000)))
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        let record = crate::ledger::record_from_row(row)?;
        events.push(serde_json::json!({
            "event_id": record.event_id,
            "occurred_at": record.occurred_at,
            "received_at": record.received_at,
            "source": record.source,
            "subject_kind": record.subject_kind.as_str(),
            "subject_id": record.subject_id,
            "event_type": record.event_type,
            "schema_version": record.schema_version,
            "payload": record.payload,
            "correlation_id": record.correlation_id,
            "causation_id": record.causation_id,
            "forwarded": record.forwarded,
        }));
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_event_ids_are_deterministic_per_state() {
        let subject = SubjectId::from("link:abc");

        let a = admin_event_id("set-visibility", &subject, "private");
        let b = admin_event_id("set-visibility", &subject, "private");
        assert_eq!(a, b);

        // Different state or tool, different id.
        assert_ne!(a, admin_event_id("set-visibility", &subject, "public"));
        assert_ne!(a, admin_event_id("retry-failed", &subject, "private"));
        assert_ne!(
            a,
            admin_event_id("set-visibility", &SubjectId::from("link:def"), "private")
        );
    }
}
