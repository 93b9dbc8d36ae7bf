//! The append-only event ledger.
//!
//! No event reaches the bus until it is durable here, and no event is marked
//! forwarded until the bus accepted it. The only permitted update is the
//! `forwarded: false → true` flip.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Mutex;
use uuid::Uuid;

use lifestream_events::{EventRecord, NewEvent};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    #[error("ledger payload error: {0}")]
    Payload(String),
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> LedgerError {
    let message = match err {
        sqlx::Error::Database(db_err) => db_err.message().to_string(),
        sqlx::Error::PoolClosed => "connection pool closed".to_string(),
        other => other.to_string(),
    };
    LedgerError::Database { operation, message }
}

/// Outcome of an append with a caller-supplied event id.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(EventRecord),
    /// The id already exists; the ledger is unchanged.
    Duplicate(Uuid),
}

impl AppendOutcome {
    pub fn record(&self) -> Option<&EventRecord> {
        match self {
            AppendOutcome::Appended(record) => Some(record),
            AppendOutcome::Duplicate(_) => None,
        }
    }
}

/// Append-only event ledger.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Insert a new fact with `forwarded = false`.
    ///
    /// A caller-supplied `event_id` that already exists is a no-op
    /// (idempotent re-emission); everything else fails only on
    /// infrastructure error.
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome, LedgerError>;

    /// Up to `limit` unforwarded events, ordered by `received_at` ascending,
    /// tie-broken by `event_id`.
    async fn read_unforwarded(&self, limit: u32) -> Result<Vec<EventRecord>, LedgerError>;

    /// Flip `forwarded` for the given ids. Already-forwarded ids are no-ops.
    async fn mark_forwarded(&self, event_ids: &[Uuid]) -> Result<u64, LedgerError>;
}

/// Postgres-backed ledger.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLedger for PostgresLedger {
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome, LedgerError> {
        let event_id = event.event_id.unwrap_or_else(Uuid::now_v7);
        let event_type = event.kind.event_type();
        let schema_version = event.kind.schema_version();
        let payload = event
            .kind
            .payload()
            .map_err(|e| LedgerError::Payload(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, occurred_at, source, subject_kind, subject_id,
                event_type, schema_version, payload, correlation_id, causation_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING received_at
            "#,
        )
        .bind(event_id)
        .bind(event.occurred_at)
        .bind(&event.source)
        .bind(event.subject.kind.as_str())
        .bind(event.subject.id.as_str())
        .bind(event_type)
        .bind(schema_version)
        .bind(&payload)
        .bind(event.correlation_id)
        .bind(event.causation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        let Some(row) = row else {
            return Ok(AppendOutcome::Duplicate(event_id));
        };
        let received_at = row
            .try_get("received_at")
            .map_err(|e| map_sqlx_error("append", e.into()))?;

        Ok(AppendOutcome::Appended(EventRecord {
            event_id,
            occurred_at: event.occurred_at,
            received_at,
            source: event.source,
            subject_kind: event.subject.kind,
            subject_id: event.subject.id,
            event_type: event_type.to_string(),
            schema_version,
            payload,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
            forwarded: false,
        }))
    }

    async fn read_unforwarded(&self, limit: u32) -> Result<Vec<EventRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, occurred_at, received_at, source, subject_kind,
                   subject_id, event_type, schema_version, payload,
                   correlation_id, causation_id, forwarded
            FROM events
            WHERE NOT forwarded
            ORDER BY received_at ASC, event_id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_unforwarded", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn mark_forwarded(&self, event_ids: &[Uuid]) -> Result<u64, LedgerError> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE events SET forwarded = TRUE WHERE event_id = ANY($1) AND NOT forwarded",
        )
        .bind(event_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_forwarded", e))?;

        Ok(result.rows_affected())
    }
}

pub(crate) fn record_from_row(row: &PgRow) -> Result<EventRecord, LedgerError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_row", e);
    let subject_kind: String = row.try_get("subject_kind").map_err(get)?;
    let subject_id: String = row.try_get("subject_id").map_err(get)?;

    Ok(EventRecord {
        event_id: row.try_get("event_id").map_err(get)?,
        occurred_at: row.try_get("occurred_at").map_err(get)?,
        received_at: row.try_get("received_at").map_err(get)?,
        source: row.try_get("source").map_err(get)?,
        subject_kind: subject_kind
            .parse()
            .map_err(|e| LedgerError::Payload(format!("{e}")))?,
        subject_id: subject_id.into(),
        event_type: row.try_get("event_type").map_err(get)?,
        schema_version: row.try_get("schema_version").map_err(get)?,
        payload: row.try_get("payload").map_err(get)?,
        correlation_id: row.try_get("correlation_id").map_err(get)?,
        causation_id: row.try_get("causation_id").map_err(get)?,
        forwarded: row.try_get("forwarded").map_err(get)?,
    })
}

/// In-memory ledger for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<Vec<EventRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far, in insertion order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().expect("ledger lock").clone()
    }
}

#[async_trait]
impl EventLedger for InMemoryLedger {
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome, LedgerError> {
        let event_id = event.event_id.unwrap_or_else(Uuid::now_v7);
        let payload = event
            .kind
            .payload()
            .map_err(|e| LedgerError::Payload(e.to_string()))?;

        let mut records = self.records.lock().expect("ledger lock");
        if records.iter().any(|r| r.event_id == event_id) {
            return Ok(AppendOutcome::Duplicate(event_id));
        }

        let record = EventRecord {
            event_id,
            occurred_at: event.occurred_at,
            received_at: Utc::now(),
            source: event.source,
            subject_kind: event.subject.kind,
            subject_id: event.subject.id,
            event_type: event.kind.event_type().to_string(),
            schema_version: event.kind.schema_version(),
            payload,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
            forwarded: false,
        };
        records.push(record.clone());
        Ok(AppendOutcome::Appended(record))
    }

    async fn read_unforwarded(&self, limit: u32) -> Result<Vec<EventRecord>, LedgerError> {
        let records = self.records.lock().expect("ledger lock");
        let mut unforwarded: Vec<EventRecord> =
            records.iter().filter(|r| !r.forwarded).cloned().collect();
        unforwarded.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then(a.event_id.cmp(&b.event_id))
        });
        unforwarded.truncate(limit as usize);
        Ok(unforwarded)
    }

    async fn mark_forwarded(&self, event_ids: &[Uuid]) -> Result<u64, LedgerError> {
        let mut records = self.records.lock().expect("ledger lock");
        let mut changed = 0;
        for record in records.iter_mut() {
            if !record.forwarded && event_ids.contains(&record.event_id) {
                record.forwarded = true;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifestream_core::{Subject, SubjectId};
    use lifestream_events::{EventKind, LinkAdded};

    fn link_added(id: &str) -> NewEvent {
        NewEvent::new(
            "chrome",
            Subject::link(SubjectId::from(id)),
            EventKind::LinkAdded(LinkAdded {
                url: "https://example.com/".into(),
                url_norm: None,
            }),
        )
    }

    #[tokio::test]
    async fn append_then_read_unforwarded_in_order() {
        let ledger = InMemoryLedger::new();
        for i in 0..3 {
            ledger
                .append(link_added(&format!("link:{i}")))
                .await
                .unwrap();
        }

        let batch = ledger.read_unforwarded(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.windows(2).all(|w| (
            w[0].received_at,
            w[0].event_id
        ) <= (w[1].received_at, w[1].event_id)));
    }

    #[tokio::test]
    async fn caller_supplied_id_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::now_v7();

        let first = ledger
            .append(link_added("link:a").with_event_id(id))
            .await
            .unwrap();
        assert!(matches!(first, AppendOutcome::Appended(_)));

        let second = ledger
            .append(link_added("link:a").with_event_id(id))
            .await
            .unwrap();
        assert_eq!(second, AppendOutcome::Duplicate(id));
        assert_eq!(ledger.records().len(), 1);
    }

    #[tokio::test]
    async fn mark_forwarded_is_a_no_op_on_forwarded_rows() {
        let ledger = InMemoryLedger::new();
        let outcome = ledger.append(link_added("link:a")).await.unwrap();
        let id = outcome.record().unwrap().event_id;

        assert_eq!(ledger.mark_forwarded(&[id]).await.unwrap(), 1);
        assert_eq!(ledger.mark_forwarded(&[id]).await.unwrap(), 0);
        assert!(ledger.read_unforwarded(10).await.unwrap().is_empty());
    }
}
