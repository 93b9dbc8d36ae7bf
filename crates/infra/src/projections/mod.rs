//! Projection handlers (read model builders).
//!
//! A handler is a function `(transaction, event) → ()`; the table below keys
//! them by event type. The materializer wraps each call in the same
//! transaction as the idempotency insert and progress update.

pub mod annotations;
pub mod links;
pub mod progress;
pub mod sensors;
pub mod todos;

use sqlx::{Postgres, Transaction};

use lifestream_events::{EventKind, EventRecord};

/// Apply the projection effect of a typed event.
pub async fn apply_event(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    kind: &EventKind,
) -> Result<(), sqlx::Error> {
    match kind {
        EventKind::LinkAdded(payload) => links::link_added(tx, record, payload).await,
        EventKind::ContentFetched(payload) => links::content_fetched(tx, record, payload).await,
        EventKind::EnrichmentCompleted(payload) => {
            links::enrichment_completed(tx, record, payload).await
        }
        EventKind::PublishCompleted(payload) => {
            links::publish_completed(tx, record, payload).await
        }
        EventKind::LinkVisibilityChanged(payload) => {
            links::visibility_changed(tx, record, payload).await
        }
        // Operational fact. The router reacts with retry/DLQ; the read model
        // changes only through the events that reaction produces.
        EventKind::WorkFailed(_) => Ok(()),
        EventKind::TempReadingRecorded(payload) => {
            sensors::reading_recorded(tx, record, payload).await
        }
        EventKind::TodoCreated(payload) => todos::created(tx, record, payload).await,
        EventKind::TodoCompleted(_) => todos::completed(tx, record).await,
        EventKind::AnnotationAdded(payload) => annotations::added(tx, record, payload).await,
    }
}
