//! `lifestream-events`: the fact catalog and derived work contracts.
//!
//! Events are immutable, versioned, and append-only. The ledger stores them
//! as self-describing documents; this crate owns the typed decode at the
//! boundary so everything downstream of it stays typed.

pub mod catalog;
pub mod record;
pub mod status;
pub mod work;

pub use catalog::{
    AnnotationAdded, ContentFetched, EnrichmentCompleted, EventKind, LinkAdded,
    LinkVisibilityChanged, PayloadError, PublishCompleted, TempReadingRecorded, TodoCompleted,
    TodoCreated, WorkFailed,
};
pub use record::{source, EventRecord, NewEvent};
pub use status::{LinkStatus, Visibility};
pub use work::{DeadLetterRecord, EnrichPayload, FetchPayload, WorkCommand, WorkKind};
