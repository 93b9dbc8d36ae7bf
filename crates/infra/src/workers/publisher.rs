//! Publish worker.
//!
//! Deliberately thin: it exists so publication is itself a fact in the
//! ledger rather than a side effect of materialization, which gives the
//! site generator an auditable trigger.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use lifestream_events::{EventKind, PublishCompleted, WorkCommand, WorkKind};

use super::{StageError, StageWorker};

pub struct Publisher;

#[async_trait]
impl StageWorker for Publisher {
    fn kind(&self) -> WorkKind {
        WorkKind::PublishLink
    }

    fn agent_name(&self) -> &'static str {
        "publisher"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn execute(&self, _work: &WorkCommand) -> Result<EventKind, StageError> {
        Ok(EventKind::PublishCompleted(PublishCompleted {
            published_at: Some(Utc::now()),
        }))
    }
}
