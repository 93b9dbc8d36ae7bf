//! Worker pools: one single-responsibility consumer per work topic.
//!
//! Shared contract: parse the command, perform the unit of work under the
//! stage timeout, then append either a completion fact or `work.failed` to
//! the ledger with the command's correlation id. The router owns what
//! happens after a failure; workers never retry on their own.

pub mod enricher;
pub mod fetcher;
pub mod publisher;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lifestream_core::{Subject, SubjectKind};
use lifestream_events::{source, EventKind, NewEvent, WorkCommand, WorkFailed, WorkKind};

use crate::bus::{BusError, BusMessage, RedisBus};
use crate::ledger::{EventLedger, LedgerError};
use crate::retry::RetryPolicy;

/// A stage failure. Whether it is retried is the router's call, driven by
/// the command's attempt budget.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One unit of stage work.
#[async_trait]
pub trait StageWorker: Send + Sync {
    fn kind(&self) -> WorkKind;
    fn agent_name(&self) -> &'static str;

    /// Stage-appropriate budget for one unit of work.
    fn timeout(&self) -> Duration;

    async fn execute(&self, work: &WorkCommand) -> Result<EventKind, StageError>;
}

/// Run one work command to its ledger effect.
///
/// Success appends the stage's completion fact; failure (including timeout)
/// appends `work.failed` carrying the full command. Both copy the command's
/// correlation id and cite the triggering event as causation.
pub async fn complete_work<W, L>(
    stage: &W,
    ledger: &L,
    work: &WorkCommand,
) -> Result<(), LedgerError>
where
    W: StageWorker,
    L: EventLedger,
{
    let outcome = match tokio::time::timeout(stage.timeout(), stage.execute(work)).await {
        Ok(result) => result,
        Err(_) => Err(StageError::new(format!(
            "{} timed out after {:?}",
            stage.agent_name(),
            stage.timeout()
        ))),
    };

    let subject = Subject::new(
        work.subject_id.kind().unwrap_or(SubjectKind::Link),
        work.subject_id.clone(),
    );
    let agent = source::agent(stage.agent_name());

    let kind = match outcome {
        Ok(kind) => {
            info!(
                subject_id = %work.subject_id,
                work_type = %work.work_type,
                attempt = work.attempt,
                correlation_id = %work.correlation_id,
                "work completed"
            );
            kind
        }
        Err(err) => {
            warn!(
                subject_id = %work.subject_id,
                work_type = %work.work_type,
                attempt = work.attempt,
                correlation_id = %work.correlation_id,
                error = %err,
                "work failed"
            );
            EventKind::WorkFailed(WorkFailed {
                work_message: work.clone(),
                error: err.to_string(),
                agent: stage.agent_name().to_string(),
            })
        }
    };

    ledger
        .append(
            NewEvent::new(agent, subject, kind)
                .correlated(work.correlation_id)
                .caused_by(work.triggered_by_event_id),
        )
        .await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("worker giving up on message {offset} after {attempts} attempts: {last_error}")]
    Fatal {
        offset: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub partitions: u32,
    pub batch_size: usize,
    pub block: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            batch_size: 8,
            block: Duration::from_millis(250),
        }
    }
}

/// Consumer loop shared by all stages.
pub struct WorkerLoop<W, L> {
    bus: RedisBus,
    stage: W,
    ledger: L,
    config: WorkerConfig,
    consumer_name: String,
    transient: RetryPolicy,
}

impl<W, L> WorkerLoop<W, L>
where
    W: StageWorker,
    L: EventLedger,
{
    pub fn new(bus: RedisBus, stage: W, ledger: L, config: WorkerConfig) -> Self {
        let consumer_name = format!("{}-{}", stage.agent_name(), std::process::id());
        Self {
            bus,
            stage,
            ledger,
            config,
            consumer_name,
            transient: RetryPolicy::poison_message(),
        }
    }

    fn group(&self) -> String {
        format!("worker:{}", self.stage.kind())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let topic = self.stage.kind().topic();
        let group = self.group();

        for partition in 0..self.config.partitions {
            self.bus.ensure_group(topic, partition, &group).await?;
        }

        loop {
            if *shutdown.borrow() {
                info!(agent = self.stage.agent_name(), "worker stopping");
                return Ok(());
            }

            let mut idle = true;
            for partition in 0..self.config.partitions {
                let batch = match self
                    .bus
                    .next_batch(
                        topic,
                        partition,
                        &group,
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
                        .ack(topic, partition, &group, &[message.offset])
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

    async fn handle_with_retries(&self, message: &BusMessage) -> Result<(), WorkerError> {
        let work: WorkCommand = match serde_json::from_str(&message.payload) {
            Ok(work) => work,
            Err(err) => {
                error!(offset = %message.offset, error = %err, "undecodable work command dropped");
                return Ok(());
            }
        };

        // The ledger append is the only part retried here; the stage itself
        // ran exactly once and its outcome is already decided.
        let mut attempt = 1u32;
        loop {
            match complete_work(&self.stage, &self.ledger, &work).await {
                Ok(()) => return Ok(()),
                Err(err) if self.transient.should_retry(attempt) => {
                    warn!(
                        offset = %message.offset,
                        subject_id = %work.subject_id,
                        attempt,
                        error = %err,
                        "ledger append failed, retrying"
                    );
                    tokio::time::sleep(self.transient.delay_for_attempt(attempt + 1)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(WorkerError::Fatal {
                        offset: message.offset.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifestream_core::SubjectId;
    use lifestream_events::PublishCompleted;
    use serde_json::json;
    use uuid::Uuid;

    use crate::ledger::InMemoryLedger;

    struct FakeStage {
        fail: bool,
        hang: bool,
    }

    #[async_trait]
    impl StageWorker for FakeStage {
        fn kind(&self) -> WorkKind {
            WorkKind::PublishLink
        }

        fn agent_name(&self) -> &'static str {
            "publisher"
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn execute(&self, _work: &WorkCommand) -> Result<EventKind, StageError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(StageError::new("stage exploded"));
            }
            Ok(EventKind::PublishCompleted(PublishCompleted {
                published_at: None,
            }))
        }
    }

    fn work() -> WorkCommand {
        WorkCommand::first_attempt(
            SubjectId::from("link:abc"),
            WorkKind::PublishLink,
            Uuid::now_v7(),
            Uuid::now_v7(),
            3,
            json!({}),
        )
    }

    #[tokio::test]
    async fn success_appends_a_correlated_completion_fact() {
        let ledger = InMemoryLedger::new();
        let work = work();

        complete_work(
            &FakeStage {
                fail: false,
                hang: false,
            },
            &ledger,
            &work,
        )
        .await
        .unwrap();

        let records = ledger.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.event_type, "publish.completed");
        assert_eq!(record.source, "agent:publisher");
        assert_eq!(record.correlation_id, Some(work.correlation_id));
        assert_eq!(record.causation_id, Some(work.triggered_by_event_id));
        assert_eq!(record.subject_id, work.subject_id);
    }

    #[tokio::test]
    async fn failure_appends_work_failed_with_the_full_command() {
        let ledger = InMemoryLedger::new();
        let work = work();

        complete_work(
            &FakeStage {
                fail: true,
                hang: false,
            },
            &ledger,
            &work,
        )
        .await
        .unwrap();

        let records = ledger.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.event_type, "work.failed");
        assert_eq!(record.correlation_id, Some(work.correlation_id));

        let Some(EventKind::WorkFailed(failed)) = record.kind().unwrap() else {
            panic!("expected a work.failed payload");
        };
        assert_eq!(failed.work_message, work);
        assert_eq!(failed.error, "stage exploded");
        assert_eq!(failed.agent, "publisher");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_become_work_failed() {
        let ledger = InMemoryLedger::new();

        complete_work(
            &FakeStage {
                fail: false,
                hang: true,
            },
            &ledger,
            &work(),
        )
        .await
        .unwrap();

        let records = ledger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "work.failed");
        let Some(EventKind::WorkFailed(failed)) = records[0].kind().unwrap() else {
            panic!("expected a work.failed payload");
        };
        assert!(failed.error.contains("timed out"));
    }
}
