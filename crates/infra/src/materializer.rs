//! Materializer: projects `events.raw` into the domain state tables.
//!
//! Consumption is database-owned: the materializer never commits offsets to a
//! bus consumer group. Per message, the projection write, the idempotency
//! insert, and the progress update are one transaction; either all three
//! persist or none do.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use lifestream_events::{EventKind, EventRecord};

use crate::bus::{BusError, BusMessage, BusOffset, RedisBus, EVENTS_RAW};
use crate::projections::{self, progress};
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum MaterializerError {
    #[error("materializer database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Where to resume a partition after startup reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Read strictly after this offset (`None` = from the beginning).
    pub resume_after: Option<BusOffset>,
    /// Idempotency rows for this partition must be dropped first.
    pub truncate_ledger: bool,
    /// Messages were lost to retention; worth a warning.
    pub retention_gap: bool,
}

/// Decide where to seek on a partition at startup.
///
/// `recorded` is the highest offset in the idempotency ledger; `earliest` /
/// `latest` are the edge offsets the bus reports. A recorded position ahead
/// of everything the bus holds means the bus was recreated: drop the
/// partition's idempotency rows and reproject from the start (projections
/// are idempotent). A recorded position below `earliest` means retention ate
/// messages; replay what remains and warn.
pub fn reconcile(
    recorded: Option<BusOffset>,
    earliest: Option<BusOffset>,
    latest: Option<BusOffset>,
) -> Reconciliation {
    let desired = recorded.map(|o| o.next()).unwrap_or(BusOffset::ZERO);

    match (recorded, earliest, latest) {
        (None, _, _) => Reconciliation {
            resume_after: None,
            truncate_ledger: false,
            retention_gap: false,
        },
        (Some(_), None, _) | (Some(_), _, None) => Reconciliation {
            // We have projected offsets but the stream is empty: recreated.
            resume_after: None,
            truncate_ledger: true,
            retention_gap: false,
        },
        (Some(recorded), Some(earliest), Some(latest)) => {
            if recorded > latest {
                Reconciliation {
                    resume_after: None,
                    truncate_ledger: true,
                    retention_gap: false,
                }
            } else if desired < earliest {
                Reconciliation {
                    resume_after: None,
                    truncate_ledger: false,
                    retention_gap: true,
                }
            } else {
                Reconciliation {
                    resume_after: Some(recorded),
                    truncate_ledger: false,
                    retention_gap: false,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    pub partitions: u32,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            batch_size: 64,
            poll_interval: Duration::from_millis(250),
        }
    }
}

pub struct Materializer {
    pool: PgPool,
    bus: RedisBus,
    config: MaterializerConfig,
    poison: RetryPolicy,
}

impl Materializer {
    pub fn new(pool: PgPool, bus: RedisBus, config: MaterializerConfig) -> Self {
        Self {
            pool,
            bus,
            config,
            poison: RetryPolicy::poison_message(),
        }
    }

    /// Run until shutdown. Partitions are drained round-robin; within a
    /// partition processing is strictly sequential.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MaterializerError> {
        let mut positions = self.reconcile_all().await?;

        loop {
            if *shutdown.borrow() {
                info!("materializer stopping");
                return Ok(());
            }

            let mut projected: u64 = 0;
            let mut skipped: u64 = 0;
            for partition in 0..self.config.partitions {
                let after = positions[partition as usize];
                let batch = match self
                    .bus
                    .range_after(EVENTS_RAW, partition, after, self.config.batch_size)
                    .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(partition, error = %err, "bus read failed, will retry");
                        continue;
                    }
                };

                for message in batch {
                    match self.process(&message).await? {
                        Handled::Projected => projected += 1,
                        Handled::Skipped => skipped += 1,
                    }
                    positions[partition as usize] = Some(message.offset);
                }

                if *shutdown.borrow() {
                    break;
                }
            }

            if projected + skipped > 0 {
                info!(projected, skipped, "materializer cycle complete");
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Startup offset reconciliation for every partition.
    async fn reconcile_all(&self) -> Result<Vec<Option<BusOffset>>, MaterializerError> {
        let mut positions = Vec::with_capacity(self.config.partitions as usize);

        for partition in 0..self.config.partitions {
            let recorded = progress::highest_processed(&self.pool, EVENTS_RAW, partition).await?;
            let earliest = self.bus.earliest(EVENTS_RAW, partition).await?;
            let latest = self.bus.latest(EVENTS_RAW, partition).await?;

            let decision = reconcile(recorded, earliest, latest);
            if decision.truncate_ledger {
                let dropped =
                    progress::truncate_partition(&self.pool, EVENTS_RAW, partition).await?;
                warn!(
                    partition,
                    dropped, "bus recreated; idempotency ledger truncated, reprojecting"
                );
            }
            if decision.retention_gap {
                warn!(
                    partition,
                    ?recorded,
                    ?earliest,
                    "messages lost to retention; resuming from earliest"
                );
            }

            info!(partition, resume_after = ?decision.resume_after, "partition reconciled");
            positions.push(decision.resume_after);
        }

        Ok(positions)
    }

    /// Process one bus message end to end.
    ///
    /// Returns an error only for infrastructure failures that should pause
    /// the partition; schema errors and poison messages advance the offset
    /// and count as skips.
    async fn process(&self, message: &BusMessage) -> Result<Handled, MaterializerError> {
        if progress::is_processed(&self.pool, &message.topic, message.partition, message.offset)
            .await?
        {
            debug!(offset = %message.offset, "duplicate message dropped");
            return Ok(Handled::Skipped);
        }

        let record: EventRecord = match serde_json::from_str(&message.payload) {
            Ok(record) => record,
            Err(err) => {
                error!(
                    offset = %message.offset,
                    partition = message.partition,
                    error = %err,
                    "undecodable message body; advancing offset"
                );
                return self.record_only(message).await;
            }
        };

        let kind = match record.kind() {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                warn!(
                    event_type = %record.event_type,
                    subject_id = %record.subject_id,
                    "unknown event type dropped"
                );
                return self.record_only(message).await;
            }
            Err(err) => {
                error!(
                    event_type = %record.event_type,
                    subject_id = %record.subject_id,
                    correlation_id = ?record.correlation_id,
                    error = %err,
                    "malformed payload dropped; advancing offset"
                );
                return self.record_only(message).await;
            }
        };

        let mut attempt = 1u32;
        loop {
            match self.project(message, &record, &kind).await {
                Ok(()) => return Ok(Handled::Projected),
                Err(err) if self.poison.should_retry(attempt) => {
                    let delay = self.poison.delay_for_attempt(attempt + 1);
                    warn!(
                        offset = %message.offset,
                        subject_id = %record.subject_id,
                        attempt,
                        error = %err,
                        "projection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    // Poison message: record the offset anyway so one bad
                    // message cannot block the partition. Operator tooling
                    // re-injects a corrected event later.
                    error!(
                        offset = %message.offset,
                        subject_id = %record.subject_id,
                        correlation_id = ?record.correlation_id,
                        attempts = attempt,
                        error = %err,
                        "projection exhausted retries; offset recorded and skipped"
                    );
                    return self.record_only(message).await;
                }
            }
        }
    }

    /// Projection write + idempotency insert + progress update, atomically.
    async fn project(
        &self,
        message: &BusMessage,
        record: &EventRecord,
        kind: &EventKind,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        projections::apply_event(&mut tx, record, kind).await?;
        progress::record_processed(&mut tx, &message.topic, message.partition, message.offset)
            .await?;
        progress::update_progress(
            &mut tx,
            progress::MATERIALIZER_ROLE,
            &message.topic,
            message.partition,
            message.offset,
        )
        .await?;
        tx.commit().await
    }

    /// Advance bookkeeping without any projection effect.
    async fn record_only(&self, message: &BusMessage) -> Result<Handled, MaterializerError> {
        let mut tx = self.pool.begin().await?;
        progress::record_processed(&mut tx, &message.topic, message.partition, message.offset)
            .await?;
        progress::update_progress(
            &mut tx,
            progress::MATERIALIZER_ROLE,
            &message.topic,
            message.partition,
            message.offset,
        )
        .await?;
        tx.commit().await?;
        Ok(Handled::Skipped)
    }
}

/// What one message amounted to, for the per-cycle counters.
enum Handled {
    Projected,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(ms: u64, seq: u64) -> BusOffset {
        BusOffset::new(ms, seq)
    }

    #[test]
    fn fresh_start_reads_from_the_beginning() {
        let decision = reconcile(None, Some(offset(10, 0)), Some(offset(90, 0)));
        assert_eq!(decision.resume_after, None);
        assert!(!decision.truncate_ledger);
        assert!(!decision.retention_gap);
    }

    #[test]
    fn fresh_start_on_an_empty_stream() {
        let decision = reconcile(None, None, None);
        assert_eq!(decision.resume_after, None);
        assert!(!decision.truncate_ledger);
    }

    #[test]
    fn normal_resume_continues_after_recorded() {
        let recorded = offset(50, 2);
        let decision = reconcile(Some(recorded), Some(offset(10, 0)), Some(offset(90, 0)));
        assert_eq!(decision.resume_after, Some(recorded));
        assert!(!decision.truncate_ledger);
        assert!(!decision.retention_gap);
    }

    #[test]
    fn caught_up_is_not_mistaken_for_recreation() {
        let recorded = offset(90, 0);
        let decision = reconcile(Some(recorded), Some(offset(10, 0)), Some(recorded));
        assert_eq!(decision.resume_after, Some(recorded));
        assert!(!decision.truncate_ledger);
    }

    #[test]
    fn retention_gap_replays_whatever_remains() {
        let decision = reconcile(Some(offset(5, 0)), Some(offset(40, 0)), Some(offset(90, 0)));
        assert_eq!(decision.resume_after, None);
        assert!(decision.retention_gap);
        assert!(!decision.truncate_ledger);
    }

    #[test]
    fn recorded_past_the_log_means_recreated() {
        let decision = reconcile(
            Some(offset(200, 0)),
            Some(offset(10, 0)),
            Some(offset(90, 0)),
        );
        assert_eq!(decision.resume_after, None);
        assert!(decision.truncate_ledger);
    }

    #[test]
    fn recorded_against_an_empty_stream_means_recreated() {
        let decision = reconcile(Some(offset(50, 0)), None, None);
        assert_eq!(decision.resume_after, None);
        assert!(decision.truncate_ledger);
    }
}
