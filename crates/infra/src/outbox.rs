//! Outbox forwarder: ledger → bus, in arrival order.
//!
//! At-least-once: when publishing succeeds but marking fails, the next cycle
//! republishes and the materializer's dedupe absorbs the duplicates.
//! Per-subject order holds because the batch is read in `received_at` order
//! and the bus preserves per-key order.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lifestream_events::EventRecord;

use crate::bus::{BusError, RedisBus};
use crate::ledger::{EventLedger, LedgerError};
use crate::retry::RetryPolicy;

/// Where forwarded events go. Seam for tests; production uses the bus.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, record: &EventRecord) -> Result<(), BusError>;
}

/// Publishes to `events.raw`, partitioned by subject id.
pub struct BusEventSink {
    bus: RedisBus,
    partitions: u32,
}

impl BusEventSink {
    pub fn new(bus: RedisBus, partitions: u32) -> Self {
        Self { bus, partitions }
    }
}

#[async_trait]
impl EventSink for BusEventSink {
    async fn publish(&self, record: &EventRecord) -> Result<(), BusError> {
        self.bus.publish_event(record, self.partitions).await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox giving up after {failures} consecutive failed cycles: {last_error}")]
    Fatal { failures: u32, last_error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("publish failed for event {event_id}: {source}")]
    Publish {
        event_id: uuid::Uuid,
        #[source]
        source: BusError,
    },
}

pub struct OutboxForwarder<L, S> {
    ledger: L,
    sink: S,
    config: OutboxConfig,
    backoff: RetryPolicy,
}

impl<L, S> OutboxForwarder<L, S>
where
    L: EventLedger,
    S: EventSink,
{
    pub fn new(ledger: L, sink: S, config: OutboxConfig) -> Self {
        Self {
            ledger,
            sink,
            config,
            backoff: RetryPolicy::bus_publish(),
        }
    }

    /// Run until shutdown. Returns an error only on the fatal condition, so
    /// a supervisor can restart the process.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), OutboxError> {
        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("outbox stopping");
                return Ok(());
            }

            match self.cycle().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(forwarded) => {
                    consecutive_failures = 0;
                    info!(forwarded, "outbox cycle complete");
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        error!(failures = consecutive_failures, error = %err, "outbox fatal");
                        return Err(OutboxError::Fatal {
                            failures: consecutive_failures,
                            last_error: err.to_string(),
                        });
                    }

                    let delay = self.backoff.delay_for_attempt(consecutive_failures + 1);
                    warn!(
                        failures = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "outbox cycle failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One forwarding cycle: read a batch, publish in order, mark forwarded.
    ///
    /// On a mid-batch publish failure the already-published prefix is still
    /// marked, keeping the duplicate window as small as the failure allows.
    pub async fn cycle(&self) -> Result<usize, CycleError> {
        let batch = self.ledger.read_unforwarded(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut published: Vec<uuid::Uuid> = Vec::with_capacity(batch.len());
        let mut failure: Option<CycleError> = None;

        for record in &batch {
            match self.sink.publish(record).await {
                Ok(()) => published.push(record.event_id),
                Err(source) => {
                    failure = Some(CycleError::Publish {
                        event_id: record.event_id,
                        source,
                    });
                    break;
                }
            }
        }

        if !published.is_empty() {
            self.ledger.mark_forwarded(&published).await?;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(published.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use lifestream_core::{Subject, SubjectId};
    use lifestream_events::{EventKind, LinkAdded, NewEvent};

    use crate::ledger::InMemoryLedger;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<uuid::Uuid>>,
        fail_all: AtomicBool,
        fail_after: AtomicUsize,
    }

    impl RecordingSink {
        fn published(&self) -> Vec<uuid::Uuid> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, record: &EventRecord) -> Result<(), BusError> {
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(BusError::Connection("bus down".into()));
            }
            let limit = self.fail_after.load(Ordering::SeqCst);
            if limit > 0 && self.published.lock().unwrap().len() >= limit {
                return Err(BusError::Connection("bus down".into()));
            }
            self.published.lock().unwrap().push(record.event_id);
            Ok(())
        }
    }

    fn link_added(i: usize) -> NewEvent {
        NewEvent::new(
            "chrome",
            Subject::link(SubjectId::from(format!("link:{i:04}").as_str())),
            EventKind::LinkAdded(LinkAdded {
                url: format!("https://example.com/{i}"),
                url_norm: None,
            }),
        )
    }

    async fn seeded_ledger(n: usize) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for i in 0..n {
            ledger.append(link_added(i)).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn cycle_publishes_in_arrival_order_and_marks_forwarded() {
        let ledger = seeded_ledger(3).await;
        let expected: Vec<_> = ledger
            .read_unforwarded(10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.event_id)
            .collect();

        let forwarder =
            OutboxForwarder::new(ledger, RecordingSink::default(), OutboxConfig::default());
        let forwarded = forwarder.cycle().await.unwrap();

        assert_eq!(forwarded, 3);
        assert_eq!(forwarder.sink.published(), expected);
        assert!(forwarder
            .ledger
            .read_unforwarded(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mid_batch_failure_marks_only_the_published_prefix() {
        let ledger = seeded_ledger(3).await;
        let sink = RecordingSink::default();
        sink.fail_after.store(2, Ordering::SeqCst);

        let forwarder = OutboxForwarder::new(ledger, sink, OutboxConfig::default());
        let err = forwarder.cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Publish { .. }));

        let remaining = forwarder.ledger.read_unforwarded(10).await.unwrap();
        assert_eq!(remaining.len(), 1);

        // Next cycle picks up exactly the unforwarded tail.
        forwarder.sink.fail_after.store(0, Ordering::SeqCst);
        assert_eq!(forwarder.cycle().await.unwrap(), 1);
        assert_eq!(forwarder.sink.published().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_become_fatal() {
        let ledger = seeded_ledger(1).await;
        let sink = RecordingSink::default();
        sink.fail_all.store(true, Ordering::SeqCst);

        let config = OutboxConfig {
            max_consecutive_failures: 5,
            ..OutboxConfig::default()
        };
        let forwarder = OutboxForwarder::new(ledger, sink, config);

        let (_tx, rx) = watch::channel(false);
        let err = forwarder.run(rx).await.unwrap_err();
        let OutboxError::Fatal { failures, .. } = err;
        assert_eq!(failures, 5);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_cleanly() {
        let ledger = seeded_ledger(0).await;
        let forwarder = OutboxForwarder::new(
            ledger,
            RecordingSink::default(),
            OutboxConfig::default(),
        );

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        forwarder.run(rx).await.unwrap();
    }
}
