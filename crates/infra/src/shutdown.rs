//! Graceful shutdown: signal capture and the drain deadline.
//!
//! On SIGINT/SIGTERM every component stops taking new work, finishes its
//! in-flight unit (including the database transaction), flushes pending bus
//! writes, and exits. A hard deadline bounds how long draining may take.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

/// How long a component may take to drain after the signal.
pub const HARD_DEADLINE: Duration = Duration::from_secs(30);

/// Spawn the signal listener. The returned receiver flips to `true` once on
/// SIGINT or SIGTERM.
pub fn signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "cannot listen for SIGTERM, falling back to SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Drive a component future to completion, bounding its post-signal drain by
/// [`HARD_DEADLINE`]. Returns `None` if the deadline expired.
pub async fn drain_with_deadline<F>(mut shutdown: watch::Receiver<bool>, task: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    tokio::pin!(task);

    if !*shutdown.borrow() {
        tokio::select! {
            output = &mut task => return Some(output),
            _ = async {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            } => {}
        }
    }

    match tokio::time::timeout(HARD_DEADLINE, task).await {
        Ok(output) => Some(output),
        Err(_) => {
            error!(deadline_secs = HARD_DEADLINE.as_secs(), "shutdown deadline exceeded");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_without_any_signal() {
        let (_tx, rx) = watch::channel(false);
        let result = drain_with_deadline(rx, async { 7 }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn drains_within_the_deadline_after_a_signal() {
        let (tx, rx) = watch::channel(false);
        let mut signal_view = rx.clone();

        let task = async move {
            // Simulates a loop that notices the signal and finishes its unit.
            let _ = signal_view.changed().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            "drained"
        };

        let driver = tokio::spawn(drain_with_deadline(rx, task));
        tx.send(true).unwrap();
        assert_eq!(driver.await.unwrap(), Some("drained"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_components_hit_the_deadline() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = drain_with_deadline(rx, std::future::pending::<()>()).await;
        assert_eq!(result, None);
    }
}
