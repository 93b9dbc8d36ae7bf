//! Per-hostname request pacing for the fetch worker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token bucket per hostname, capacity 1, refilling once per interval.
///
/// `acquire` suspends until the host's bucket has a token, so within any
/// interval-sized window at most one request leaves for a given host.
#[derive(Debug)]
pub struct HostRateLimiter {
    min_interval: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl HostRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `host` is allowed, then claim the slot.
    pub async fn acquire(&self, host: &str) {
        loop {
            let wait = {
                let mut slots = self.next_allowed.lock().expect("rate limiter lock");
                let now = Instant::now();
                match slots.get(host) {
                    Some(next) if *next > now => *next - now,
                    _ => {
                        slots.insert(host.to_string(), now + self.min_interval);
                        return;
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_request_to_same_host_waits_for_the_interval() {
        let limiter = HostRateLimiter::new(Duration::from_secs(1));

        let start = Instant::now();
        limiter.acquire("example.com").await;
        limiter.acquire("example.com").await;

        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn different_hosts_do_not_block_each_other() {
        let limiter = HostRateLimiter::new(Duration::from_secs(1));

        let start = Instant::now();
        limiter.acquire("a.example.com").await;
        limiter.acquire("b.example.com").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
