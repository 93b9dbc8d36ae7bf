//! Infrastructure layer: ledger, bus, pipeline loops, and projections.
//!
//! Everything here is tokio-native. The per-partition sequential invariant is
//! owned by the loops in this crate: each consumer processes one partition's
//! messages strictly in order, and parallelism comes from running more
//! processes, not from concurrent handling within a partition.

pub mod admin;
pub mod bus;
pub mod config;
pub mod db;
pub mod ledger;
pub mod materializer;
pub mod outbox;
#[cfg(test)]
mod pipeline_tests;
pub mod projections;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod shutdown;
pub mod tags;
pub mod workers;

pub use config::{Config, ConfigError};
pub use ledger::{AppendOutcome, EventLedger, InMemoryLedger, LedgerError, PostgresLedger};
