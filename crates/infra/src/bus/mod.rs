//! Log-based message bus over Redis Streams.
//!
//! Mapping: a topic partition is one stream key (`ls:{topic}:{partition}`),
//! an offset is a stream entry id (`ms-seq`, totally ordered), headers are
//! stream fields. The bus is a disposable surface: the database owns what
//! has been projected, so streams can be deleted and replayed at any time.

mod redis;

pub use self::redis::RedisBus;

use core::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

use lifestream_core::SubjectId;

/// Primary fact stream; partitioned by subject id.
pub const EVENTS_RAW: &str = "events.raw";
/// Compacted tag vocabulary; single partition, single key.
pub const TAGS_CATALOG: &str = "tags.catalog";
/// Work that exhausted its retries; single partition.
pub const WORK_DEAD_LETTER: &str = "work.dead_letter";

/// Retention for fact and work topics.
pub const EVENT_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1_000;
/// Retention for dead-letter records.
pub const DEAD_LETTER_RETENTION_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus command error: {0}")]
    Command(String),

    #[error("bus payload error: {0}")]
    Payload(String),
}

impl From<::redis::RedisError> for BusError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            BusError::Connection(err.to_string())
        } else {
            BusError::Command(err.to_string())
        }
    }
}

/// Stream key for a topic partition.
pub fn stream_key(topic: &str, partition: u32) -> String {
    format!("ls:{topic}:{partition}")
}

/// Stable partition assignment for a message key.
///
/// Uses a cryptographic digest rather than the standard hasher so every
/// process agrees on the assignment across runs and versions.
pub fn partition_for(subject_id: &SubjectId, partitions: u32) -> u32 {
    let digest = Sha256::digest(subject_id.as_str().as_bytes());
    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    word % partitions.max(1)
}

/// A position in a stream partition (Redis entry id `ms-seq`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusOffset {
    pub ms: u64,
    pub seq: u64,
}

impl BusOffset {
    pub const ZERO: BusOffset = BusOffset { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The smallest offset strictly after this one.
    pub fn next(&self) -> Self {
        Self {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }
}

impl core::fmt::Display for BusOffset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for BusOffset {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| BusError::Payload(format!("malformed stream offset: {s}")))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| BusError::Payload(format!("malformed stream offset: {s}")))
        };
        Ok(Self {
            ms: parse(ms)?,
            seq: parse(seq)?,
        })
    }
}

/// A message read from a stream partition.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: BusOffset,
    /// Message key (subject id for fact and work topics).
    pub key: String,
    pub event_type: Option<String>,
    pub source: Option<String>,
    /// Serialized body (an `EventRecord`, `WorkCommand`, or tag set).
    pub payload: String,
}
