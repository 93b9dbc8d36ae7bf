//! Redis Streams bus client.
//!
//! Producers are long-lived and shared per process (the multiplexed
//! connection is cloned per call). Retention is enforced at publish time by
//! `MINID` trimming, so a stream never grows past its window by more than
//! the approximation Redis allows.

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::MultiplexedConnection;

use lifestream_events::{DeadLetterRecord, EventRecord, WorkCommand};

use super::{
    partition_for, stream_key, BusError, BusMessage, BusOffset, DEAD_LETTER_RETENTION_MS,
    EVENTS_RAW, EVENT_RETENTION_MS, TAGS_CATALOG, WORK_DEAD_LETTER,
};

/// Entries kept on the compacted tag topic; only the newest one is read.
const TAGS_KEEP_ENTRIES: usize = 8;

type StreamEntry = (String, HashMap<String, String>);

#[derive(Clone)]
pub struct RedisBus {
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the bus. The connection is shared for the process lifetime.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Publish a fact to `events.raw`, keyed and partitioned by subject id.
    pub async fn publish_event(
        &self,
        record: &EventRecord,
        partitions: u32,
    ) -> Result<BusOffset, BusError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| BusError::Payload(e.to_string()))?;
        let partition = partition_for(&record.subject_id, partitions);
        self.xadd(
            EVENTS_RAW,
            partition,
            record.subject_id.as_str(),
            &[
                ("event_type", record.event_type.as_str()),
                ("source", record.source.as_str()),
            ],
            &payload,
            EVENT_RETENTION_MS,
        )
        .await
    }

    /// Publish a work command to its stage topic, keyed by subject id.
    pub async fn publish_work(
        &self,
        work: &WorkCommand,
        partitions: u32,
    ) -> Result<BusOffset, BusError> {
        let payload = serde_json::to_string(work)
            .map_err(|e| BusError::Payload(e.to_string()))?;
        let partition = partition_for(&work.subject_id, partitions);
        self.xadd(
            work.work_type.topic(),
            partition,
            work.subject_id.as_str(),
            &[("work_type", work.work_type.as_str())],
            &payload,
            EVENT_RETENTION_MS,
        )
        .await
    }

    /// Publish a dead-letter record (single partition, longer retention).
    pub async fn publish_dead_letter(
        &self,
        record: &DeadLetterRecord,
    ) -> Result<BusOffset, BusError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| BusError::Payload(e.to_string()))?;
        self.xadd(
            WORK_DEAD_LETTER,
            0,
            record.original_work.subject_id.as_str(),
            &[("work_type", record.original_work.work_type.as_str())],
            &payload,
            DEAD_LETTER_RETENTION_MS,
        )
        .await
    }

    /// Replace the compacted tag catalog with the given full sorted set.
    pub async fn publish_tags(&self, tags: &[String]) -> Result<(), BusError> {
        let payload = serde_json::to_string(tags)
            .map_err(|e| BusError::Payload(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(stream_key(TAGS_CATALOG, 0))
            .arg("MAXLEN")
            .arg("~")
            .arg(TAGS_KEEP_ENTRIES)
            .arg("*")
            .arg("key")
            .arg("catalog")
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Read the current tag catalog (the newest entry wins; compaction).
    pub async fn read_compacted_tags(&self) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let entries: Vec<StreamEntry> = redis::cmd("XREVRANGE")
            .arg(stream_key(TAGS_CATALOG, 0))
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some((_, fields)) = entries.into_iter().next() else {
            return Ok(Vec::new());
        };
        let payload = fields
            .get("payload")
            .ok_or_else(|| BusError::Payload("tag entry missing payload field".to_string()))?;
        serde_json::from_str(payload).map_err(|e| BusError::Payload(e.to_string()))
    }

    /// Ensure a consumer group exists (idempotent).
    pub async fn ensure_group(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key(topic, partition))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read new messages for a consumer group (blocking up to `block_ms`).
    pub async fn read_group(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<(String, Vec<StreamEntry>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream_key(topic, partition))
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut messages = Vec::new();
        for (_, entries) in reply.into_iter().flatten() {
            for entry in entries {
                messages.push(message_from_entry(topic, partition, entry)?);
            }
        }
        Ok(messages)
    }

    /// Messages delivered to this consumer but never acknowledged (crash
    /// recovery). Reading with id `0` returns the pending entries.
    pub async fn read_group_pending(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<(String, Vec<StreamEntry>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream_key(topic, partition))
            .arg("0")
            .query_async(&mut conn)
            .await?;

        let mut messages = Vec::new();
        for (_, entries) in reply.into_iter().flatten() {
            for entry in entries {
                messages.push(message_from_entry(topic, partition, entry)?);
            }
        }
        Ok(messages)
    }

    /// Pending entries first, then new ones, so a consumer that crashed mid
    /// batch finishes its leftovers before taking more work.
    pub async fn next_batch(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<BusMessage>, BusError> {
        let pending = self
            .read_group_pending(topic, partition, group, consumer, count)
            .await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read_group(topic, partition, group, consumer, count, block_ms)
            .await
    }

    /// Acknowledge processed messages for a consumer group.
    pub async fn ack(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        offsets: &[BusOffset],
    ) -> Result<(), BusError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream_key(topic, partition)).arg(group);
        for offset in offsets {
            cmd.arg(offset.to_string());
        }
        let _: u64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// Read messages strictly after `after` (`None` = from the beginning).
    pub async fn range_after(
        &self,
        topic: &str,
        partition: u32,
        after: Option<BusOffset>,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let start = match after {
            Some(offset) => format!("({offset}"),
            None => "-".to_string(),
        };

        let mut conn = self.conn.clone();
        let entries: Vec<StreamEntry> = redis::cmd("XRANGE")
            .arg(stream_key(topic, partition))
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        entries
            .into_iter()
            .map(|entry| message_from_entry(topic, partition, entry))
            .collect()
    }

    /// Oldest available offset on a partition, if any.
    pub async fn earliest(
        &self,
        topic: &str,
        partition: u32,
    ) -> Result<Option<BusOffset>, BusError> {
        self.edge_offset(topic, partition, "XRANGE", "-", "+").await
    }

    /// Newest available offset on a partition, if any.
    pub async fn latest(
        &self,
        topic: &str,
        partition: u32,
    ) -> Result<Option<BusOffset>, BusError> {
        self.edge_offset(topic, partition, "XREVRANGE", "+", "-").await
    }

    async fn edge_offset(
        &self,
        topic: &str,
        partition: u32,
        command: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<BusOffset>, BusError> {
        let mut conn = self.conn.clone();
        let entries: Vec<StreamEntry> = redis::cmd(command)
            .arg(stream_key(topic, partition))
            .arg(from)
            .arg(to)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        match entries.into_iter().next() {
            Some((id, _)) => Ok(Some(id.parse()?)),
            None => Ok(None),
        }
    }

    /// Delete stream keys outright (used by `reset-bus`).
    pub async fn delete_streams(&self, keys: &[String]) -> Result<(), BusError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let _: u64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn xadd(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        headers: &[(&str, &str)],
        payload: &str,
        retention_ms: u64,
    ) -> Result<BusOffset, BusError> {
        let min_id = format!(
            "{}-0",
            (Utc::now().timestamp_millis() as u64).saturating_sub(retention_ms)
        );

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key(topic, partition))
            .arg("MINID")
            .arg("~")
            .arg(min_id)
            .arg("*")
            .arg("key")
            .arg(key);
        for (name, value) in headers {
            cmd.arg(*name).arg(*value);
        }
        cmd.arg("payload").arg(payload);

        let id: String = cmd.query_async(&mut conn).await?;
        id.parse()
    }
}

fn message_from_entry(
    topic: &str,
    partition: u32,
    (id, mut fields): StreamEntry,
) -> Result<BusMessage, BusError> {
    let payload = fields
        .remove("payload")
        .ok_or_else(|| BusError::Payload(format!("{topic}/{partition} entry {id} has no payload")))?;
    Ok(BusMessage {
        topic: topic.to_string(),
        partition,
        offset: id.parse()?,
        key: fields.remove("key").unwrap_or_default(),
        event_type: fields.remove("event_type"),
        source: fields.remove("source"),
        payload,
    })
}
