//! Consumer progress and the idempotency ledger.
//!
//! Both live in the database, not the bus: the bus is disposable, the
//! database is the single source of truth for what has been projected.

use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::bus::BusOffset;

/// Consumer role recorded by the materializer.
pub const MATERIALIZER_ROLE: &str = "materializer";

/// Whether `(topic, partition, offset)` has already been projected.
pub async fn is_processed(
    pool: &PgPool,
    topic: &str,
    partition: u32,
    offset: BusOffset,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT 1 AS hit FROM processed_messages
        WHERE topic = $1 AND partition = $2 AND offset_ms = $3 AND offset_seq = $4
        "#,
    )
    .bind(topic)
    .bind(partition as i32)
    .bind(offset.ms as i64)
    .bind(offset.seq as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Record an offset as processed (no-op when already recorded).
pub async fn record_processed(
    tx: &mut Transaction<'_, Postgres>,
    topic: &str,
    partition: u32,
    offset: BusOffset,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO processed_messages (topic, partition, offset_ms, offset_seq)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(topic)
    .bind(partition as i32)
    .bind(offset.ms as i64)
    .bind(offset.seq as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upsert a consumer's committed position for a partition.
pub async fn update_progress(
    tx: &mut Transaction<'_, Postgres>,
    role: &str,
    topic: &str,
    partition: u32,
    offset: BusOffset,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO consumer_progress (
            consumer_role, topic, partition, last_offset_ms, last_offset_seq
        )
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (consumer_role, topic, partition)
        DO UPDATE SET
            last_offset_ms = EXCLUDED.last_offset_ms,
            last_offset_seq = EXCLUDED.last_offset_seq,
            updated_at = NOW()
        "#,
    )
    .bind(role)
    .bind(topic)
    .bind(partition as i32)
    .bind(offset.ms as i64)
    .bind(offset.seq as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Highest offset the idempotency ledger holds for a partition.
pub async fn highest_processed(
    pool: &PgPool,
    topic: &str,
    partition: u32,
) -> Result<Option<BusOffset>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT offset_ms, offset_seq FROM processed_messages
        WHERE topic = $1 AND partition = $2
        ORDER BY offset_ms DESC, offset_seq DESC
        LIMIT 1
        "#,
    )
    .bind(topic)
    .bind(partition as i32)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        BusOffset::new(
            row.get::<i64, _>("offset_ms") as u64,
            row.get::<i64, _>("offset_seq") as u64,
        )
    }))
}

/// Drop idempotency rows for one partition (bus-recreation recovery).
pub async fn truncate_partition(
    pool: &PgPool,
    topic: &str,
    partition: u32,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM processed_messages WHERE topic = $1 AND partition = $2")
        .bind(topic)
        .bind(partition as i32)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Clear all idempotency and progress bookkeeping (used by `reset-bus`).
pub async fn clear_all(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM processed_messages")
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM consumer_progress")
        .execute(pool)
        .await?;
    Ok(())
}
