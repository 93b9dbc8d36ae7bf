//! Database pool and schema bootstrap.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

/// Build the bounded process-wide connection pool.
pub async fn connect_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.database_url)
        .await
}

/// Create tables if absent. Idempotent; real migration tooling is layered on
/// by the deployment, this only keeps a fresh database usable.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id        UUID PRIMARY KEY,
            occurred_at     TIMESTAMPTZ NOT NULL,
            received_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            source          TEXT NOT NULL,
            subject_kind    TEXT NOT NULL,
            subject_id      TEXT NOT NULL,
            event_type      TEXT NOT NULL,
            schema_version  INT NOT NULL DEFAULT 1,
            payload         JSONB NOT NULL,
            correlation_id  UUID,
            causation_id    UUID,
            forwarded       BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS events_unforwarded_idx
            ON events (received_at, event_id) WHERE NOT forwarded
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS events_subject_idx
            ON events (subject_kind, subject_id, received_at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS subjects (
            subject_kind    TEXT NOT NULL,
            subject_id      TEXT NOT NULL,
            display_name    TEXT,
            visibility      TEXT NOT NULL DEFAULT 'public',
            meta            JSONB NOT NULL DEFAULT '{}'::jsonb,
            PRIMARY KEY (subject_kind, subject_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS links (
            subject_id      TEXT PRIMARY KEY,
            url             TEXT NOT NULL,
            url_norm        TEXT NOT NULL,
            source          TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'new',
            visibility      TEXT NOT NULL DEFAULT 'public',
            pinned          BOOLEAN NOT NULL DEFAULT FALSE,
            retry_count     INT NOT NULL DEFAULT 0,
            last_error_at   TIMESTAMPTZ,
            last_error      TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS link_content (
            subject_id       TEXT PRIMARY KEY,
            final_url        TEXT,
            title            TEXT,
            text_content     TEXT,
            html_storage_key TEXT,
            fetch_error      TEXT,
            fetched_at       TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS link_metadata (
            subject_id     TEXT PRIMARY KEY,
            tags           TEXT[] NOT NULL DEFAULT '{}',
            summary_short  TEXT,
            summary_long   TEXT,
            language       TEXT,
            model_version  TEXT,
            enriched_at    TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS publish_state (
            subject_id         TEXT PRIMARY KEY,
            desired_version    INT NOT NULL DEFAULT 0,
            published_version  INT NOT NULL DEFAULT 0,
            dirty              BOOLEAN NOT NULL DEFAULT FALSE,
            last_published_at  TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            subject_id   TEXT NOT NULL,
            recorded_at  TIMESTAMPTZ NOT NULL,
            celsius      DOUBLE PRECISION NOT NULL,
            humidity     DOUBLE PRECISION,
            battery      DOUBLE PRECISION,
            PRIMARY KEY (subject_id, recorded_at)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sensor_latest (
            subject_id   TEXT PRIMARY KEY,
            recorded_at  TIMESTAMPTZ NOT NULL,
            celsius      DOUBLE PRECISION NOT NULL,
            humidity     DOUBLE PRECISION,
            battery      DOUBLE PRECISION
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS todos (
            subject_id    TEXT PRIMARY KEY,
            title         TEXT NOT NULL,
            project       TEXT,
            labels        TEXT[] NOT NULL DEFAULT '{}',
            due_at        TIMESTAMPTZ,
            status        TEXT NOT NULL DEFAULT 'open',
            created_at    TIMESTAMPTZ NOT NULL,
            completed_at  TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS annotations (
            annotation_id    TEXT PRIMARY KEY,
            link_subject_id  TEXT NOT NULL,
            quote            TEXT,
            note             TEXT,
            selector         JSONB,
            visibility       TEXT NOT NULL DEFAULT 'public',
            created_at       TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS consumer_progress (
            consumer_role   TEXT NOT NULL,
            topic           TEXT NOT NULL,
            partition       INT NOT NULL,
            last_offset_ms  BIGINT NOT NULL,
            last_offset_seq BIGINT NOT NULL,
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (consumer_role, topic, partition)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS processed_messages (
            topic        TEXT NOT NULL,
            partition    INT NOT NULL,
            offset_ms    BIGINT NOT NULL,
            offset_seq   BIGINT NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (topic, partition, offset_ms, offset_seq)
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
