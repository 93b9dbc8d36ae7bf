//! Link projections: registry row, content, metadata, publish state.
//!
//! Every handler is an idempotent write; replaying any prefix of the event
//! log converges on the same rows. Status changes are guarded in SQL so a
//! reordered or replayed event can never downgrade forward progress.

use sqlx::{Postgres, Transaction};
use tracing::warn;

use lifestream_core::normalize_url;
use lifestream_events::{
    ContentFetched, EnrichmentCompleted, EventRecord, LinkAdded, LinkVisibilityChanged,
    PublishCompleted,
};

pub async fn link_added(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &LinkAdded,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subjects (subject_kind, subject_id, visibility)
        VALUES ('link', $1, 'public')
        ON CONFLICT (subject_kind, subject_id) DO NOTHING
        "#,
    )
    .bind(record.subject_id.as_str())
    .execute(&mut **tx)
    .await?;

    let url_norm = payload
        .url_norm
        .clone()
        .unwrap_or_else(|| normalize_url(&payload.url));

    // First write wins; a replayed link.added never downgrades status.
    sqlx::query(
        r#"
        INSERT INTO links (subject_id, url, url_norm, source, status, visibility, pinned)
        VALUES ($1, $2, $3, $4, 'new', 'public', FALSE)
        ON CONFLICT (subject_id) DO NOTHING
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(&payload.url)
    .bind(&url_norm)
    .bind(&record.source)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn content_fetched(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &ContentFetched,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO link_content (
            subject_id, final_url, title, text_content, html_storage_key,
            fetch_error, fetched_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (subject_id) DO UPDATE SET
            final_url = EXCLUDED.final_url,
            title = EXCLUDED.title,
            text_content = EXCLUDED.text_content,
            html_storage_key = EXCLUDED.html_storage_key,
            fetch_error = EXCLUDED.fetch_error,
            fetched_at = EXCLUDED.fetched_at
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(&payload.final_url)
    .bind(&payload.title)
    .bind(&payload.text_content)
    .bind(&payload.html_storage_key)
    .bind(&payload.fetch_error)
    .bind(record.occurred_at)
    .execute(&mut **tx)
    .await?;

    if let Some(fetch_error) = &payload.fetch_error {
        sqlx::query(
            r#"
            UPDATE links SET
                status = 'error',
                retry_count = retry_count + 1,
                last_error = $2,
                last_error_at = $3
            WHERE subject_id = $1 AND status <> 'published'
            "#,
        )
        .bind(record.subject_id.as_str())
        .bind(fetch_error)
        .bind(record.occurred_at)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(
            r#"
            UPDATE links SET status = 'fetched', last_error = NULL, last_error_at = NULL
            WHERE subject_id = $1 AND status = 'new'
            "#,
        )
        .bind(record.subject_id.as_str())
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

pub async fn enrichment_completed(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &EnrichmentCompleted,
) -> Result<(), sqlx::Error> {
    // Dedup on write; a non-empty set is never replaced by an empty one.
    let mut tags = payload.tags.clone();
    tags.sort();
    tags.dedup();

    sqlx::query(
        r#"
        INSERT INTO link_metadata (
            subject_id, tags, summary_short, summary_long, language,
            model_version, enriched_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (subject_id) DO UPDATE SET
            tags = CASE
                WHEN cardinality(EXCLUDED.tags) > 0 THEN EXCLUDED.tags
                ELSE link_metadata.tags
            END,
            summary_short = COALESCE(EXCLUDED.summary_short, link_metadata.summary_short),
            summary_long = COALESCE(EXCLUDED.summary_long, link_metadata.summary_long),
            language = COALESCE(EXCLUDED.language, link_metadata.language),
            model_version = COALESCE(EXCLUDED.model_version, link_metadata.model_version),
            enriched_at = EXCLUDED.enriched_at
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(&tags)
    .bind(&payload.summary_short)
    .bind(&payload.summary_long)
    .bind(&payload.language)
    .bind(&payload.model_version)
    .bind(record.occurred_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE links SET status = 'enriched'
        WHERE subject_id = $1 AND status IN ('new', 'fetched')
        "#,
    )
    .bind(record.subject_id.as_str())
    .execute(&mut **tx)
    .await?;

    // Every distinct enrichment bumps the desired version and dirties
    // publish state; publication later folds it back to clean.
    sqlx::query(
        r#"
        INSERT INTO publish_state (subject_id, desired_version, published_version, dirty)
        VALUES ($1, 1, 0, TRUE)
        ON CONFLICT (subject_id) DO UPDATE SET
            desired_version = publish_state.desired_version + 1,
            dirty = TRUE
        "#,
    )
    .bind(record.subject_id.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn publish_completed(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &PublishCompleted,
) -> Result<(), sqlx::Error> {
    let published_at = payload.published_at.unwrap_or(record.occurred_at);

    let state = sqlx::query(
        r#"
        UPDATE publish_state SET
            published_version = desired_version,
            dirty = FALSE,
            last_published_at = $2
        WHERE subject_id = $1
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(published_at)
    .execute(&mut **tx)
    .await?;

    if state.rows_affected() == 0 {
        warn!(
            subject_id = %record.subject_id,
            event_id = %record.event_id,
            "publish.completed for a subject with no publish state"
        );
    }

    // Publication only follows enrichment; a fetched link cannot jump ahead.
    let status = sqlx::query(
        r#"
        UPDATE links SET status = 'published'
        WHERE subject_id = $1 AND status IN ('enriched', 'published')
        "#,
    )
    .bind(record.subject_id.as_str())
    .execute(&mut **tx)
    .await?;

    if status.rows_affected() == 0 {
        warn!(
            subject_id = %record.subject_id,
            event_id = %record.event_id,
            "publish.completed skipped: link is not in an enrichable state"
        );
    }

    Ok(())
}

pub async fn visibility_changed(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &LinkVisibilityChanged,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE links SET visibility = $2 WHERE subject_id = $1")
        .bind(record.subject_id.as_str())
        .bind(payload.visibility.as_str())
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "UPDATE subjects SET visibility = $3 WHERE subject_kind = $1 AND subject_id = $2",
    )
    .bind(record.subject_kind.as_str())
    .bind(record.subject_id.as_str())
    .bind(payload.visibility.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(())
}
