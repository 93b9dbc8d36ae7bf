//! Annotation projections.

use sqlx::{Postgres, Transaction};

use lifestream_events::{AnnotationAdded, EventRecord, Visibility};

pub async fn added(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &AnnotationAdded,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subjects (subject_kind, subject_id)
        VALUES ('annotation', $1)
        ON CONFLICT (subject_kind, subject_id) DO NOTHING
        "#,
    )
    .bind(record.subject_id.as_str())
    .execute(&mut **tx)
    .await?;

    let visibility = payload.visibility.unwrap_or(Visibility::Public);

    sqlx::query(
        r#"
        INSERT INTO annotations (
            annotation_id, link_subject_id, quote, note, selector, visibility, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (annotation_id) DO UPDATE SET
            quote = EXCLUDED.quote,
            note = EXCLUDED.note,
            selector = EXCLUDED.selector,
            visibility = EXCLUDED.visibility
        "#,
    )
    .bind(&payload.annotation_id)
    .bind(payload.link_subject_id.as_str())
    .bind(&payload.quote)
    .bind(&payload.note)
    .bind(&payload.selector)
    .bind(visibility.as_str())
    .bind(record.occurred_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
