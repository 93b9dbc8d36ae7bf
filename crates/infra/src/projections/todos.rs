//! Todo projections.

use sqlx::{Postgres, Transaction};

use lifestream_events::{EventRecord, TodoCreated};

pub async fn created(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &TodoCreated,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subjects (subject_kind, subject_id, display_name)
        VALUES ('todo', $1, $2)
        ON CONFLICT (subject_kind, subject_id) DO NOTHING
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(&payload.title)
    .execute(&mut **tx)
    .await?;

    // A completion that arrived first wins the status race; creation only
    // fills in the descriptive fields.
    sqlx::query(
        r#"
        INSERT INTO todos (subject_id, title, project, labels, due_at, status, created_at)
        VALUES ($1, $2, $3, $4, $5, 'open', $6)
        ON CONFLICT (subject_id) DO UPDATE SET
            title = EXCLUDED.title,
            project = EXCLUDED.project,
            labels = EXCLUDED.labels,
            due_at = EXCLUDED.due_at
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(&payload.title)
    .bind(&payload.project)
    .bind(&payload.labels)
    .bind(payload.due_at)
    .bind(record.occurred_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn completed(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO todos (subject_id, title, status, created_at, completed_at)
        VALUES ($1, '', 'done', $2, $2)
        ON CONFLICT (subject_id) DO UPDATE SET
            status = 'done',
            completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(record.occurred_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
