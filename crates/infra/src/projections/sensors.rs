//! Sensor projections: time series plus a "latest reading" row.

use sqlx::{Postgres, Transaction};

use lifestream_events::{EventRecord, TempReadingRecorded};

pub async fn reading_recorded(
    tx: &mut Transaction<'_, Postgres>,
    record: &EventRecord,
    payload: &TempReadingRecorded,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subjects (subject_kind, subject_id, visibility)
        VALUES ('sensor', $1, 'private')
        ON CONFLICT (subject_kind, subject_id) DO NOTHING
        "#,
    )
    .bind(record.subject_id.as_str())
    .execute(&mut **tx)
    .await?;

    // Keyed by recording time, so a replayed event lands on the same row.
    sqlx::query(
        r#"
        INSERT INTO sensor_readings (subject_id, recorded_at, celsius, humidity, battery)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (subject_id, recorded_at) DO NOTHING
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(record.occurred_at)
    .bind(payload.celsius)
    .bind(payload.humidity)
    .bind(payload.battery)
    .execute(&mut **tx)
    .await?;

    // "Latest" moves only strictly forward in time.
    sqlx::query(
        r#"
        INSERT INTO sensor_latest (subject_id, recorded_at, celsius, humidity, battery)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (subject_id) DO UPDATE SET
            recorded_at = EXCLUDED.recorded_at,
            celsius = EXCLUDED.celsius,
            humidity = EXCLUDED.humidity,
            battery = EXCLUDED.battery
        WHERE sensor_latest.recorded_at < EXCLUDED.recorded_at
        "#,
    )
    .bind(record.subject_id.as_str())
    .bind(record.occurred_at)
    .bind(payload.celsius)
    .bind(payload.humidity)
    .bind(payload.battery)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
