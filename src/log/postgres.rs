//! Postgres-backed durable log.
//!
//! Messages live in the `log_message` table and are claimed with
//! `FOR UPDATE SKIP LOCKED`, so any number of workers and scheduler replicas
//! can pull from the same subjects without double-claiming a visible message.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Delivery, DurableLog, LogResult};

#[derive(Clone)]
pub struct PostgresLog {
    pool: PgPool,
}

impl PostgresLog {
    /// Wrap an existing pool; migrations are the store's responsibility.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DurableLog for PostgresLog {
    async fn publish(&self, subject: &str, payload: &[u8]) -> LogResult<()> {
        sqlx::query(
            r#"
            INSERT INTO log_message (subject, payload)
            VALUES ($1, $2)
            "#,
        )
        .bind(subject)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pull(
        &self,
        consumer: &str,
        subjects: &[String],
        max: usize,
        visibility: Duration,
    ) -> LogResult<Vec<Delivery>> {
        if max == 0 || subjects.is_empty() {
            return Ok(Vec::new());
        }

        // array_position on the bound subject list turns subject order into
        // claim priority.
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id
                FROM log_message
                WHERE subject = ANY($1)
                  AND state <> 'acked'
                  AND visible_at <= NOW()
                ORDER BY array_position($1, subject), published_at
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE log_message m
            SET state = 'inflight',
                consumer = $3,
                deliveries = m.deliveries + 1,
                visible_at = NOW() + ($4 * INTERVAL '1 second')
            FROM claimed
            WHERE m.id = claimed.id
            RETURNING m.id, m.subject, m.payload, m.deliveries
            "#,
        )
        .bind(subjects)
        .bind(max as i64)
        .bind(consumer)
        .bind(visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Delivery {
                message_id: row.get::<Uuid, _>("id"),
                subject: row.get("subject"),
                payload: row.get("payload"),
                deliveries: row.get("deliveries"),
            })
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> LogResult<()> {
        sqlx::query(
            r#"
            UPDATE log_message
            SET state = 'acked'
            WHERE id = $1
            "#,
        )
        .bind(delivery.message_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> LogResult<()> {
        sqlx::query(
            r#"
            UPDATE log_message
            SET state = 'queued',
                visible_at = NOW() + ($2 * INTERVAL '1 second')
            WHERE id = $1 AND state <> 'acked'
            "#,
        )
        .bind(delivery.message_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_older_than(&self, age: Duration) -> LogResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM log_message
            WHERE state = 'acked'
               OR published_at < NOW() - ($1 * INTERVAL '1 second')
            "#,
        )
        .bind(age.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
