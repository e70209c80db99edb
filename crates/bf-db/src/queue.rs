//! Postgres dispatch queue.
//!
//! Claim protocol: `consume` first reaps expired claims (visibility
//! timeout), then claims the oldest PENDING row with
//! `FOR UPDATE SKIP LOCKED` so competing consumers never claim the same
//! row. `ack` deletes the row; a consumer that dies mid-handling simply
//! lets the claim expire and the message is redelivered.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use bf_schemas::{AckToken, DurableQueue, QueueMessage};

pub struct PgQueue {
    pool: PgPool,
    consumer_id: String,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, consumer_id: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            consumer_id: consumer_id.into(),
            visibility_timeout,
        }
    }

    /// Return expired claims to PENDING. Called opportunistically from
    /// `consume`; exposed for tests.
    pub async fn reap_expired_claims(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            update dispatch_queue
               set status         = 'PENDING',
                   claimed_at_utc = null,
                   claimed_by     = null
             where status = 'CLAIMED'
               and claimed_at_utc < now() - make_interval(secs => $1)
            "#,
        )
        .bind(self.visibility_timeout.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("reap_expired_claims failed")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl DurableQueue for PgQueue {
    async fn publish(&self, message: Vec<u8>) -> Result<()> {
        sqlx::query(
            r#"
            insert into dispatch_queue (payload, status)
            values ($1, 'PENDING')
            "#,
        )
        .bind(message)
        .execute(&self.pool)
        .await
        .context("queue publish failed")?;
        Ok(())
    }

    async fn consume(&self) -> Result<Option<QueueMessage>> {
        self.reap_expired_claims().await?;

        let row = sqlx::query(
            r#"
            with to_claim as (
                select queue_id
                from dispatch_queue
                where status = 'PENDING'
                order by queue_id asc
                limit 1
                for update skip locked
            )
            update dispatch_queue
               set status         = 'CLAIMED',
                   claimed_at_utc = now(),
                   claimed_by     = $1
             where queue_id in (select queue_id from to_claim)
            returning queue_id, payload
            "#,
        )
        .bind(&self.consumer_id)
        .fetch_optional(&self.pool)
        .await
        .context("queue consume failed")?;

        let Some(row) = row else { return Ok(None) };

        let queue_id: i64 = row.try_get("queue_id")?;
        let payload: Vec<u8> = row.try_get("payload")?;

        Ok(Some(QueueMessage {
            payload,
            token: AckToken::new(queue_id.to_string()),
        }))
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        // A reaped-and-redelivered message may already be gone; acking an
        // unknown token is a no-op by contract.
        let Ok(queue_id) = token.as_str().parse::<i64>() else {
            return Ok(());
        };

        sqlx::query("delete from dispatch_queue where queue_id = $1")
            .bind(queue_id)
            .execute(&self.pool)
            .await
            .context("queue ack failed")?;
        Ok(())
    }
}
