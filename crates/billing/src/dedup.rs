//! Event deduplication guard
//!
//! Ensures each provider event is applied at most once across all service
//! instances. The atomic unique-insert into `stripe_webhook_events` is the
//! only synchronization primitive in the engine; no in-process state is
//! consulted, so any number of horizontally scaled instances may receive
//! the same delivery.
//!
//! Discipline: claim-before-handle with rollback on failure. A claim row is
//! inserted before the handler runs; on success it is marked done, on
//! failure it is released so the provider's redelivery can reprocess. An
//! event is therefore never recorded as done without its side effects
//! having completed, and a crash mid-handler costs at most one redelivery
//! of an idempotent transition.
//!
//! This makes the table a record of successful processing, not an
//! append-only log of every delivery: rows for failed attempts are deleted
//! on release, and the provider's redelivery is the retry mechanism. Only
//! `processing` and `success` ever appear in `processing_result`.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// How long a `processing` claim may sit before a crash is assumed and the
/// claim becomes reclaimable.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This execution owns the event and must process it.
    Claimed,
    /// Another execution already owns or completed this event id: a no-op
    /// success, not an error.
    AlreadyProcessed,
}

/// Processed-event record, for admin inspection and replay tooling.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ProcessedEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub processing_result: String,
    pub processing_started_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct DedupGuard {
    pool: PgPool,
}

impl DedupGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// The INSERT … ON CONFLICT … RETURNING pattern guarantees that of N
    /// concurrent deliveries exactly one receives `Claimed`; the rest see
    /// `AlreadyProcessed`. A claim stuck in `processing` beyond the timeout
    /// is re-claimable so a crashed instance cannot wedge an event forever.
    pub async fn try_claim(&self, event_id: &str, event_type: &str) -> BillingResult<ClaimOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at
                    < NOW() - ($3 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            Ok(ClaimOutcome::Claimed)
        } else {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, skipping"
            );
            Ok(ClaimOutcome::AlreadyProcessed)
        }
    }

    /// Record that the claimed event's side effects completed.
    pub async fn mark_done(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'success', processed_at = NOW(), error_message = NULL
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Roll back an unfinished claim after a handler failure so the
    /// provider's retry can reprocess the event.
    ///
    /// Completed rows are never touched: the guard only deletes while the
    /// row is still in `processing`.
    pub async fn release(&self, event_id: &str, error: &str) -> BillingResult<()> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE stripe_event_id = $1 AND processing_result = 'processing'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            // Raced with stuck-claim recovery on another instance.
            tracing::warn!(
                event_id = %event_id,
                error = %error,
                "Claim already gone or completed while releasing"
            );
        } else {
            tracing::warn!(
                event_id = %event_id,
                error = %error,
                "Released webhook claim after handler failure; provider will redeliver"
            );
        }

        Ok(())
    }

    /// Recent processed events, newest first.
    pub async fn recent(&self, limit: i64) -> BillingResult<Vec<ProcessedEventRecord>> {
        let rows = sqlx::query_as::<_, ProcessedEventRecord>(
            r#"
            SELECT id, stripe_event_id, event_type, processing_result,
                   processing_started_at, processed_at, error_message
            FROM stripe_webhook_events
            ORDER BY processing_started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
