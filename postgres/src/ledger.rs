//! [`PaymentLedger`] for [`PostgresStore`].

use crate::PostgresStore;
use crate::rows::{PAYMENT_COLUMNS, db, insert_payment, payment_from_row, select_payment};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::ledger::{NewPayment, PaymentRecord, PaymentState, UpsertOutcome};
use ticket_engine_core::store::{BoxFuture, PaymentLedger};
use ticket_engine_core::types::{CompetitionSlug, PaymentId};

/// Run a conditional state update; when it matches nothing, load the row so the
/// caller can tell a no-op from a refused transition.
async fn conditional_update(
    conn: &mut PgConnection,
    sql: &str,
    payment_id: &PaymentId,
    now: DateTime<Utc>,
    reason: Option<&str>,
) -> EngineResult<Result<PaymentRecord, PaymentRecord>> {
    let mut query = sqlx::query(sql).bind(payment_id.as_str()).bind(now);
    if let Some(reason) = reason {
        query = query.bind(reason);
    }
    if let Some(row) = query.fetch_optional(&mut *conn).await.map_err(db)? {
        return Ok(Ok(payment_from_row(&row)?));
    }
    let current = select_payment(conn, payment_id, false)
        .await?
        .ok_or_else(|| EngineError::UnknownPayment(payment_id.clone()))?;
    Ok(Err(current))
}

impl PaymentLedger for PostgresStore {
    fn upsert_created(
        &self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<UpsertOutcome>> {
        Box::pin(async move {
            let mut conn = self.acquire().await?;
            insert_payment(&mut conn, payment, now).await
        })
    }

    fn find_payment<'a>(
        &'a self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.acquire().await?;
            select_payment(&mut conn, payment_id, false).await
        })
    }

    fn mark_approved<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE payments SET state = 'approved', updated_at = $2 \
                 WHERE payment_id = $1 AND state = 'created' RETURNING {PAYMENT_COLUMNS}"
            );
            let mut conn = self.acquire().await?;
            match conditional_update(&mut conn, &sql, payment_id, now, None).await? {
                Ok(record) => {
                    tracing::info!(payment_id = %payment_id, "Payment approved");
                    Ok(record)
                }
                Err(current) if matches!(current.state, PaymentState::Approved | PaymentState::Completed) => {
                    Ok(current)
                }
                Err(current) => Err(EngineError::InvalidTransition(format!(
                    "cannot approve {} payment {payment_id}",
                    current.state
                ))),
            }
        })
    }

    fn mark_cancelled<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE payments SET state = 'cancelled', updated_at = $2 \
                 WHERE payment_id = $1 AND state NOT IN ('completed', 'cancelled') \
                 RETURNING {PAYMENT_COLUMNS}"
            );
            let mut conn = self.acquire().await?;
            match conditional_update(&mut conn, &sql, payment_id, now, None).await? {
                Ok(record) => {
                    tracing::info!(payment_id = %payment_id, "Payment cancelled");
                    Ok(record)
                }
                Err(current) if current.state == PaymentState::Cancelled => Ok(current),
                Err(current) => Err(EngineError::InvalidTransition(format!(
                    "cannot cancel {} payment {payment_id}",
                    current.state
                ))),
            }
        })
    }

    fn mark_failed<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE payments SET state = 'failed', updated_at = $2, last_error = $3 \
                 WHERE payment_id = $1 AND state IN ('created', 'approved') \
                 RETURNING {PAYMENT_COLUMNS}"
            );
            let mut conn = self.acquire().await?;
            match conditional_update(&mut conn, &sql, payment_id, now, Some(reason)).await? {
                Ok(record) => {
                    tracing::warn!(payment_id = %payment_id, reason, "Payment marked failed");
                    Ok(record)
                }
                Err(current) if current.state == PaymentState::Failed => Ok(current),
                Err(current) => Err(EngineError::InvalidTransition(format!(
                    "cannot fail {} payment {payment_id}",
                    current.state
                ))),
            }
        })
    }

    fn record_failure<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("UPDATE payments SET last_error = $2, updated_at = $3 WHERE payment_id = $1")
                .bind(payment_id.as_str())
                .bind(reason)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(db)?;
            Ok(())
        })
    }

    fn list_unsettled(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<PaymentRecord>, StoreError>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments \
                 WHERE state IN ('created', 'approved') AND updated_at < $1 \
                 ORDER BY updated_at ASC, payment_id ASC LIMIT $2"
            );
            let rows = sqlx::query(&sql)
                .bind(older_than)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
            rows.iter().map(payment_from_row).collect()
        })
    }

    fn list_completed_for<'a>(
        &'a self,
        competition: &'a CompetitionSlug,
    ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, StoreError>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments \
                 WHERE competition_slug = $1 AND state = 'completed' \
                 ORDER BY first_ticket ASC"
            );
            let rows = sqlx::query(&sql)
                .bind(competition.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
            rows.iter().map(payment_from_row).collect()
        })
    }
}
