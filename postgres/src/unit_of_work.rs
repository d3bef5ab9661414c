//! Transactional unit of work.

use crate::rows::{
    PAYMENT_COLUMNS, db, insert_payment, payment_from_row, select_competition,
    select_payment, select_voucher, to_i32, to_i64,
};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use ticket_engine_core::allocation::{AllocationPolicy, AllocationRejection, Reservation, TicketNumbers};
use ticket_engine_core::competition::CompetitionStatus;
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::ledger::{Completion, NewPayment, PaymentRecord, PaymentState, Transition, UpsertOutcome};
use ticket_engine_core::store::{BoxFuture, UnitOfWork};
use ticket_engine_core::types::{Amount, CompetitionSlug, PayerId, PaymentId, VoucherCode};
use ticket_engine_core::voucher::Voucher;

/// The atomic conditional increment. `SET` expressions see the pre-update row;
/// `RETURNING` sees the post-update row.
const RESERVE_SQL: &str = "UPDATE competitions \
     SET tickets_sold = tickets_sold + $2, \
         status = CASE WHEN tickets_sold + $2 = total_tickets THEN 'completed' ELSE status END, \
         updated_at = $4 \
     WHERE slug = $1 \
       AND tickets_sold + $2 <= total_tickets \
       AND status = ANY($3) \
       AND $4 BETWEEN starts_at AND ends_at \
     RETURNING tickets_sold, status";

/// A `PostgreSQL` transaction. Dropping it without commit rolls back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PostgresUnitOfWork {
    pub(crate) const fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    /// The conditional increment matched no row: explain why.
    async fn diagnose_rejection(
        &mut self,
        slug: &CompetitionSlug,
        quantity: u32,
        policy: &AllocationPolicy,
        now: DateTime<Utc>,
    ) -> EngineError {
        match select_competition(&mut self.tx, slug).await {
            Err(e) => e.into(),
            Ok(None) => EngineError::CompetitionNotFound(slug.clone()),
            Ok(Some(competition)) => {
                let rejection = competition
                    .check_allocatable(quantity, policy, now)
                    .err()
                    .unwrap_or(AllocationRejection::CapacityExceeded {
                        requested: quantity,
                        remaining: competition.remaining(),
                    });
                EngineError::rejected(slug, rejection)
            }
        }
    }
}

impl UnitOfWork for PostgresUnitOfWork {
    fn lock_payment<'a>(
        &'a mut self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, StoreError>> {
        Box::pin(async move { select_payment(&mut self.tx, payment_id, true).await })
    }

    fn insert_payment(
        &mut self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<UpsertOutcome>> {
        Box::pin(async move { insert_payment(&mut self.tx, payment, now).await })
    }

    fn reserve<'a>(
        &'a mut self,
        slug: &'a CompetitionSlug,
        quantity: u32,
        policy: &'a AllocationPolicy,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Reservation>> {
        Box::pin(async move {
            if quantity == 0 {
                return Err(EngineError::InvalidRequest("quantity must be at least 1".into()));
            }
            let row = sqlx::query(RESERVE_SQL)
                .bind(slug.as_str())
                .bind(to_i32(quantity)?)
                .bind(policy.allowed_status_strings())
                .bind(now)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(db)?;

            let Some(row) = row else {
                return Err(self.diagnose_rejection(slug, quantity, policy, now).await);
            };

            let after: i32 = row.try_get("tickets_sold").map_err(db)?;
            let status: String = row.try_get("status").map_err(db)?;
            let after = u32::try_from(after)
                .map_err(|_| StoreError::Corrupt(format!("negative tickets_sold {after}")))?;
            let status_after = CompetitionStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown competition status {status}")))?;
            let ticket_numbers = TicketNumbers::from_post_increment(after, quantity)
                .ok_or_else(|| StoreError::Corrupt(format!("tickets_sold {after} below quantity {quantity}")))?;

            tracing::debug!(
                competition = %slug,
                tickets = %ticket_numbers,
                tickets_sold = after,
                "Tickets reserved"
            );
            Ok(Reservation {
                competition: slug.clone(),
                ticket_numbers,
                tickets_sold_after: after,
                status_after,
            })
        })
    }

    fn try_transition_to_completed<'a>(
        &'a mut self,
        payment_id: &'a PaymentId,
        completion: Completion,
    ) -> BoxFuture<'a, EngineResult<Transition>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE payments \
                 SET state = 'completed', transaction_id = $2, first_ticket = $3, last_ticket = $4, \
                     tickets_sold_after = $5, competition_status_after = $6, completed_at = $7, \
                     updated_at = $7, last_error = NULL \
                 WHERE payment_id = $1 AND state IN ('created', 'approved') \
                 RETURNING {PAYMENT_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(payment_id.as_str())
                .bind(completion.transaction_id.as_ref().map(|t| t.as_str().to_string()))
                .bind(to_i32(completion.ticket_numbers.first)?)
                .bind(to_i32(completion.ticket_numbers.last)?)
                .bind(to_i32(completion.tickets_sold_after)?)
                .bind(completion.competition_status_after.as_str())
                .bind(completion.completed_at)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(db)?;

            if let Some(row) = row {
                return Ok(Transition::Completed(payment_from_row(&row)?));
            }

            let current = select_payment(&mut self.tx, payment_id, false)
                .await?
                .ok_or_else(|| EngineError::UnknownPayment(payment_id.clone()))?;
            match current.state {
                PaymentState::Completed => Ok(Transition::AlreadyCompleted(current)),
                state => Err(EngineError::PaymentNotSettleable {
                    payment_id: payment_id.clone(),
                    state,
                }),
            }
        })
    }

    fn add_to_prize_pool<'a>(
        &'a mut self,
        slug: &'a CompetitionSlug,
        amount: Amount,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if amount == Amount::ZERO {
                return Ok(());
            }
            sqlx::query(
                "UPDATE competitions SET prize_pool_micros = prize_pool_micros + $2 WHERE slug = $1",
            )
            .bind(slug.as_str())
            .bind(to_i64(amount)?)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
            Ok(())
        })
    }

    fn lock_voucher<'a>(
        &'a mut self,
        code: &'a VoucherCode,
    ) -> BoxFuture<'a, Result<Option<Voucher>, StoreError>> {
        Box::pin(async move { select_voucher(&mut self.tx, code, true).await })
    }

    fn find_redemption<'a>(
        &'a mut self,
        code: &'a VoucherCode,
        redeemer: &'a PayerId,
    ) -> BoxFuture<'a, Result<Option<PaymentId>, StoreError>> {
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT payment_id FROM voucher_redemptions \
                 WHERE code = $1 AND redeemer = $2 ORDER BY created_at ASC LIMIT 1",
            )
            .bind(code.as_str())
            .bind(redeemer.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;
            Ok(row.map(|(id,)| PaymentId::new(id)))
        })
    }

    fn claim_redemption<'a>(&'a mut self, code: &'a VoucherCode) -> BoxFuture<'a, EngineResult<u32>> {
        Box::pin(async move {
            let row: Option<(i32,)> = sqlx::query_as(
                "UPDATE vouchers SET redemption_count = redemption_count + 1 \
                 WHERE code = $1 AND redemption_count < redemption_cap \
                 RETURNING redemption_count",
            )
            .bind(code.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)?;

            match row {
                Some((count,)) => u32::try_from(count).map_err(|_| {
                    EngineError::Store(StoreError::Corrupt(format!(
                        "negative redemption_count {count}"
                    )))
                }),
                None => match select_voucher(&mut self.tx, code, false).await? {
                    Some(_) => Err(EngineError::VoucherExhausted(code.clone())),
                    None => Err(EngineError::VoucherNotFound(code.clone())),
                },
            }
        })
    }

    fn record_redemption<'a>(
        &'a mut self,
        code: &'a VoucherCode,
        redeemer: &'a PayerId,
        ledger_key: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO voucher_redemptions (payment_id, code, redeemer, created_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(ledger_key.as_str())
            .bind(code.as_str())
            .bind(redeemer.as_str())
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move { self.tx.commit().await.map_err(db) })
    }
}
