//! Voucher redemption: tickets without a payment, through the same allocator.
//!
//! One unit of work locks the voucher row, deduplicates single-use redeemers,
//! claims a redemption with a conditional increment, writes a zero-amount
//! ledger entry, reserves tickets and completes the entry. A code with one
//! redemption left therefore cannot be redeemed twice, on any number of
//! processes.

use crate::engine::Engine;
use crate::orchestrator::{observe, settlement_from};
use chrono::{DateTime, Utc};
use ticket_engine_core::allocation::{SettleOutcome, Settlement};
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::ledger::{Completion, EntryMetadata, NewPayment, Transition};
use ticket_engine_core::types::{Amount, PayerId, VoucherCode};

impl Engine {
    /// Redeem a voucher for `redeemer`.
    ///
    /// Replays by the same redeemer of a single-use voucher return the
    /// original allocation.
    ///
    /// # Errors
    ///
    /// - [`EngineError::VoucherNotFound`], [`EngineError::VoucherExpired`],
    ///   [`EngineError::VoucherExhausted`]
    /// - allocator rejections, as for payments
    /// - [`EngineError::InvalidRequest`] for a blank code or redeemer
    pub async fn redeem(&self, code: &VoucherCode, redeemer: &PayerId) -> EngineResult<Settlement> {
        if code.is_blank() || redeemer.is_blank() {
            return Err(EngineError::InvalidRequest(
                "voucher code and redeemer are required".into(),
            ));
        }
        let now = self.clock.now();
        let result = self.redeem_in_unit_of_work(code, redeemer, now).await;
        observe(&result, "voucher");
        match &result {
            Ok(settlement) if !settlement.is_replay() => {
                metrics::counter!("vouchers.redeemed").increment(1);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::info!(code = %code, redeemer = %redeemer, error = %err, "Voucher redemption refused");
                metrics::counter!("vouchers.refused", "reason" => err.code()).increment(1);
            }
        }
        result
    }

    async fn redeem_in_unit_of_work(
        &self,
        code: &VoucherCode,
        redeemer: &PayerId,
        now: DateTime<Utc>,
    ) -> EngineResult<Settlement> {
        let mut uow = self.store.begin().await?;

        let voucher = uow
            .lock_voucher(code)
            .await?
            .ok_or_else(|| EngineError::VoucherNotFound(code.clone()))?;

        if voucher.single_use_per_user {
            if let Some(ledger_key) = uow.find_redemption(code, redeemer).await? {
                let record = uow.lock_payment(&ledger_key).await?.ok_or_else(|| {
                    StoreError::Corrupt(format!("redemption {ledger_key} has no ledger entry"))
                })?;
                return settlement_from(&record, SettleOutcome::AlreadyCompleted);
            }
        }
        if voucher.is_expired(now) {
            return Err(EngineError::VoucherExpired(code.clone()));
        }
        if voucher.remaining() == 0 {
            return Err(EngineError::VoucherExhausted(code.clone()));
        }

        let redemption_number = uow.claim_redemption(code).await?;
        let ledger_key = voucher.ledger_key(redeemer, redemption_number);
        let entry = NewPayment {
            payment_id: ledger_key.clone(),
            amount: Amount::ZERO,
            payer: redeemer.clone(),
            metadata: EntryMetadata::Voucher {
                code: voucher.code.clone(),
                competition: voucher.competition.clone(),
                quantity: voucher.quantity,
            },
        };
        let record = uow.insert_payment(entry, now).await?.into_record();
        if record.is_completed() {
            return settlement_from(&record, SettleOutcome::AlreadyCompleted);
        }

        let reservation = uow
            .reserve(&voucher.competition, voucher.quantity, self.policy(), now)
            .await?;
        let completion = Completion {
            transaction_id: None,
            ticket_numbers: reservation.ticket_numbers,
            tickets_sold_after: reservation.tickets_sold_after,
            competition_status_after: reservation.status_after,
            completed_at: now,
        };
        let completed = match uow.try_transition_to_completed(&ledger_key, completion).await? {
            Transition::Completed(record) => record,
            Transition::AlreadyCompleted(record) => {
                return settlement_from(&record, SettleOutcome::AlreadyCompleted);
            }
        };
        uow.record_redemption(code, redeemer, &ledger_key, now).await?;
        uow.commit().await?;

        tracing::info!(
            code = %code,
            redeemer = %redeemer,
            redemption = redemption_number,
            cap = voucher.redemption_cap,
            "Voucher redeemed"
        );
        settlement_from(&completed, SettleOutcome::Settled)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_support::Harness;
    use chrono::Duration;
    use ticket_engine_core::competition::CompetitionStatus;
    use ticket_engine_core::voucher::NewVoucher;

    async fn voucher(h: &Harness, code: &str, cap: u32, single_use: bool) {
        h.store
            .seed_voucher(
                NewVoucher {
                    code: VoucherCode::new(code),
                    competition: "pi-phone".into(),
                    quantity: 2,
                    redemption_cap: cap,
                    expires_at: Some(h.now() + Duration::days(1)),
                    single_use_per_user: single_use,
                }
                .into_voucher(h.now()),
            )
            .await;
    }

    #[tokio::test]
    async fn redemption_allocates_through_the_ledger() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        voucher(&h, "free2", 5, true).await;

        let settlement = h
            .engine
            .redeem(&VoucherCode::new("FREE2"), &PayerId::new("alice"))
            .await
            .unwrap();

        assert_eq!(settlement.allocation.ticket_numbers.to_vec(), vec![1, 2]);
        assert_eq!(settlement.allocation.payment_id.as_str(), "voucher:FREE2:alice");
        let record = h.store.payment("voucher:FREE2:alice").await.unwrap();
        assert_eq!(record.amount, Amount::ZERO);
        assert!(record.transaction_id.is_none());
        assert_eq!(h.store.voucher("FREE2").await.unwrap().redemption_count, 1);
        assert_eq!(h.store.competition("pi-phone").await.unwrap().prize_pool, Amount::ZERO);
    }

    #[tokio::test]
    async fn single_use_replay_returns_original_allocation() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        voucher(&h, "once", 5, true).await;
        let code = VoucherCode::new("once");
        let alice = PayerId::new("alice");

        let first = h.engine.redeem(&code, &alice).await.unwrap();
        let second = h.engine.redeem(&code, &alice).await.unwrap();

        assert!(second.is_replay());
        assert_eq!(first.allocation, second.allocation);
        assert_eq!(h.store.voucher("once").await.unwrap().redemption_count, 1);
        assert_eq!(h.store.competition("pi-phone").await.unwrap().tickets_sold, 2);
    }

    #[tokio::test]
    async fn multi_use_vouchers_key_by_counter() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        voucher(&h, "many", 3, false).await;
        let code = VoucherCode::new("many");
        let alice = PayerId::new("alice");

        let first = h.engine.redeem(&code, &alice).await.unwrap();
        let second = h.engine.redeem(&code, &alice).await.unwrap();

        assert_eq!(first.allocation.payment_id.as_str(), "voucher:MANY:#1");
        assert_eq!(second.allocation.payment_id.as_str(), "voucher:MANY:#2");
        assert_eq!(second.allocation.ticket_numbers.to_vec(), vec![3, 4]);
    }

    #[tokio::test]
    async fn last_redemption_goes_to_exactly_one_of_two_concurrent_requests() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        voucher(&h, "last", 1, true).await;

        let tasks: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|who| {
                let engine = h.engine.clone();
                tokio::spawn(async move {
                    engine.redeem(&VoucherCode::new("last"), &PayerId::new(who)).await
                })
            })
            .collect();
        let results: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::VoucherExhausted(_)))));
        assert_eq!(h.store.voucher("last").await.unwrap().redemption_count, 1);
    }

    #[tokio::test]
    async fn expired_and_unknown_codes_are_refused() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        voucher(&h, "soon", 5, true).await;
        h.clock.advance(Duration::days(2));

        let err = h
            .engine
            .redeem(&VoucherCode::new("soon"), &PayerId::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VoucherExpired(_)));

        let err = h
            .engine
            .redeem(&VoucherCode::new("nope"), &PayerId::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VoucherNotFound(_)));
    }

    #[tokio::test]
    async fn allocator_rejection_rolls_back_the_claim() {
        let h = Harness::new().await;
        h.competition("pi-phone", 1, CompetitionStatus::Active).await;
        voucher(&h, "big", 5, true).await;

        let err = h
            .engine
            .redeem(&VoucherCode::new("big"), &PayerId::new("alice"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::CapacityExceeded { .. }));
        assert_eq!(h.store.voucher("big").await.unwrap().redemption_count, 0);
        assert!(h.store.payment("voucher:BIG:alice").await.is_none());
    }
}
