//! [`VoucherStore`] for [`PostgresStore`].

use crate::PostgresStore;
use crate::rows::{VOUCHER_COLUMNS, db, select_competition, select_voucher, to_i32, voucher_from_row};
use chrono::{DateTime, Utc};
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::store::{BoxFuture, VoucherStore};
use ticket_engine_core::types::VoucherCode;
use ticket_engine_core::voucher::{NewVoucher, Voucher};

impl VoucherStore for PostgresStore {
    fn create_voucher(
        &self,
        voucher: NewVoucher,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<Voucher>> {
        Box::pin(async move {
            let mut conn = self.acquire().await?;
            if select_competition(&mut conn, &voucher.competition).await?.is_none() {
                return Err(EngineError::CompetitionNotFound(voucher.competition));
            }
            let sql = format!(
                "INSERT INTO vouchers \
                 (code, competition_slug, quantity, redemption_cap, redemption_count, expires_at, \
                  single_use_per_user, created_at) \
                 VALUES ($1, $2, $3, $4, 0, $5, $6, $7) \
                 ON CONFLICT (code) DO NOTHING \
                 RETURNING {VOUCHER_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(voucher.code.as_str())
                .bind(voucher.competition.as_str())
                .bind(to_i32(voucher.quantity)?)
                .bind(to_i32(voucher.redemption_cap)?)
                .bind(voucher.expires_at)
                .bind(voucher.single_use_per_user)
                .bind(now)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db)?
                .ok_or_else(|| {
                    EngineError::InvalidRequest(format!("voucher {} already exists", voucher.code))
                })?;
            let created = voucher_from_row(&row)?;
            tracing::info!(
                code = %created.code,
                competition = %created.competition,
                redemption_cap = created.redemption_cap,
                "Voucher created"
            );
            Ok(created)
        })
    }

    fn find_voucher<'a>(
        &'a self,
        code: &'a VoucherCode,
    ) -> BoxFuture<'a, Result<Option<Voucher>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.acquire().await?;
            select_voucher(&mut conn, code, false).await
        })
    }
}
