//! Row mapping and shared single-row queries.
//!
//! Helpers take `&mut PgConnection` so the same statement runs on a pooled
//! connection or inside a unit of work's transaction.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use ticket_engine_core::allocation::TicketNumbers;
use ticket_engine_core::competition::{Competition, CompetitionStatus};
use ticket_engine_core::error::{EngineResult, StoreError};
use ticket_engine_core::ledger::{EntryMetadata, NewPayment, PaymentRecord, PaymentState, UpsertOutcome};
use ticket_engine_core::types::{
    Amount, CompetitionId, CompetitionSlug, PayerId, PaymentId, TransactionId, VoucherCode,
};
use ticket_engine_core::voucher::Voucher;

pub const PAYMENT_COLUMNS: &str = "payment_id, state, amount_micros, payer, metadata, \
     transaction_id, first_ticket, last_ticket, tickets_sold_after, competition_status_after, \
     last_error, created_at, updated_at, completed_at";

pub const COMPETITION_COLUMNS: &str = "id, slug, title, total_tickets, tickets_sold, starts_at, \
     ends_at, status, prize_pool_micros, created_at, updated_at";

pub const VOUCHER_COLUMNS: &str = "code, competition_slug, quantity, redemption_cap, \
     redemption_count, expires_at, single_use_per_user, created_at";

pub fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

pub fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Serialization(format!("{value} exceeds INTEGER")))
}

pub fn to_i64(amount: Amount) -> Result<i64, StoreError> {
    i64::try_from(amount.micros())
        .map_err(|_| StoreError::Serialization(format!("{amount} exceeds BIGINT")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column}: negative value {value}")))
}

fn competition_status(value: &str) -> Result<CompetitionStatus, StoreError> {
    CompetitionStatus::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown competition status {value}")))
}

pub fn payment_from_row(row: &PgRow) -> Result<PaymentRecord, StoreError> {
    let state: String = get(row, "state")?;
    let state = PaymentState::parse(&state)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown payment state {state}")))?;
    let amount: i64 = get(row, "amount_micros")?;
    let amount = u64::try_from(amount)
        .map(Amount::from_micros)
        .map_err(|_| StoreError::Corrupt(format!("negative amount {amount}")))?;
    let metadata: serde_json::Value = get(row, "metadata")?;
    let metadata: EntryMetadata =
        serde_json::from_value(metadata).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let first: Option<i32> = get(row, "first_ticket")?;
    let last: Option<i32> = get(row, "last_ticket")?;
    let ticket_numbers = match (first, last) {
        (Some(first), Some(last)) => Some(TicketNumbers {
            first: to_u32(first, "first_ticket")?,
            last: to_u32(last, "last_ticket")?,
        }),
        _ => None,
    };
    let tickets_sold_after: Option<i32> = get(row, "tickets_sold_after")?;
    let status_after: Option<String> = get(row, "competition_status_after")?;

    Ok(PaymentRecord {
        payment_id: PaymentId::new(get::<String>(row, "payment_id")?),
        state,
        amount,
        payer: PayerId::new(get::<String>(row, "payer")?),
        metadata,
        transaction_id: get::<Option<String>>(row, "transaction_id")?.map(TransactionId::new),
        ticket_numbers,
        tickets_sold_after: tickets_sold_after
            .map(|v| to_u32(v, "tickets_sold_after"))
            .transpose()?,
        competition_status_after: status_after.as_deref().map(competition_status).transpose()?,
        last_error: get(row, "last_error")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        completed_at: get(row, "completed_at")?,
    })
}

pub fn competition_from_row(row: &PgRow) -> Result<Competition, StoreError> {
    let status: String = get(row, "status")?;
    let prize_pool: i64 = get(row, "prize_pool_micros")?;
    Ok(Competition {
        id: CompetitionId::from_uuid(get(row, "id")?),
        slug: CompetitionSlug::new(get::<String>(row, "slug")?),
        title: get(row, "title")?,
        total_tickets: to_u32(get(row, "total_tickets")?, "total_tickets")?,
        tickets_sold: to_u32(get(row, "tickets_sold")?, "tickets_sold")?,
        starts_at: get(row, "starts_at")?,
        ends_at: get(row, "ends_at")?,
        status: competition_status(&status)?,
        prize_pool: Amount::from_micros(u64::try_from(prize_pool).unwrap_or(0)),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn voucher_from_row(row: &PgRow) -> Result<Voucher, StoreError> {
    Ok(Voucher {
        code: VoucherCode::new(get::<String>(row, "code")?),
        competition: CompetitionSlug::new(get::<String>(row, "competition_slug")?),
        quantity: to_u32(get(row, "quantity")?, "quantity")?,
        redemption_cap: to_u32(get(row, "redemption_cap")?, "redemption_cap")?,
        redemption_count: to_u32(get(row, "redemption_count")?, "redemption_count")?,
        expires_at: get(row, "expires_at")?,
        single_use_per_user: get(row, "single_use_per_user")?,
        created_at: get(row, "created_at")?,
    })
}

pub async fn select_payment(
    conn: &mut PgConnection,
    payment_id: &PaymentId,
    for_update: bool,
) -> Result<Option<PaymentRecord>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1{lock}");
    let row = sqlx::query(&sql)
        .bind(payment_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    row.as_ref().map(payment_from_row).transpose()
}

pub async fn select_competition(
    conn: &mut PgConnection,
    slug: &CompetitionSlug,
) -> Result<Option<Competition>, StoreError> {
    let sql = format!("SELECT {COMPETITION_COLUMNS} FROM competitions WHERE slug = $1");
    let row = sqlx::query(&sql)
        .bind(slug.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    row.as_ref().map(competition_from_row).transpose()
}

pub async fn select_voucher(
    conn: &mut PgConnection,
    code: &VoucherCode,
    for_update: bool,
) -> Result<Option<Voucher>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {VOUCHER_COLUMNS} FROM vouchers WHERE code = $1{lock}");
    let row = sqlx::query(&sql)
        .bind(code.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    row.as_ref().map(voucher_from_row).transpose()
}

/// `INSERT ... ON CONFLICT DO NOTHING`, then compare with the stored row on conflict.
pub async fn insert_payment(
    conn: &mut PgConnection,
    payment: NewPayment,
    now: chrono::DateTime<chrono::Utc>,
) -> EngineResult<UpsertOutcome> {
    let metadata =
        serde_json::to_value(&payment.metadata).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let sql = format!(
        "INSERT INTO payments (payment_id, state, amount_micros, payer, competition_slug, metadata, created_at, updated_at) \
         VALUES ($1, 'created', $2, $3, $4, $5, $6, $6) \
         ON CONFLICT (payment_id) DO NOTHING \
         RETURNING {PAYMENT_COLUMNS}"
    );
    let inserted = sqlx::query(&sql)
        .bind(payment.payment_id.as_str())
        .bind(to_i64(payment.amount)?)
        .bind(payment.payer.as_str())
        .bind(payment.metadata.competition().as_str())
        .bind(metadata)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;

    if let Some(row) = inserted {
        let record = payment_from_row(&row)?;
        tracing::debug!(payment_id = %record.payment_id, "Payment recorded");
        return Ok(UpsertOutcome::Inserted(record));
    }

    let existing = select_payment(conn, &payment.payment_id, false)
        .await?
        .ok_or_else(|| StoreError::Database("conflicting payment row vanished".into()))?;
    payment.resolve_existing(existing)
}
