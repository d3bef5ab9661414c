//! [`CompetitionStore`] for [`PostgresStore`].

use crate::PostgresStore;
use crate::rows::{COMPETITION_COLUMNS, competition_from_row, db, select_competition, to_i32};
use chrono::{DateTime, Utc};
use ticket_engine_core::competition::{Competition, CompetitionStatus, NewCompetition};
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::store::{BoxFuture, CompetitionStore};
use ticket_engine_core::types::CompetitionSlug;

impl CompetitionStore for PostgresStore {
    fn create_competition(
        &self,
        competition: NewCompetition,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<Competition>> {
        Box::pin(async move {
            let competition = competition.into_competition(now);
            let sql = format!(
                "INSERT INTO competitions \
                 (id, slug, title, total_tickets, tickets_sold, starts_at, ends_at, status, \
                  prize_pool_micros, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, 0, $5, $6, $7, 0, $8, $8) \
                 ON CONFLICT (slug) DO NOTHING \
                 RETURNING {COMPETITION_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(competition.id.as_uuid())
                .bind(competition.slug.as_str())
                .bind(&competition.title)
                .bind(to_i32(competition.total_tickets)?)
                .bind(competition.starts_at)
                .bind(competition.ends_at)
                .bind(competition.status.as_str())
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?
                .ok_or_else(|| {
                    EngineError::InvalidRequest(format!(
                        "competition {} already exists",
                        competition.slug
                    ))
                })?;
            let created = competition_from_row(&row)?;
            tracing::info!(competition = %created.slug, total_tickets = created.total_tickets, "Competition created");
            Ok(created)
        })
    }

    fn find_competition<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
    ) -> BoxFuture<'a, Result<Option<Competition>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.acquire().await?;
            select_competition(&mut conn, slug).await
        })
    }

    fn update_total_tickets<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
        total_tickets: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Competition>> {
        Box::pin(async move {
            if total_tickets == 0 {
                return Err(EngineError::InvalidRequest(
                    "total tickets must be at least 1".into(),
                ));
            }
            let sql = format!(
                "UPDATE competitions \
                 SET total_tickets = $2, \
                     status = CASE WHEN tickets_sold = $2 THEN 'completed' ELSE status END, \
                     updated_at = $3 \
                 WHERE slug = $1 AND tickets_sold <= $2 \
                 RETURNING {COMPETITION_COLUMNS}"
            );
            let mut conn = self.acquire().await?;
            let row = sqlx::query(&sql)
                .bind(slug.as_str())
                .bind(to_i32(total_tickets)?)
                .bind(now)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db)?;
            if let Some(row) = row {
                let updated = competition_from_row(&row)?;
                tracing::info!(competition = %slug, total_tickets, status = %updated.status, "Competition capacity changed");
                return Ok(updated);
            }
            let current = select_competition(&mut conn, slug)
                .await?
                .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
            Err(EngineError::InvalidRequest(
                current
                    .check_capacity_change(total_tickets)
                    .err()
                    .unwrap_or_else(|| "capacity changed concurrently".into()),
            ))
        })
    }

    fn set_competition_status<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
        status: CompetitionStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Competition>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE competitions SET status = $2, updated_at = $3 \
                 WHERE slug = $1 \
                   AND (status <> 'cancelled' OR $2 = 'cancelled') \
                   AND ($2 <> 'completed' OR tickets_sold >= total_tickets) \
                 RETURNING {COMPETITION_COLUMNS}"
            );
            let mut conn = self.acquire().await?;
            let row = sqlx::query(&sql)
                .bind(slug.as_str())
                .bind(status.as_str())
                .bind(now)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db)?;
            if let Some(row) = row {
                tracing::info!(competition = %slug, status = %status, "Competition status changed");
                return Ok(competition_from_row(&row)?);
            }
            let current = select_competition(&mut conn, slug)
                .await?
                .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
            Err(EngineError::InvalidTransition(
                current
                    .check_status_change(status)
                    .err()
                    .unwrap_or_else(|| "status changed concurrently".into()),
            ))
        })
    }
}
