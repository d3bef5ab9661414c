//! Competitions: fixed-capacity ticket inventory with a time window.

use crate::allocation::{AllocationPolicy, AllocationRejection, Reservation, TicketNumbers};
use crate::types::{Amount, CompetitionId, CompetitionSlug};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a competition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionStatus {
    /// Being set up.
    Draft,
    /// Published, waiting for its start.
    Pending,
    /// Open for entries.
    Active,
    /// Temporarily closed by an operator.
    Paused,
    /// Sold out or drawn.
    Completed,
    /// Cancelled; completed entries are owed a refund.
    Cancelled,
}

impl CompetitionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Draft,
        Self::Pending,
        Self::Active,
        Self::Paused,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Convert to the storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the storage string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for CompetitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A competition as stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Competition {
    /// Internal id.
    pub id: CompetitionId,
    /// Unique slug.
    pub slug: CompetitionSlug,
    /// Display title.
    pub title: String,
    /// Capacity.
    pub total_tickets: u32,
    /// Tickets issued so far. Only the allocator increases it.
    pub tickets_sold: u32,
    /// Entries accepted from this instant.
    pub starts_at: DateTime<Utc>,
    /// Entries accepted until this instant (inclusive).
    pub ends_at: DateTime<Utc>,
    /// Current status.
    pub status: CompetitionStatus,
    /// Accumulated prize pool.
    pub prize_pool: Amount,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Competition {
    /// Tickets still available.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.total_tickets.saturating_sub(self.tickets_sold)
    }

    /// Whether every ticket has been issued.
    #[must_use]
    pub const fn is_sold_out(&self) -> bool {
        self.tickets_sold >= self.total_tickets
    }

    /// Evaluate the allocation predicate without mutating anything.
    ///
    /// Storage engines evaluate the same predicate atomically; this is used for
    /// advisory pre-checks and to explain why a conditional update matched no row.
    ///
    /// # Errors
    ///
    /// Returns the first failing condition, checked in the order sold out,
    /// status, window, capacity. A competition completed by its last sale
    /// reports [`AllocationRejection::CapacityExceeded`], not its status.
    pub fn check_allocatable(
        &self,
        quantity: u32,
        policy: &AllocationPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), AllocationRejection> {
        if self.status == CompetitionStatus::Completed && self.is_sold_out() {
            return Err(AllocationRejection::CapacityExceeded {
                requested: quantity,
                remaining: 0,
            });
        }
        if !policy.allows(self.status) {
            return Err(AllocationRejection::StatusNotAllocatable(self.status));
        }
        if now < self.starts_at {
            return Err(AllocationRejection::NotStarted);
        }
        if now > self.ends_at {
            return Err(AllocationRejection::Ended);
        }
        let fits = self
            .tickets_sold
            .checked_add(quantity)
            .is_some_and(|after| after <= self.total_tickets);
        if quantity == 0 || !fits {
            return Err(AllocationRejection::CapacityExceeded {
                requested: quantity,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Whether an operator may move the competition to `to`.
    ///
    /// # Errors
    ///
    /// Returns the reason the change is refused.
    pub fn check_status_change(&self, to: CompetitionStatus) -> Result<(), String> {
        if self.status == CompetitionStatus::Cancelled && to != CompetitionStatus::Cancelled {
            return Err("a cancelled competition cannot be reopened".into());
        }
        if to == CompetitionStatus::Completed && !self.is_sold_out() {
            return Err(format!(
                "cannot complete with {} tickets remaining",
                self.remaining()
            ));
        }
        Ok(())
    }

    /// Whether capacity may change to `total_tickets`.
    ///
    /// # Errors
    ///
    /// Returns the reason the change is refused.
    pub fn check_capacity_change(&self, total_tickets: u32) -> Result<(), String> {
        if total_tickets == 0 {
            return Err("total tickets must be at least 1".into());
        }
        if total_tickets < self.tickets_sold {
            return Err(format!(
                "total tickets {total_tickets} below {} already sold",
                self.tickets_sold
            ));
        }
        Ok(())
    }

    /// Apply a reservation in place: the in-process form of the conditional increment.
    ///
    /// Callers must hold exclusive access to the competition for the duration.
    ///
    /// # Errors
    ///
    /// Returns the rejection from [`Self::check_allocatable`] and leaves `self` untouched.
    pub fn reserve_in_place(
        &mut self,
        quantity: u32,
        policy: &AllocationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Reservation, AllocationRejection> {
        self.check_allocatable(quantity, policy, now)?;
        let after = self.tickets_sold + quantity;
        let ticket_numbers = TicketNumbers::from_post_increment(after, quantity).ok_or(
            AllocationRejection::CapacityExceeded {
                requested: quantity,
                remaining: self.remaining(),
            },
        )?;
        self.tickets_sold = after;
        if after == self.total_tickets {
            self.status = CompetitionStatus::Completed;
        }
        self.updated_at = now;
        Ok(Reservation {
            competition: self.slug.clone(),
            ticket_numbers,
            tickets_sold_after: after,
            status_after: self.status,
        })
    }
}

/// Input for creating a competition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCompetition {
    /// Unique slug.
    pub slug: CompetitionSlug,
    /// Display title.
    pub title: String,
    /// Capacity, at least 1.
    pub total_tickets: u32,
    /// Window start.
    pub starts_at: DateTime<Utc>,
    /// Window end.
    pub ends_at: DateTime<Utc>,
    /// Initial status; defaults to draft.
    #[serde(default = "default_status")]
    pub status: CompetitionStatus,
}

const fn default_status() -> CompetitionStatus {
    CompetitionStatus::Draft
}

impl NewCompetition {
    /// Materialize the stored row.
    #[must_use]
    pub fn into_competition(self, now: DateTime<Utc>) -> Competition {
        Competition {
            id: CompetitionId::generate(),
            slug: self.slug,
            title: self.title,
            total_tickets: self.total_tickets,
            tickets_sold: 0,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            status: self.status,
            prize_pool: Amount::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}
