//! Ticket allocation results and the allocation policy.
//!
//! A reservation is derived from the post-increment value of `ticketsSold`
//! returned by the storage engine: `after - quantity + 1 ..= after`. Because
//! the increment is atomic, two reservations can never overlap.

use crate::competition::CompetitionStatus;
use crate::types::{CompetitionSlug, PaymentId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default upper bound on tickets in a single entry.
pub const DEFAULT_MAX_TICKETS_PER_ENTRY: u32 = 100;

/// Default share of each payment added to the prize pool, in basis points.
pub const DEFAULT_PRIZE_POOL_BPS: u32 = 5_000;

/// An inclusive range of ticket numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketNumbers {
    /// First ticket number (1-based).
    pub first: u32,
    /// Last ticket number, inclusive.
    pub last: u32,
}

impl TicketNumbers {
    /// Build the range ending at the post-increment value `after`.
    ///
    /// Returns `None` for a zero quantity or when `after < quantity`.
    #[must_use]
    pub fn from_post_increment(after: u32, quantity: u32) -> Option<Self> {
        if quantity == 0 || after < quantity {
            return None;
        }
        Some(Self {
            first: after - quantity + 1,
            last: after,
        })
    }

    /// Number of tickets in the range.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Ranges are never empty; provided for clippy's `len_without_is_empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Iterate the numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.first..=self.last
    }

    /// Expand into a list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }
}

impl fmt::Display for TicketNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// Result of a successful conditional increment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Competition the tickets belong to.
    pub competition: CompetitionSlug,
    /// Issued numbers.
    pub ticket_numbers: TicketNumbers,
    /// `ticketsSold` after the increment.
    pub tickets_sold_after: u32,
    /// Competition status after the increment.
    pub status_after: CompetitionStatus,
}

/// Why the allocator refused a reservation. Terminal for the attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationRejection {
    /// Would oversell.
    CapacityExceeded {
        /// Tickets requested.
        requested: u32,
        /// Tickets left at evaluation time.
        remaining: u32,
    },
    /// Status outside the allowed set.
    StatusNotAllocatable(CompetitionStatus),
    /// Before `startsAt`.
    NotStarted,
    /// After `endsAt`.
    Ended,
}

impl fmt::Display for AllocationRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { requested, remaining } => {
                write!(f, "requested {requested} tickets, {remaining} remaining")
            }
            Self::StatusNotAllocatable(status) => write!(f, "competition is {status}"),
            Self::NotStarted => f.write_str("competition has not started"),
            Self::Ended => f.write_str("competition has ended"),
        }
    }
}

/// Allocation rules that are configuration rather than code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationPolicy {
    /// Statuses in which tickets may be issued.
    pub allowed_statuses: Vec<CompetitionStatus>,
    /// Upper bound on `quantity` per entry.
    pub max_tickets_per_entry: u32,
    /// Share of each payment added to the prize pool, in basis points.
    pub prize_pool_bps: u32,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            allowed_statuses: vec![
                CompetitionStatus::Active,
                CompetitionStatus::Pending,
                CompetitionStatus::Draft,
            ],
            max_tickets_per_entry: DEFAULT_MAX_TICKETS_PER_ENTRY,
            prize_pool_bps: DEFAULT_PRIZE_POOL_BPS,
        }
    }
}

impl AllocationPolicy {
    /// Whether `status` is in the allowed set.
    #[must_use]
    pub fn allows(&self, status: CompetitionStatus) -> bool {
        self.allowed_statuses.contains(&status)
    }

    /// Storage strings of the allowed set, for SQL `= ANY($n)` binds.
    #[must_use]
    pub fn allowed_status_strings(&self) -> Vec<String> {
        self.allowed_statuses.iter().map(|s| s.as_str().to_string()).collect()
    }
}

/// The tickets issued for one payment or voucher redemption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketAllocation {
    /// Ledger key the allocation is recorded under.
    pub payment_id: PaymentId,
    /// Competition the tickets belong to.
    pub competition: CompetitionSlug,
    /// Issued numbers.
    pub ticket_numbers: TicketNumbers,
    /// `ticketsSold` right after this allocation.
    pub tickets_sold_after: u32,
    /// Competition status right after this allocation.
    pub competition_status_after: CompetitionStatus,
}

/// Whether a settlement wrote anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleOutcome {
    /// Tickets were issued by this call.
    Settled,
    /// The ledger already held a completed record; nothing was written.
    AlreadyCompleted,
}

/// Result of settling a payment or redeeming a voucher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    /// The allocation, fresh or replayed.
    pub allocation: TicketAllocation,
    /// Fresh or replayed.
    pub outcome: SettleOutcome,
}

impl Settlement {
    /// Whether this call was a no-op replay.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.outcome == SettleOutcome::AlreadyCompleted
    }
}
