//! Vouchers: pre-paid entries redeemed through the same allocator as payments.

use crate::types::{CompetitionSlug, PayerId, PaymentId, VoucherCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored voucher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    /// Normalized code.
    pub code: VoucherCode,
    /// Competition the voucher is bound to.
    pub competition: CompetitionSlug,
    /// Tickets granted per redemption.
    pub quantity: u32,
    /// Total redemptions allowed.
    pub redemption_cap: u32,
    /// Redemptions so far. Only the conditional increment changes it.
    pub redemption_count: u32,
    /// No redemptions after this instant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether a redeemer may use the code only once.
    pub single_use_per_user: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Voucher {
    /// Redemptions left.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.redemption_cap.saturating_sub(self.redemption_count)
    }

    /// Whether the voucher has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Ledger key for a redemption.
    ///
    /// Single-use vouchers key by redeemer so replays find the original entry;
    /// others key by the post-increment redemption counter.
    #[must_use]
    pub fn ledger_key(&self, redeemer: &PayerId, redemption_number: u32) -> PaymentId {
        if self.single_use_per_user {
            PaymentId::new(format!("voucher:{}:{}", self.code, redeemer))
        } else {
            PaymentId::new(format!("voucher:{}:#{}", self.code, redemption_number))
        }
    }
}

/// Input for creating a voucher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVoucher {
    /// Code; normalized on deserialization.
    pub code: VoucherCode,
    /// Bound competition.
    pub competition: CompetitionSlug,
    /// Tickets per redemption.
    pub quantity: u32,
    /// Total redemptions allowed.
    pub redemption_cap: u32,
    /// Optional expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// One redemption per redeemer.
    #[serde(default = "default_single_use")]
    pub single_use_per_user: bool,
}

const fn default_single_use() -> bool {
    true
}

impl NewVoucher {
    /// Materialize the stored row.
    #[must_use]
    pub fn into_voucher(self, now: DateTime<Utc>) -> Voucher {
        Voucher {
            code: self.code,
            competition: self.competition,
            quantity: self.quantity,
            redemption_cap: self.redemption_cap,
            redemption_count: 0,
            expires_at: self.expires_at,
            single_use_per_user: self.single_use_per_user,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn voucher(single_use: bool) -> Voucher {
        NewVoucher {
            code: VoucherCode::new("free5"),
            competition: CompetitionSlug::new("pi-phone"),
            quantity: 5,
            redemption_cap: 2,
            expires_at: None,
            single_use_per_user: single_use,
        }
        .into_voucher(Utc::now())
    }

    #[test]
    fn ledger_keys_follow_dedupe_mode() {
        let redeemer = PayerId::new("alice");
        assert_eq!(voucher(true).ledger_key(&redeemer, 1).as_str(), "voucher:FREE5:alice");
        assert_eq!(voucher(false).ledger_key(&redeemer, 2).as_str(), "voucher:FREE5:#2");
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let mut v = voucher(true);
        let now = Utc::now();
        assert!(!v.is_expired(now));
        v.expires_at = Some(now);
        assert!(!v.is_expired(now));
        assert!(v.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn remaining_saturates() {
        let mut v = voucher(false);
        v.redemption_count = 5;
        assert_eq!(v.remaining(), 0);
    }
}
