//! Identifier and value types shared across the engine.
//!
//! Identifiers are thin newtypes so a payment id can never be passed where a
//! competition slug is expected. [`Amount`] stores money as integer micro-units;
//! the payment processor reports decimals, which are converted once at the edge.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty after trimming whitespace.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// The payment processor's identifier for a payment. Primary key of the ledger.
    PaymentId
);

string_id!(
    /// The on-chain transaction id reported by the processor once a payment is verified.
    TransactionId
);

string_id!(
    /// Stable, human-readable competition identifier used in URLs and payment metadata.
    CompetitionSlug
);

string_id!(
    /// The processor's identity for the buyer (or a voucher redeemer).
    PayerId
);

/// Internal competition identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompetitionId(Uuid);

impl CompetitionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CompetitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Voucher code. Codes are compared case-insensitively, so the
/// constructor trims and uppercases.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VoucherCode(String);

impl VoucherCode {
    /// Normalize and wrap a code.
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_uppercase())
    }

    /// Borrow the normalized code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the code is empty.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for VoucherCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VoucherCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Micro-units per whole currency unit.
pub const MICROS_PER_UNIT: u64 = 1_000_000;

/// Basis points in 100%.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// A non-negative monetary amount in micro-units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Build from micro-units.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Convert a decimal amount as reported by the processor.
    ///
    /// Returns `None` for negative, non-finite or out-of-range values.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let micros = (value * MICROS_PER_UNIT as f64).round();
        if micros > u64::MAX as f64 {
            return None;
        }
        Some(Self(micros as u64))
    }

    /// Micro-units.
    #[must_use]
    pub const fn micros(self) -> u64 {
        self.0
    }

    /// Lossy decimal view, for display and provider comparisons only.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_decimal(self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT as f64
    }

    /// `self * bps / 10_000`, rounded down.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn fraction_bps(self, bps: u32) -> Self {
        let scaled = u128::from(self.0) * u128::from(bps) / u128::from(BPS_DENOMINATOR);
        Self(u64::try_from(scaled).unwrap_or(u64::MAX))
    }

    /// Checked addition.
    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_UNIT;
        let frac = self.0 % MICROS_PER_UNIT;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:06}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}
