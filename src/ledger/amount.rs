// Fixed-point HOP amounts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;
use thiserror::Error;

/// Number of micro-HOP in one HOP
pub const MICRO_PER_HOP: u64 = 1_000_000;

const MICRO_DIGITS: usize = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount format: {0}")]
    InvalidFormat(String),

    #[error("Too many decimal places (max {MICRO_DIGITS})")]
    TooPrecise,

    #[error("Amount overflow")]
    Overflow,
}

/// A non-negative amount of HOP, stored as integer micro-HOP
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_micro(micro: u64) -> Self {
        Self(micro)
    }

    /// Whole HOP; saturates instead of wrapping
    pub const fn from_hop(hop: u64) -> Self {
        Self(hop.saturating_mul(MICRO_PER_HOP))
    }

    pub const fn micro(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Amount::saturating_add)
    }
}

/// Displays with four decimals, the precision wallets show
impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICRO_PER_HOP;
        let frac = (self.0 % MICRO_PER_HOP) / 100;
        write!(f, "{}.{:04}", whole, frac)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches("HOP").trim();
        if s.is_empty() {
            return Err(AmountError::InvalidFormat("empty".to_string()));
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > MICRO_DIGITS {
            return Err(AmountError::TooPrecise);
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| AmountError::InvalidFormat(s.to_string()))?
        };
        let frac_micro: u64 = if frac.is_empty() {
            0
        } else {
            if !frac.chars().all(|c| c.is_ascii_digit()) {
                return Err(AmountError::InvalidFormat(s.to_string()));
            }
            let padded = format!("{:0<width$}", frac, width = MICRO_DIGITS);
            padded
                .parse()
                .map_err(|_| AmountError::InvalidFormat(s.to_string()))?
        };

        whole
            .checked_mul(MICRO_PER_HOP)
            .and_then(|w| w.checked_add(frac_micro))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }
}
