//! A Bitcoin amount newtype which maintains the invariant that it never goes
//! negative and never exceeds the maximum possible satoshi supply.
//!
//! Internally represented as millisatoshis (the finest unit used anywhere in
//! this workspace: on-chain amounts are always whole satoshis, but HTLC
//! amounts are msat), so conversions between the two are infallible in one
//! direction and checked in the other.

use std::fmt::{self, Display};
use std::ops::{Add, Sub};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum Error {
    #[error("amount is negative")]
    Negative,
    #[error("amount is too large")]
    TooLarge,
    #[error("msat amount is not a whole number of satoshis")]
    NotWholeSats,
}

/// A non-negative amount of bitcoin, stored as millisatoshis.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct Amount(u64);

impl Amount {
    /// 21 million BTC, expressed in msat. The maximum amount that can ever
    /// exist; used as a sanity bound on construction.
    pub const MAX_SUPPLY_MSAT: u64 = 21_000_000 * 100_000_000 * 1000;

    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn from_msat(msat: u64) -> Self {
        // Saturating rather than panicking: msat values arriving from an
        // onion payload are untrusted but bounded by u64 already.
        Self(msat.min(Self::MAX_SUPPLY_MSAT))
    }

    #[inline]
    pub fn from_sats(sats: u64) -> Self {
        Self::from_msat(sats.saturating_mul(1000))
    }

    #[inline]
    pub fn msat(self) -> u64 {
        self.0
    }

    /// Returns `None` if the amount is not a whole number of satoshis (e.g.
    /// an in-flight HTLC part that hasn't yet been rounded to chain units).
    #[inline]
    pub fn checked_sats(self) -> Option<u64> {
        if self.0 % 1000 == 0 {
            Some(self.0 / 1000)
        } else {
            None
        }
    }

    /// Truncating conversion to whole satoshis, rounding down.
    #[inline]
    pub fn sats_floor(self) -> u64 {
        self.0 / 1000
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} msat", self.0)
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        self.checked_add(rhs).expect("Amount overflow")
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        self.checked_sub(rhs).expect("Amount underflow")
    }
}

impl TryFrom<bitcoin::Amount> for Amount {
    type Error = Error;
    fn try_from(amt: bitcoin::Amount) -> Result<Self, Self::Error> {
        amt.to_sat()
            .checked_mul(1000)
            .map(Self)
            .ok_or(Error::TooLarge)
    }
}

impl TryFrom<Amount> for bitcoin::Amount {
    type Error = Error;
    fn try_from(amt: Amount) -> Result<Self, Self::Error> {
        amt.checked_sats()
            .map(bitcoin::Amount::from_sat)
            .ok_or(Error::NotWholeSats)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn msat_sats_roundtrip() {
        let amount = Amount::from_sats(42_069);
        assert_eq!(amount.msat(), 42_069_000);
        assert_eq!(amount.checked_sats(), Some(42_069));
        assert_eq!(amount.sats_floor(), 42_069);
    }

    #[test]
    fn non_whole_sats_has_no_checked_conversion() {
        let amount = Amount::from_msat(1_500);
        assert_eq!(amount.checked_sats(), None);
        assert_eq!(amount.sats_floor(), 1);
    }

    #[test]
    fn add_sub_are_inverses() {
        let a = Amount::from_sats(1_000);
        let b = Amount::from_sats(400);
        assert_eq!((a + b) - b, a);
        assert_eq!(a.checked_sub(a + b), None);
    }

    #[test]
    fn bitcoin_amount_conversion() {
        let btc_amt = bitcoin::Amount::from_sat(12_345);
        let amount = Amount::try_from(btc_amt).unwrap();
        assert_eq!(amount, Amount::from_sats(12_345));
        assert_eq!(bitcoin::Amount::try_from(amount).unwrap(), btc_amt);
    }

    mod proptests {
        use proptest::{prelude::any, prop_assert, prop_assert_eq, proptest};

        use super::*;

        proptest! {
            #[test]
            fn from_msat_never_exceeds_max_supply(msat in any::<u64>()) {
                let amount = Amount::from_msat(msat);
                prop_assert!(amount.msat() <= Amount::MAX_SUPPLY_MSAT);
            }

            #[test]
            fn checked_add_then_checked_sub_is_identity(
                a in 0..=Amount::MAX_SUPPLY_MSAT,
                b in 0..=Amount::MAX_SUPPLY_MSAT,
            ) {
                let amount_a = Amount::from_msat(a);
                let amount_b = Amount::from_msat(b);
                if let Some(sum) = amount_a.checked_add(amount_b) {
                    prop_assert_eq!(sum.checked_sub(amount_b), Some(amount_a));
                }
            }

            #[test]
            fn sats_floor_never_exceeds_the_exact_msat_value(msat in any::<u64>()) {
                let amount = Amount::from_msat(msat);
                prop_assert!(amount.sats_floor() * 1000 <= amount.msat());
            }
        }
    }
}
