//! Fixed-point monetary amounts
//!
//! All consensus values are counted in base units (10^-8 of a coin) as
//! unsigned integers. Floating point never participates in consensus
//! arithmetic; decimal strings at the boundary are parsed exactly and
//! rejected on precision loss.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, CoreResult};

/// Base units per whole coin.
pub const COIN: u64 = 100_000_000;

/// Hard supply cap: 121,000,000 coins in base units.
pub const MAX_SUPPLY: u64 = 121_000_000 * COIN;

/// A non-negative count of base units.
///
/// Arithmetic is checked: any operation that would exceed [`MAX_SUPPLY`]
/// or underflow returns an error instead of wrapping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(MAX_SUPPLY);

    /// Construct from raw base units. Fails above the supply cap.
    pub fn from_base_units(units: u64) -> CoreResult<Self> {
        if units > MAX_SUPPLY {
            return Err(CoreError::AmountOutOfRange(format!(
                "{units} base units exceeds max supply"
            )));
        }
        Ok(Amount(units))
    }

    /// Construct from a whole number of coins.
    pub fn from_coins(coins: u64) -> CoreResult<Self> {
        let units = coins
            .checked_mul(COIN)
            .ok_or_else(|| CoreError::AmountOutOfRange(format!("{coins} coins overflows")))?;
        Self::from_base_units(units)
    }

    /// Raw base units.
    pub fn base_units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> CoreResult<Amount> {
        let sum = self
            .0
            .checked_add(other.0)
            .ok_or_else(|| CoreError::AmountOutOfRange("addition overflow".into()))?;
        Self::from_base_units(sum)
    }

    pub fn checked_sub(self, other: Amount) -> CoreResult<Amount> {
        let diff = self.0.checked_sub(other.0).ok_or_else(|| {
            CoreError::AmountOutOfRange(format!("{} - {} underflows", self.0, other.0))
        })?;
        Ok(Amount(diff))
    }

    pub fn checked_mul(self, factor: u64) -> CoreResult<Amount> {
        let product = self
            .0
            .checked_mul(factor)
            .ok_or_else(|| CoreError::AmountOutOfRange("multiplication overflow".into()))?;
        Self::from_base_units(product)
    }

    /// Division with round-half-up on the remainder.
    pub fn div_rounded(self, divisor: u64) -> CoreResult<Amount> {
        if divisor == 0 {
            return Err(CoreError::AmountOutOfRange("division by zero".into()));
        }
        let quotient = self.0 / divisor;
        let remainder = self.0 % divisor;
        let rounded = if remainder * 2 >= divisor {
            quotient + 1
        } else {
            quotient
        };
        Self::from_base_units(rounded)
    }

    /// Sum an iterator of amounts with overflow checking.
    pub fn sum<I: IntoIterator<Item = Amount>>(iter: I) -> CoreResult<Amount> {
        let mut total = Amount::ZERO;
        for amount in iter {
            total = total.checked_add(amount)?;
        }
        Ok(total)
    }

    /// Parse a decimal coin string ("12.5", "0.00000001") exactly.
    ///
    /// More than 8 fractional digits is precision the chain cannot
    /// represent and is rejected rather than rounded.
    pub fn from_decimal_str(s: &str) -> CoreResult<Amount> {
        let s = s.trim();
        if s.is_empty() || s.starts_with('-') || s.starts_with('+') {
            return Err(CoreError::AmountOutOfRange(format!("bad decimal '{s}'")));
        }
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(CoreError::AmountOutOfRange(format!("bad decimal '{s}'")));
        }
        if frac_part.len() > 8 {
            return Err(CoreError::AmountOutOfRange(format!(
                "'{s}' has sub-base-unit precision"
            )));
        }
        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| CoreError::AmountOutOfRange(format!("bad decimal '{s}'")))?
        };
        let mut frac: u64 = 0;
        if !frac_part.is_empty() {
            frac = frac_part
                .parse()
                .map_err(|_| CoreError::AmountOutOfRange(format!("bad decimal '{s}'")))?;
            for _ in 0..(8 - frac_part.len()) {
                frac *= 10;
            }
        }
        let units = whole
            .checked_mul(COIN)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| CoreError::AmountOutOfRange(format!("'{s}' overflows")))?;
        Self::from_base_units(units)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / COIN;
        let frac = self.0 % COIN;
        if frac == 0 {
            write!(f, "{whole}")
        } else {
            let s = format!("{frac:08}");
            write!(f, "{}.{}", whole, s.trim_end_matches('0'))
        }
    }
}
