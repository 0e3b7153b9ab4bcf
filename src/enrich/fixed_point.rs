//! Fixed-point decimal with 18 implied fractional digits.
//!
//! Token amounts and prices never pass through `f64`; values are stored as a
//! scaled `BigInt` so that `250 / 100` is exactly `2.5`.

use num_bigint::{BigInt, BigUint, Sign};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::TradeError;

/// Number of implied fractional digits.
pub const SCALE_DIGITS: usize = 18;
const SCALE: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedDecimal {
    raw: BigInt,
}

impl FixedDecimal {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Wraps an already-scaled value (`raw / 10^18`).
    pub fn from_raw(raw: BigInt) -> Self {
        Self { raw }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            raw: BigInt::from(value) * BigInt::from(SCALE),
        }
    }

    pub fn raw(&self) -> &BigInt {
        &self.raw
    }

    /// Parses `[+-]digits[.digits]`. Fractional digits past the 18th are
    /// truncated.
    pub fn parse(value: &str) -> Result<Self, TradeError> {
        let invalid = |reason| TradeError::InvalidAmount {
            value: value.to_string(),
            reason,
        };

        let trimmed = value.trim();
        let (sign, unsigned) = match trimmed.as_bytes().first() {
            Some(b'-') => (Sign::Minus, &trimmed[1..]),
            Some(b'+') => (Sign::Plus, &trimmed[1..]),
            Some(_) => (Sign::Plus, trimmed),
            None => return Err(invalid("empty")),
        };

        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((i, f)) => (i, f),
            None => (unsigned, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("no digits"));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid("non-digit character"));
        }

        let mut digits = String::with_capacity(int_part.len() + SCALE_DIGITS);
        digits.push_str(if int_part.is_empty() { "0" } else { int_part });
        let kept = &frac_part[..frac_part.len().min(SCALE_DIGITS)];
        digits.push_str(kept);
        for _ in kept.len()..SCALE_DIGITS {
            digits.push('0');
        }

        let magnitude =
            BigUint::parse_bytes(digits.as_bytes(), 10).ok_or_else(|| invalid("overflow"))?;
        Ok(Self {
            raw: BigInt::from_biguint(sign, magnitude),
        })
    }

    pub fn is_zero(&self) -> bool {
        self.raw.sign() == Sign::NoSign
    }

    pub fn is_negative(&self) -> bool {
        self.raw.sign() == Sign::Minus
    }

    pub fn is_positive(&self) -> bool {
        self.raw.sign() == Sign::Plus
    }

    pub fn abs(&self) -> Self {
        Self {
            raw: BigInt::from_biguint(Sign::Plus, self.raw.magnitude().clone()),
        }
    }

    /// `self / divisor`, truncated toward zero. `None` when dividing by zero.
    pub fn checked_div(&self, divisor: &Self) -> Option<Self> {
        if divisor.is_zero() {
            return None;
        }
        let scaled = &self.raw * BigInt::from(SCALE);
        Some(Self {
            raw: scaled / &divisor.raw,
        })
    }

    /// Renders with exactly `places` fractional digits (truncated).
    pub fn to_string_fixed(&self, places: usize) -> String {
        let (int_part, frac) = self.split();
        let places = places.min(SCALE_DIGITS);
        let sign = if self.is_negative() { "-" } else { "" };
        if places == 0 {
            return format!("{}{}", sign, int_part);
        }
        format!("{}{}.{}", sign, int_part, &frac[..places])
    }

    fn split(&self) -> (BigUint, String) {
        let scale = BigUint::from(SCALE);
        let magnitude = self.raw.magnitude();
        let int_part = magnitude / &scale;
        let frac = magnitude % &scale;
        (int_part, format!("{:0>width$}", frac.to_string(), width = SCALE_DIGITS))
    }
}

impl fmt::Display for FixedDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (int_part, frac) = self.split();
        let frac = frac.trim_end_matches('0');
        let sign = if self.is_negative() { "-" } else { "" };
        if frac.is_empty() {
            write!(f, "{}{}", sign, int_part)
        } else {
            write!(f, "{}{}.{}", sign, int_part, frac)
        }
    }
}

impl Serialize for FixedDecimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FixedDecimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FixedDecimal::parse(&s).map_err(serde::de::Error::custom)
    }
}
