use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Monetary amounts are integers in minor units (cents for USD). Nothing in
/// the crate represents money as floating point, in memory or on the wire.
pub type AmountMinor = i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurrencyParseError {
    #[error("Currency code must be exactly three ASCII letters, got `{0}`")]
    BadCode(String),
}

/// Three-letter currency code, uppercased on construction.
///
/// Comparison is exact equality; there is no conversion between currencies
/// anywhere in the crate, so two codes either match or the operation fails.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Currency([u8; 3]);

impl Currency {
    pub fn new(code: &str) -> Result<Self, CurrencyParseError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(CurrencyParseError::BadCode(code.to_string()));
        }
        let mut out = [0u8; 3];
        for (slot, b) in out.iter_mut().zip(bytes) {
            *slot = b.to_ascii_uppercase();
        }
        Ok(Self(out))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            f.write_char(b as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({self})")
    }
}

impl FromStr for Currency {
    type Err = CurrencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Self::new(&code).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_uppercase() {
        let c = Currency::new("usd").unwrap();
        assert_eq!(c.to_string(), "USD");
        assert_eq!(c, Currency::new("USD").unwrap());
        assert_eq!(c, "Usd".parse().unwrap());
    }

    #[test]
    fn reject_bad_codes() {
        for bad in ["", "US", "USDT", "U$D", "12D"] {
            let err = Currency::new(bad).unwrap_err();
            assert!(matches!(err, CurrencyParseError::BadCode(_)));
        }
    }

    #[test]
    fn distinct_codes_do_not_match() {
        assert_ne!(Currency::new("USD").unwrap(), Currency::new("EUR").unwrap());
    }
}
