//! Record positions within a shard.

use std::{fmt::Display, str::FromStr};

use num::{BigUint, Num};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid sequence number {0:?}: expected a non-empty decimal string")]
pub struct InvalidSequenceNumber(pub String);

/// Position of a record within its shard.
///
/// The stream hands these out as decimal strings that routinely exceed 64 bits, so ordering is
/// done on an arbitrary-precision integer rather than on the string or a native integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(BigUint);

impl FromStr for SequenceNumber {
    type Err = InvalidSequenceNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidSequenceNumber(s.to_string()));
        }
        BigUint::from_str_radix(s, 10)
            .map(Self)
            .map_err(|_| InvalidSequenceNumber(s.to_string()))
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
