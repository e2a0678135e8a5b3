//! Strongly-typed identifiers used across the domain.
//!
//! Both identifiers are database-assigned integers. They travel on the wire
//! either as JSON numbers (record snapshots, status updates) or as decimal
//! strings (generation requests), so both forms parse.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a Job Record. Immutable once assigned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

/// Identifier of a stored prompt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptId(i64);

macro_rules! impl_int_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| DomainError::invalid_id(format!("{} {:?}: {}", $name, s, e)))?;
                if value <= 0 {
                    return Err(DomainError::invalid_id(format!(
                        "{} must be positive, got {}",
                        $name, value
                    )));
                }
                Ok(Self(value))
            }
        }
    };
}

impl_int_newtype!(JobId, "JobId");
impl_int_newtype!(PromptId, "PromptId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_strings() {
        assert_eq!("7".parse::<JobId>().unwrap(), JobId::new(7));
        assert_eq!(" 42 ".parse::<PromptId>().unwrap(), PromptId::new(42));
    }

    #[test]
    fn rejects_garbage_and_non_positive() {
        assert!(matches!("abc".parse::<JobId>(), Err(DomainError::InvalidId(_))));
        assert!(matches!("".parse::<JobId>(), Err(DomainError::InvalidId(_))));
        assert!(matches!("0".parse::<JobId>(), Err(DomainError::InvalidId(_))));
        assert!(matches!("-3".parse::<PromptId>(), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn serializes_as_plain_number() {
        let json = serde_json::to_string(&JobId::new(12)).unwrap();
        assert_eq!(json, "12");
        let back: JobId = serde_json::from_str("12").unwrap();
        assert_eq!(back.get(), 12);
    }
}
