//! Post identifiers and their ordering
//!
//! The read API reports post IDs either as JSON integers or as numeric strings,
//! and historical IDs are not guaranteed to fit a native integer. IDs are kept
//! as normalized decimal strings and compared by length first, then
//! lexicographically, which matches numeric order for non-negative integers.

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a string is not a non-negative decimal integer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid post id: {0:?}")]
pub struct InvalidPostId(pub String);

/// A non-negative post identifier of arbitrary width
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PostId(String);

impl PostId {
    /// The smallest possible ID, used when a source has no watermark yet
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    /// Parses a decimal string, ignoring surrounding whitespace and leading zeros
    pub fn parse(s: &str) -> Result<Self, InvalidPostId> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidPostId(s.to_string()));
        }

        let digits = trimmed.trim_start_matches('0');
        if digits.is_empty() {
            Ok(Self::zero())
        } else {
            Ok(Self(digits.to_string()))
        }
    }

    /// Returns the normalized decimal representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == "0"
    }
}

impl Default for PostId {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ord for PostId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PostId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for PostId {
    type Err = InvalidPostId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<u64> for PostId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PostId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PostIdVisitor;

        impl<'de> Visitor<'de> for PostIdVisitor {
            type Value = PostId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PostId, E> {
                Ok(PostId::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PostId, E> {
                u64::try_from(v)
                    .map(PostId::from)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<PostId, E> {
                Ok(PostId(v.to_string()))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PostId, E> {
                PostId::parse(v).map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(PostIdVisitor)
    }
}
