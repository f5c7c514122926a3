//! Nonce values and nonce-range arithmetic.
//!
//! A nonce is an 8-byte big-endian integer. Every encryption under a drive key
//! consumes exactly one nonce, so the only operations allowed on a nonce are
//! the ones a sequencer needs: step forward within a bound, and split a range
//! into two disjoint halves.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{Result, VaultError};

/// Width of a nonce in bytes
pub const NONCE_LENGTH: usize = 8;

/// Smallest range `[start, max]` that can be split between two devices
pub const MIN_SPLIT_RANGE: u64 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    /// First nonce handed out by a freshly created drive
    pub const START: Nonce = Nonce([0; NONCE_LENGTH]);

    /// Upper bound of a fresh drive's range (`i64::MAX`, kept positive for
    /// interoperability with signed readers)
    pub const MAX: Nonce = Nonce(i64::MAX.to_be_bytes());

    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn from_bytes(bytes: [u8; NONCE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_LENGTH] = bytes.try_into().map_err(|_| {
            VaultError::format(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LENGTH] {
        &self.0
    }

    /// Returns the nonce after `self`, failing if it would pass `max`.
    pub fn increase(self, max: Nonce) -> Result<Nonce> {
        let next = self
            .to_u64()
            .checked_add(1)
            .ok_or_else(|| VaultError::range_exceeded("nonce space overflow"))?;
        if next > max.to_u64() {
            return Err(VaultError::range_exceeded(
                "current nonce range is exhausted, re-authorize this device",
            ));
        }
        Ok(Nonce::from_u64(next))
    }

    /// Picks the pivot that splits `[start, max]` into `[start, pivot)` and
    /// `[pivot, max]`. Both halves are non-empty.
    pub fn split_range(start: Nonce, max: Nonce) -> Result<Nonce> {
        let (start, max) = (start.to_u64(), max.to_u64());
        if max < start || max - start < MIN_SPLIT_RANGE {
            return Err(VaultError::range_exceeded(format!(
                "not enough nonces left to split the range {start}..={max}"
            )));
        }
        Ok(Nonce::from_u64(start + (max - start) / 2))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_u64())
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u64())
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(text).map_err(serde::de::Error::custom)?;
        Nonce::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
