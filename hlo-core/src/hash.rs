//! Positions on the 128-bit hash circle.
//!
//! Every node and every cache key is projected onto the same circle by
//! hashing its identity bytes with XXH3-128. Ownership is decided purely
//! by which node range the resulting position falls into.

use std::fmt;

use xxhash_rust::xxh3::xxh3_128;

use crate::error::{HaloError, Result};

/// A point on the hash circle.
///
/// Positions are unsigned and ordered; arithmetic that walks the circle
/// must use [`Position::wrapping_next`] / [`Position::wrapping_prev`] so
/// the top of the space wraps back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position(u128);

impl Position {
    /// Encoded size in bytes (big-endian u128).
    pub const SIZE: usize = 16;

    pub const MIN: Position = Position(0);
    pub const MAX: Position = Position(u128::MAX);

    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Hash arbitrary identity bytes onto the circle.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(xxh3_128(data))
    }

    #[must_use]
    pub const fn value(self) -> u128 {
        self.0
    }

    /// Next position clockwise, wrapping past the top of the circle.
    #[must_use]
    pub const fn wrapping_next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Previous position counter-clockwise, wrapping below zero.
    #[must_use]
    pub const fn wrapping_prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_be_bytes()
    }

    /// Decode a position from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `HaloError::Protocol` if the buffer is too short.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(HaloError::Protocol(format!(
                "position needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        let mut raw = [0u8; Self::SIZE];
        raw.copy_from_slice(&buf[..Self::SIZE]);
        Ok(Self(u128::from_be_bytes(raw)))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for Position {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = Position::of(b"10.0.0.1:6100");
        let b = Position::of(b"10.0.0.1:6100");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_inputs_distinct_positions() {
        let a = Position::of(b"10.0.0.1:6100");
        let b = Position::of(b"10.0.0.2:6100");
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrapping_at_edges() {
        assert_eq!(Position::MAX.wrapping_next(), Position::MIN);
        assert_eq!(Position::MIN.wrapping_prev(), Position::MAX);
        assert_eq!(Position::new(41).wrapping_next(), Position::new(42));
        assert_eq!(Position::new(42).wrapping_prev(), Position::new(41));
    }

    #[test]
    fn test_round_trip_bytes() {
        let p = Position::of(b"some-key");
        let decoded = Position::parse(&p.to_be_bytes()).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn test_parse_short_buffer() {
        let err = Position::parse(&[0u8; 7]);
        assert!(err.is_err());
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        let shown = Position::new(0xff).to_string();
        assert_eq!(shown.len(), 32);
        assert!(shown.ends_with("ff"));
    }
}
