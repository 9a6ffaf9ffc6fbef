//! Closed key ranges on the hash circle.
//!
//! A range `[min, max]` owns every position from `min` to `max` inclusive,
//! walking clockwise. Ranges may wrap past the top of the circle, so
//! `min > max` is a valid (wrapped) interval. A single node owns the whole
//! circle as `[h+1, h]` where `h` is its own position.

use std::fmt;

use crate::error::{HaloError, Result};
use crate::hash::Position;

/// A closed, possibly wrapping interval of ring positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub min: Position,
    pub max: Position,
}

impl KeyRange {
    /// Encoded size in bytes: two big-endian positions.
    pub const SIZE: usize = 2 * Position::SIZE;

    #[must_use]
    pub const fn new(min: Position, max: Position) -> Self {
        Self { min, max }
    }

    /// The whole circle, anchored so that `at` is the inclusive upper bound.
    #[must_use]
    pub const fn full_circle_at(at: Position) -> Self {
        Self {
            min: at.wrapping_next(),
            max: at,
        }
    }

    /// True when this range covers every position on the circle.
    #[must_use]
    pub const fn is_full_circle(self) -> bool {
        self.max.wrapping_next().value() == self.min.value()
    }

    /// Wrap-aware membership test.
    #[must_use]
    pub fn contains(self, position: Position) -> bool {
        if self.min <= self.max {
            self.min <= position && position <= self.max
        } else {
            position >= self.min || position <= self.max
        }
    }

    /// Split this range at `at`, which the caller guarantees lies inside
    /// it strictly below the upper bound.
    ///
    /// The lower sub-range `[min, at]` is carved off and returned; `self`
    /// keeps the remainder `[at+1, max]`.
    pub fn split(&mut self, at: Position) -> KeyRange {
        let carved = KeyRange::new(self.min, at);
        self.min = at.wrapping_next();
        carved
    }

    /// Extend the lower bound downward to absorb a departed neighbor.
    pub fn extend_down(&mut self, new_min: Position) {
        self.min = new_min;
    }

    #[must_use]
    pub fn to_be_bytes(self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        self.encode_into(&mut raw);
        raw
    }

    /// Encode into the front of `buf`, which must hold at least `SIZE` bytes.
    pub fn encode_into(self, buf: &mut [u8]) {
        buf[0..Position::SIZE].copy_from_slice(&self.min.to_be_bytes());
        buf[Position::SIZE..Self::SIZE].copy_from_slice(&self.max.to_be_bytes());
    }

    /// Decode a range from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `HaloError::Protocol` if the buffer is too short.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(HaloError::Protocol(format!(
                "key range needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        let min = Position::parse(&buf[0..Position::SIZE])?;
        let max = Position::parse(&buf[Position::SIZE..Self::SIZE])?;
        Ok(Self { min, max })
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.min, self.max)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn range(min: u128, max: u128) -> KeyRange {
        KeyRange::new(Position::new(min), Position::new(max))
    }

    #[test]
    fn test_contains_plain_interval() {
        let r = range(10, 20);
        assert!(r.contains(Position::new(10)));
        assert!(r.contains(Position::new(15)));
        assert!(r.contains(Position::new(20)));
        assert!(!r.contains(Position::new(9)));
        assert!(!r.contains(Position::new(21)));
    }

    #[test]
    fn test_contains_wrapped_interval() {
        let r = range(u128::MAX - 5, 5);
        assert!(r.contains(Position::new(u128::MAX - 5)));
        assert!(r.contains(Position::MAX));
        assert!(r.contains(Position::new(0)));
        assert!(r.contains(Position::new(5)));
        assert!(!r.contains(Position::new(6)));
        assert!(!r.contains(Position::new(u128::MAX - 6)));
    }

    #[test]
    fn test_full_circle_contains_everything() {
        let r = KeyRange::full_circle_at(Position::new(42));
        assert!(r.is_full_circle());
        assert!(r.contains(Position::new(0)));
        assert!(r.contains(Position::new(42)));
        assert!(r.contains(Position::new(43)));
        assert!(r.contains(Position::MAX));

        // Anchored at the very top the circle is the plain interval [0, MAX].
        let top = KeyRange::full_circle_at(Position::MAX);
        assert!(top.is_full_circle());
        assert_eq!(top.min, Position::MIN);
        assert!(top.contains(Position::new(7)));
    }

    #[test]
    fn test_split_keeps_partition() {
        let mut upper = range(10, 30);
        let lower = upper.split(Position::new(20));

        assert_eq!(lower, range(10, 20));
        assert_eq!(upper, range(21, 30));
        for p in 10..=30u128 {
            let p = Position::new(p);
            assert_ne!(lower.contains(p), upper.contains(p));
            assert!(lower.contains(p) || upper.contains(p));
        }
    }

    #[test]
    fn test_split_wrapped_interval() {
        // Split point sits in the arc below the wrap.
        let mut upper = range(u128::MAX - 2, 10);
        let lower = upper.split(Position::new(3));
        assert_eq!(lower, range(u128::MAX - 2, 3));
        assert_eq!(upper, range(4, 10));
        assert!(lower.contains(Position::MAX));
        assert!(!upper.contains(Position::MAX));
    }

    #[test]
    fn test_split_at_top_of_circle() {
        let mut upper = range(u128::MAX - 4, 9);
        let lower = upper.split(Position::MAX);
        assert_eq!(lower, range(u128::MAX - 4, u128::MAX));
        // Remainder min wraps to zero.
        assert_eq!(upper, range(0, 9));
    }

    #[test]
    fn test_extend_down_reverses_split() {
        let original = range(10, 30);
        let mut upper = original;
        let lower = upper.split(Position::new(20));
        upper.extend_down(lower.min);
        assert_eq!(upper, original);
    }

    #[test]
    fn test_round_trip_bytes() {
        let r = range(u128::MAX - 17, 99);
        let decoded = KeyRange::parse(&r.to_be_bytes()).unwrap();
        assert_eq!(r, decoded);
    }

    #[test]
    fn test_parse_short_buffer() {
        assert!(KeyRange::parse(&[0u8; 31]).is_err());
    }
}
