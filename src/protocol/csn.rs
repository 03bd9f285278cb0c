//! Combined sequence numbers
//!
//! A combined sequence number (CSN) is a 48-bit counter made of a 16-bit
//! overflow number and a 32-bit sequence number. Every (peer, direction)
//! pair carries its own CSN; outgoing values are emitted strictly
//! increasing, incoming values are validated to advance strictly.

use rand::Rng;

use crate::error::InternalError;

/// A point-in-time value of a combined sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CombinedSequenceSnapshot {
    overflow: u16,
    sequence: u32,
}

impl CombinedSequenceSnapshot {
    pub fn new(overflow: u16, sequence: u32) -> Self {
        Self { overflow, sequence }
    }

    pub fn overflow_number(&self) -> u16 {
        self.overflow
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence
    }

    /// The full 48-bit value
    pub fn combined(&self) -> u64 {
        ((self.overflow as u64) << 32) | self.sequence as u64
    }
}

/// An owned, advancing combined sequence number
///
/// A fresh instance starts with a random sequence number and overflow 0.
#[derive(Debug, Clone)]
pub struct CombinedSequence {
    overflow: u16,
    sequence: u32,
}

impl CombinedSequence {
    /// Create a new CSN with a random sequence number
    pub fn new() -> Self {
        Self {
            overflow: 0,
            sequence: rand::thread_rng().gen(),
        }
    }

    /// Create a CSN at an explicit position
    pub fn from_parts(overflow: u16, sequence: u32) -> Self {
        Self { overflow, sequence }
    }

    /// Return the current value and advance by one.
    ///
    /// The sequence number rolls into the overflow number; exhausting both
    /// is fatal for the connection.
    pub fn next(&mut self) -> Result<CombinedSequenceSnapshot, InternalError> {
        let snapshot = CombinedSequenceSnapshot::new(self.overflow, self.sequence);
        match self.sequence.checked_add(1) {
            Some(sequence) => self.sequence = sequence,
            None => {
                self.overflow = self
                    .overflow
                    .checked_add(1)
                    .ok_or(InternalError::SequenceExhausted)?;
                self.sequence = 0;
            }
        }
        Ok(snapshot)
    }
}

impl Default for CombinedSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// The pair of CSNs towards one peer
///
/// `ours` feeds outgoing nonces; `theirs` tracks the last validated
/// incoming value and is unset until the peer's first message.
#[derive(Debug, Clone)]
pub struct CsnPair {
    pub ours: CombinedSequence,
    pub theirs: Option<CombinedSequenceSnapshot>,
}

impl CsnPair {
    pub fn new() -> Self {
        Self {
            ours: CombinedSequence::new(),
            theirs: None,
        }
    }
}

impl Default for CsnPair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_increments() {
        let mut csn = CombinedSequence::from_parts(0, 100);

        let first = csn.next().unwrap();
        let second = csn.next().unwrap();
        let third = csn.next().unwrap();

        assert_eq!(first, CombinedSequenceSnapshot::new(0, 100));
        assert_eq!(second, CombinedSequenceSnapshot::new(0, 101));
        assert_eq!(third, CombinedSequenceSnapshot::new(0, 102));
        assert!(first < second && second < third);
    }

    #[test]
    fn test_sequence_rolls_into_overflow() {
        let mut csn = CombinedSequence::from_parts(7, u32::MAX);

        let before = csn.next().unwrap();
        let after = csn.next().unwrap();

        assert_eq!(before, CombinedSequenceSnapshot::new(7, u32::MAX));
        assert_eq!(after, CombinedSequenceSnapshot::new(8, 0));
        assert!(before < after);
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let mut csn = CombinedSequence::from_parts(u16::MAX, u32::MAX);
        assert!(matches!(csn.next(), Err(InternalError::SequenceExhausted)));
    }

    #[test]
    fn test_fresh_csn_has_zero_overflow() {
        for _ in 0..16 {
            let mut csn = CombinedSequence::new();
            assert_eq!(csn.next().unwrap().overflow_number(), 0);
        }
    }

    #[test]
    fn test_snapshot_ordering() {
        let low = CombinedSequenceSnapshot::new(0, u32::MAX);
        let high = CombinedSequenceSnapshot::new(1, 0);
        assert!(low < high);
        assert!(low.combined() < high.combined());
    }

    #[test]
    fn test_combined_value() {
        let snapshot = CombinedSequenceSnapshot::new(0x0102, 0x03040506);
        assert_eq!(snapshot.combined(), 0x0102_0304_0506);
    }
}
