// Per-channel delivery tag allocation.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConfirmError, Result};

/// Delivery tag assigned to a publish on one channel.
///
/// Tags start at 1 and are never reused within a channel generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(value: SequenceNumber) -> Self {
        value.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing sequence numbers for one channel.
///
/// The allocator is not synchronized on its own; the tracker owns it behind the
/// same lock that registers the number as outstanding, so allocation order and
/// registration order are identical.
///
/// Running out of sequence space is fatal: once `u64::MAX` has been issued every
/// later call fails with [`ConfirmError::SequenceExhausted`] until the channel is
/// re-created (or [`SequenceAllocator::reset`] is called after recovery).
///
/// ```
/// use felix_confirm::{SequenceAllocator, SequenceNumber};
///
/// let mut allocator = SequenceAllocator::new();
/// assert_eq!(allocator.next().expect("seq"), SequenceNumber::new(1));
/// assert_eq!(allocator.next().expect("seq"), SequenceNumber::new(2));
/// assert_eq!(allocator.peek(), Some(SequenceNumber::new(3)));
/// ```
#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    // `None` once the sequence space is exhausted.
    next: Option<u64>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(SequenceNumber::FIRST.get())
    }

    pub(crate) fn starting_at(first: u64) -> Self {
        Self { next: Some(first) }
    }

    pub fn next(&mut self) -> Result<SequenceNumber> {
        let current = self.next.ok_or(ConfirmError::SequenceExhausted)?;
        self.next = current.checked_add(1);
        Ok(SequenceNumber(current))
    }

    /// Number the next call to [`SequenceAllocator::next`] would return.
    pub fn peek(&self) -> Option<SequenceNumber> {
        self.next.map(SequenceNumber)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    pub fn reset(&mut self) {
        self.next = Some(SequenceNumber::FIRST.get());
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
