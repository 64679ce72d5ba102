// Set of sequence numbers awaiting a broker confirm.
use std::collections::BTreeSet;

use crate::error::{ConfirmError, Result};
use crate::sequence::SequenceNumber;

/// Outstanding publishes for one channel.
///
/// Ordered so that cumulative (`multiple`) confirms can split off every member
/// at or below a tag in one step.
#[derive(Debug, Default, Clone)]
pub struct OutstandingSet {
    members: BTreeSet<SequenceNumber>,
}

impl OutstandingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, seq: SequenceNumber) -> Result<()> {
        if !self.members.insert(seq) {
            return Err(ConfirmError::DuplicateSequence(seq));
        }
        Ok(())
    }

    /// Removes `seq` (or, with `multiple`, everything `<= seq`) and returns how
    /// many members were removed.
    ///
    /// A cumulative resolve never fails: it removes whatever subset exists,
    /// possibly nothing. A single resolve of a non-member is
    /// [`ConfirmError::UnknownSequence`].
    ///
    /// ```
    /// use felix_confirm::{OutstandingSet, SequenceNumber};
    ///
    /// let mut set = OutstandingSet::new();
    /// for n in 1..=5 {
    ///     set.add(SequenceNumber::new(n)).expect("add");
    /// }
    /// assert_eq!(set.resolve(SequenceNumber::new(3), true).expect("resolve"), 3);
    /// assert_eq!(set.snapshot(), vec![SequenceNumber::new(4), SequenceNumber::new(5)]);
    /// ```
    pub fn resolve(&mut self, seq: SequenceNumber, multiple: bool) -> Result<usize> {
        if !multiple {
            if !self.members.remove(&seq) {
                return Err(ConfirmError::UnknownSequence(seq));
            }
            return Ok(1);
        }

        let before = self.members.len();
        match seq.get().checked_add(1) {
            Some(bound) => {
                let above = self.members.split_off(&SequenceNumber::new(bound));
                self.members = above;
            }
            None => self.members.clear(),
        }
        Ok(before - self.members.len())
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        self.members.contains(&seq)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn lowest(&self) -> Option<SequenceNumber> {
        self.members.first().copied()
    }

    /// Point-in-time copy in ascending order, for diagnostics and timeout reports.
    pub fn snapshot(&self) -> Vec<SequenceNumber> {
        self.members.iter().copied().collect()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.members.len();
        self.members.clear();
        dropped
    }
}
