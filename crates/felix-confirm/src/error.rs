// Error taxonomy for confirm tracking.
use crate::sequence::SequenceNumber;

pub type Result<T> = std::result::Result<T, ConfirmError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    /// The same number was registered twice. Tracking state for the channel is corrupt.
    #[error("sequence number {0} is already outstanding")]
    DuplicateSequence(SequenceNumber),
    /// A single confirm referenced a number that is not outstanding.
    #[error("sequence number {0} is not outstanding")]
    UnknownSequence(SequenceNumber),
    /// The channel was reset while the caller was waiting for confirms.
    #[error("channel reset while waiting for confirms (generation {generation})")]
    ChannelReset { generation: u64 },
    #[error("confirm mode is not enabled on this channel")]
    NotEnabled,
    #[error("sequence space exhausted; the channel must be re-created")]
    SequenceExhausted,
    #[error("timed out with {} confirms outstanding", .outstanding.len())]
    Timeout { outstanding: Vec<SequenceNumber> },
    #[error("{count} publishes were nacked by the broker")]
    Nacked { count: u64 },
}

impl ConfirmError {
    /// True for errors that mean the client and broker disagree about which
    /// publishes are in flight. Channel recovery is the only fix.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ConfirmError::DuplicateSequence(_)
                | ConfirmError::UnknownSequence(_)
                | ConfirmError::SequenceExhausted
        )
    }
}
