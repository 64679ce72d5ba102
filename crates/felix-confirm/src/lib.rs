// Publisher-confirm tracking for broker channels.
//
// One `ConfirmTracker` per channel. The publish path allocates a sequence
// number per message before handing it to the transport; the transport's
// receive path reports each broker confirm back. Once `wait_for_all_confirmed`
// returns true, every publish issued before the call has been accepted or
// rejected by the broker, so reads of broker-side state issued afterwards see
// those publishes.
//
// The tracker never talks to the network itself. Connection handling, framing
// and recovery belong to the transport that owns the channel.
mod config;
mod counters;
mod error;
mod listener;
mod outstanding;
mod sequence;
mod tracker;

pub use config::ConfirmConfig;
pub use counters::ConfirmCountersSnapshot;
pub use error::{ConfirmError, Result};
pub use listener::{CallbackListener, ConfirmCallback, ConfirmEvent, ConfirmListener, ListenerId};
pub use outstanding::OutstandingSet;
pub use sequence::{SequenceAllocator, SequenceNumber};
pub use tracker::ConfirmTracker;
