// Ack/nack listener registration and dispatch.
//
// Dispatch runs on the thread that delivers the confirm (the transport receive
// path). Listeners are invoked inline, one after another, so a slow listener
// stalls every later confirm on the channel.
use arc_swap::ArcSwap;
use felix_common::ConfirmOutcome;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::sequence::SequenceNumber;

/// A single confirm frame as delivered by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmEvent {
    pub sequence: SequenceNumber,
    /// Resolves every outstanding number `<= sequence`, not just `sequence`.
    pub multiple: bool,
    /// `false` for a broker-side rejection (nack).
    pub accepted: bool,
}

impl ConfirmEvent {
    pub fn new(sequence: SequenceNumber, multiple: bool, accepted: bool) -> Self {
        Self {
            sequence,
            multiple,
            accepted,
        }
    }

    pub fn ack(sequence: SequenceNumber, multiple: bool) -> Self {
        Self::new(sequence, multiple, true)
    }

    pub fn nack(sequence: SequenceNumber, multiple: bool) -> Self {
        Self::new(sequence, multiple, false)
    }

    pub fn outcome(&self) -> ConfirmOutcome {
        ConfirmOutcome::from_accepted(self.accepted)
    }
}

/// Callback interface for confirm completion.
///
/// Both methods receive the tag and the `multiple` flag exactly as the broker
/// sent them. Mapping tags back to application messages is up to the listener.
pub trait ConfirmListener: Send + Sync {
    fn handle_ack(&self, sequence: SequenceNumber, multiple: bool);
    fn handle_nack(&self, sequence: SequenceNumber, multiple: bool);
}

pub type ConfirmCallback = Box<dyn Fn(SequenceNumber, bool) + Send + Sync>;

/// Listener built from a pair of closures.
///
/// ```
/// use felix_confirm::{CallbackListener, ConfirmListener, SequenceNumber};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let acked = Arc::new(AtomicU64::new(0));
/// let seen = Arc::clone(&acked);
/// let listener = CallbackListener::new(
///     move |seq: SequenceNumber, _multiple| seen.store(seq.get(), Ordering::SeqCst),
///     |_, _| {},
/// );
/// listener.handle_ack(SequenceNumber::new(9), false);
/// assert_eq!(acked.load(Ordering::SeqCst), 9);
/// ```
pub struct CallbackListener {
    ack: ConfirmCallback,
    nack: ConfirmCallback,
}

impl CallbackListener {
    pub fn new<A, N>(ack: A, nack: N) -> Self
    where
        A: Fn(SequenceNumber, bool) + Send + Sync + 'static,
        N: Fn(SequenceNumber, bool) + Send + Sync + 'static,
    {
        Self {
            ack: Box::new(ack),
            nack: Box::new(nack),
        }
    }
}

impl fmt::Debug for CallbackListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackListener").finish_non_exhaustive()
    }
}

impl ConfirmListener for CallbackListener {
    fn handle_ack(&self, sequence: SequenceNumber, multiple: bool) {
        (self.ack)(sequence, multiple)
    }

    fn handle_nack(&self, sequence: SequenceNumber, multiple: bool) {
        (self.nack)(sequence, multiple)
    }
}

/// Handle returned by listener registration, used to remove the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn ConfirmListener>,
}

#[derive(Default)]
struct ListenerTable {
    // Ids are never reused, so a stale handle cannot remove a newer listener.
    next_id: u64,
    entries: Vec<ListenerEntry>,
}

/// Per-channel listener registry.
pub(crate) struct ListenerRegistry {
    // Snapshot read by the dispatch path without taking the table lock.
    snapshot: ArcSwap<Vec<ListenerEntry>>,
    // Mutated only on register/unregister paths.
    table: Mutex<ListenerTable>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            table: Mutex::new(ListenerTable::default()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn ConfirmListener>) -> ListenerId {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = ListenerId(table.next_id);
        table.entries.push(ListenerEntry { id, listener });
        self.rebuild_snapshot(&table);
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table.entries.retain(|entry| entry.id != id);
        let removed = table.entries.len() != before;
        if removed {
            self.rebuild_snapshot(&table);
        }
        removed
    }

    pub(crate) fn clear(&self) -> usize {
        let mut table = self.table.lock();
        let cleared = table.entries.len();
        table.entries.clear();
        self.rebuild_snapshot(&table);
        cleared
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Invokes every registered listener, in registration order.
    pub(crate) fn dispatch(&self, event: &ConfirmEvent) -> usize {
        let listeners = self.snapshot.load_full();
        for entry in listeners.iter() {
            if event.accepted {
                entry.listener.handle_ack(event.sequence, event.multiple);
            } else {
                entry.listener.handle_nack(event.sequence, event.multiple);
            }
        }
        listeners.len()
    }

    fn rebuild_snapshot(&self, table: &ListenerTable) {
        self.snapshot.store(Arc::new(table.entries.clone()));
    }
}
