// Publisher-confirm tracker for one channel.
//
// Locking:
// - `state` guards the allocator, the outstanding set and the drain signal.
//   Every mutation that can change "drained" republishes the signal while the
//   lock is still held, so a waiter can never observe a stale empty set.
// - `dispatch_gate` serializes confirm handling end to end (resolve + listener
//   calls), so listeners see confirms in exactly the order the receive path
//   delivered them. `state` is NOT held while listeners run; publishes keep
//   flowing during a slow listener.
// - A confirm stays "in flight" until its listeners return. Waiters are only
//   released once the set is empty and no dispatch is running.
use felix_common::ids::ChannelId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConfirmConfig;
use crate::counters::{ConfirmCounters, ConfirmCountersSnapshot};
use crate::error::{ConfirmError, Result};
use crate::listener::{
    CallbackListener, ConfirmEvent, ConfirmListener, ListenerId, ListenerRegistry,
};
use crate::outstanding::OutstandingSet;
use crate::sequence::{SequenceAllocator, SequenceNumber};

#[derive(Debug)]
struct TrackerState {
    enabled: bool,
    allocator: SequenceAllocator,
    outstanding: OutstandingSet,
    // Bumped by every reset; waiters compare against the value they started with.
    generation: u64,
    dispatching: bool,
    highest_confirmed: Option<SequenceNumber>,
    nacks_since_wait: u64,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            enabled: false,
            allocator: SequenceAllocator::new(),
            outstanding: OutstandingSet::new(),
            generation: 0,
            dispatching: false,
            highest_confirmed: None,
            nacks_since_wait: 0,
        }
    }

    fn is_drained(&self) -> bool {
        self.outstanding.is_empty() && !self.dispatching
    }

    fn drain_signal(&self) -> DrainSignal {
        DrainSignal {
            generation: self.generation,
            drained: self.is_drained(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DrainSignal {
    generation: u64,
    drained: bool,
}

/// Correlates publishes on one channel with the broker's asynchronous confirms.
///
/// The publish path calls [`ConfirmTracker::publish`] *before* handing a message
/// to the transport and uses the returned number as correlation. The receive path
/// feeds every confirm frame into [`ConfirmTracker::on_confirm`]. Batch publishers
/// then call [`ConfirmTracker::wait_for_all_confirmed`] and only trust downstream
/// state (for example queue depth) once it returns `true`.
///
/// ```
/// use felix_common::ids::ChannelId;
/// use felix_confirm::ConfirmTracker;
/// use std::time::Duration;
///
/// let tracker = ConfirmTracker::new(ChannelId::new());
/// tracker.enable();
/// let first = tracker.publish().expect("publish");
/// let second = tracker.publish().expect("publish");
/// assert!(second > first);
///
/// tracker.on_confirm(second.get(), true, true).expect("confirm");
/// assert!(tracker.wait_for_all_confirmed(Duration::from_millis(10)).expect("wait"));
/// ```
pub struct ConfirmTracker {
    channel_id: ChannelId,
    config: ConfirmConfig,
    state: Mutex<TrackerState>,
    // Blocking waiters park here; async waiters watch `drain_tx`.
    drained: Condvar,
    drain_tx: watch::Sender<DrainSignal>,
    dispatch_gate: Mutex<()>,
    listeners: ListenerRegistry,
    counters: ConfirmCounters,
}

// Clears the in-flight dispatch marker even if a listener panics.
struct DispatchGuard<'a> {
    tracker: &'a ConfirmTracker,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.tracker.state.lock();
        state.dispatching = false;
        self.tracker.signal_drain(&state);
    }
}

impl ConfirmTracker {
    pub fn new(channel_id: ChannelId) -> Self {
        Self::with_config(channel_id, ConfirmConfig::default())
    }

    pub fn with_config(channel_id: ChannelId, config: ConfirmConfig) -> Self {
        let state = TrackerState::new();
        let (drain_tx, _) = watch::channel(state.drain_signal());
        Self {
            channel_id,
            config,
            state: Mutex::new(state),
            drained: Condvar::new(),
            drain_tx,
            dispatch_gate: Mutex::new(()),
            listeners: ListenerRegistry::new(),
            counters: ConfirmCounters::default(),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn config(&self) -> &ConfirmConfig {
        &self.config
    }

    /// Turns confirm tracking on. Calling it again is a no-op and keeps any
    /// outstanding state.
    pub fn enable(&self) {
        let mut state = self.state.lock();
        if state.enabled {
            debug!(channel_id = %self.channel_id, "confirm mode already enabled");
            return;
        }
        state.enabled = true;
        info!(channel_id = %self.channel_id, "confirm mode enabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Allocates the next sequence number and registers it as outstanding.
    ///
    /// Must be called before the matching transport send, otherwise the confirm
    /// can arrive before the number is registered.
    pub fn publish(&self) -> Result<SequenceNumber> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(ConfirmError::NotEnabled);
        }
        let seq = state.allocator.next().inspect_err(|_| {
            warn!(channel_id = %self.channel_id, "sequence space exhausted");
        })?;
        if let Err(err) = state.outstanding.add(seq) {
            warn!(
                channel_id = %self.channel_id,
                %seq,
                "allocator issued an outstanding sequence"
            );
            return Err(err);
        }
        self.signal_drain(&state);
        self.counters.record_published();
        Ok(seq)
    }

    /// Number the next [`ConfirmTracker::publish`] will return, or 0 when
    /// confirm mode is off or the sequence space is exhausted.
    pub fn next_publish_seq_no(&self) -> u64 {
        let state = self.state.lock();
        if !state.enabled {
            return 0;
        }
        state.allocator.peek().map(SequenceNumber::get).unwrap_or(0)
    }

    /// Transport-facing entry point for one confirm frame.
    ///
    /// Resolves the outstanding set, then invokes listeners inline on the calling
    /// thread before returning. Returns how many outstanding numbers the frame
    /// resolved. Listeners must not call back into `on_confirm` or wait for
    /// confirms on the same tracker.
    pub fn on_confirm(&self, delivery_tag: u64, multiple: bool, accepted: bool) -> Result<usize> {
        self.handle_event(ConfirmEvent::new(
            SequenceNumber::new(delivery_tag),
            multiple,
            accepted,
        ))
    }

    pub fn handle_event(&self, event: ConfirmEvent) -> Result<usize> {
        let _gate = self.dispatch_gate.lock();
        let resolved = {
            let mut state = self.state.lock();
            if !state.enabled {
                return Err(ConfirmError::NotEnabled);
            }
            let resolved = match state.outstanding.resolve(event.sequence, event.multiple) {
                Ok(resolved) => resolved,
                Err(err) => {
                    self.counters.record_unknown();
                    warn!(
                        channel_id = %self.channel_id,
                        seq = %event.sequence,
                        outcome = event.outcome().as_str(),
                        "confirm for a sequence that is not outstanding"
                    );
                    return Err(err);
                }
            };
            if event.multiple
                && state
                    .allocator
                    .peek()
                    .is_some_and(|next| event.sequence >= next)
            {
                warn!(
                    channel_id = %self.channel_id,
                    seq = %event.sequence,
                    "cumulative confirm beyond the last issued sequence"
                );
            }
            match state.highest_confirmed {
                Some(highest) if event.sequence < highest => {
                    debug!(
                        channel_id = %self.channel_id,
                        seq = %event.sequence,
                        highest = %highest,
                        "confirm below the high-water mark"
                    );
                }
                _ => state.highest_confirmed = Some(event.sequence),
            }
            if !event.accepted {
                state.nacks_since_wait += resolved as u64;
            }
            state.dispatching = true;
            self.signal_drain(&state);
            self.counters.record_confirm(&event, resolved);
            debug!(
                channel_id = %self.channel_id,
                seq = %event.sequence,
                multiple = event.multiple,
                outcome = event.outcome().as_str(),
                resolved,
                outstanding = state.outstanding.len(),
                "confirm resolved"
            );
            resolved
        };

        let guard = DispatchGuard { tracker: self };
        let started = Instant::now();
        let listeners = self.listeners.dispatch(&event);
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_listener_threshold {
            warn!(
                channel_id = %self.channel_id,
                seq = %event.sequence,
                listeners,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow confirm listener stalled the receive path"
            );
        }
        drop(guard);
        Ok(resolved)
    }

    /// Blocks until every outstanding publish is confirmed or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout and leaves the outstanding set untouched.
    /// Fails with [`ConfirmError::ChannelReset`] if [`ConfirmTracker::reset`] runs
    /// while waiting.
    pub fn wait_for_all_confirmed(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(ConfirmError::NotEnabled);
        }
        let generation = state.generation;
        loop {
            if state.generation != generation {
                return Err(ConfirmError::ChannelReset {
                    generation: state.generation,
                });
            }
            if state.is_drained() {
                return Ok(true);
            }
            let timed_out = match deadline {
                Some(deadline) => self.drained.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.drained.wait(&mut state);
                    false
                }
            };
            if timed_out && state.generation == generation && !state.is_drained() {
                self.record_wait_timeout(state.outstanding.len());
                return Ok(false);
            }
        }
    }

    /// Async flavour of [`ConfirmTracker::wait_for_all_confirmed`] for callers
    /// running on a tokio runtime.
    pub async fn wait_for_all_confirmed_async(&self, timeout: Duration) -> Result<bool> {
        let mut drain_rx = self.drain_tx.subscribe();
        let generation = {
            let state = self.state.lock();
            if !state.enabled {
                return Err(ConfirmError::NotEnabled);
            }
            if state.is_drained() {
                return Ok(true);
            }
            state.generation
        };

        let waited = tokio::time::timeout(timeout, async {
            drain_rx
                .wait_for(|signal| signal.generation != generation || signal.drained)
                .await
                .map(|signal| *signal)
        })
        .await;

        match waited {
            Ok(Ok(signal)) if signal.generation != generation => Err(ConfirmError::ChannelReset {
                generation: signal.generation,
            }),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Err(ConfirmError::ChannelReset { generation }),
            Err(_) => {
                let state = self.state.lock();
                if state.generation != generation {
                    return Err(ConfirmError::ChannelReset {
                        generation: state.generation,
                    });
                }
                if state.is_drained() {
                    return Ok(true);
                }
                self.record_wait_timeout(state.outstanding.len());
                Ok(false)
            }
        }
    }

    /// Strict wait: fails with [`ConfirmError::Timeout`] (carrying the numbers
    /// still outstanding) or [`ConfirmError::Nacked`] if any publish was nacked
    /// since the previous strict wait. `None` uses the configured timeout.
    pub fn wait_for_confirms_or_fail(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.config.confirm_timeout);
        if !self.wait_for_all_confirmed(timeout)? {
            return Err(ConfirmError::Timeout {
                outstanding: self.outstanding(),
            });
        }
        let nacked = std::mem::take(&mut self.state.lock().nacks_since_wait);
        if nacked > 0 {
            return Err(ConfirmError::Nacked { count: nacked });
        }
        Ok(())
    }

    /// Drops all outstanding state after channel recovery and restarts the
    /// sequence at 1. Confirm mode stays enabled. Every waiter is released with
    /// [`ConfirmError::ChannelReset`].
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let dropped = state.outstanding.clear();
        state.allocator.reset();
        state.generation += 1;
        state.highest_confirmed = None;
        state.nacks_since_wait = 0;
        self.signal_drain(&state);
        self.drained.notify_all();
        self.counters.record_reset();
        info!(
            channel_id = %self.channel_id,
            generation = state.generation,
            dropped,
            "confirm tracker reset"
        );
    }

    pub fn outstanding(&self) -> Vec<SequenceNumber> {
        self.state.lock().outstanding.snapshot()
    }

    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn counters(&self) -> ConfirmCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn add_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn add_confirm_callbacks<A, N>(&self, ack: A, nack: N) -> ListenerId
    where
        A: Fn(SequenceNumber, bool) + Send + Sync + 'static,
        N: Fn(SequenceNumber, bool) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(CallbackListener::new(ack, nack)))
    }

    pub fn remove_confirm_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn clear_confirm_listeners(&self) -> usize {
        self.listeners.clear()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // Caller holds the state lock.
    fn signal_drain(&self, state: &TrackerState) {
        let signal = state.drain_signal();
        self.drain_tx.send_if_modified(|current| {
            if *current == signal {
                return false;
            }
            *current = signal;
            true
        });
        if signal.drained {
            self.drained.notify_all();
        }
    }

    fn record_wait_timeout(&self, outstanding: usize) {
        self.counters.record_wait_timeout();
        debug!(
            channel_id = %self.channel_id,
            outstanding,
            "timed out waiting for confirms"
        );
    }
}

impl std::fmt::Debug for ConfirmTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmTracker")
            .field("channel_id", &self.channel_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::new(n)
    }

    fn enabled_tracker() -> ConfirmTracker {
        let tracker = ConfirmTracker::new(ChannelId::new());
        tracker.enable();
        tracker
    }

    fn publish_n(tracker: &ConfirmTracker, n: usize) -> Vec<SequenceNumber> {
        (0..n).map(|_| tracker.publish().expect("publish")).collect()
    }

    #[test]
    fn publish_requires_confirm_mode() {
        let tracker = ConfirmTracker::new(ChannelId::new());
        assert_eq!(tracker.publish(), Err(ConfirmError::NotEnabled));
        assert_eq!(tracker.next_publish_seq_no(), 0);
        assert_eq!(
            tracker.on_confirm(1, false, true),
            Err(ConfirmError::NotEnabled)
        );
        assert_eq!(
            tracker.wait_for_all_confirmed(Duration::from_millis(1)),
            Err(ConfirmError::NotEnabled)
        );
    }

    #[test]
    fn enable_is_idempotent_and_keeps_outstanding() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 3);
        tracker.enable();
        assert!(tracker.is_enabled());
        assert_eq!(tracker.outstanding(), vec![seq(1), seq(2), seq(3)]);
        assert_eq!(tracker.next_publish_seq_no(), 4);
    }

    #[test]
    fn published_numbers_strictly_increase() {
        let tracker = enabled_tracker();
        let mut previous = 0;
        for _ in 0..500 {
            let next = tracker.next_publish_seq_no();
            let seq = tracker.publish().expect("publish");
            assert_eq!(seq.get(), next);
            assert!(seq.get() > previous);
            previous = seq.get();
        }
    }

    #[test]
    fn concurrent_publishers_get_distinct_contiguous_numbers() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 2000;
        let tracker = Arc::new(enabled_tracker());
        let publishers: Vec<_> = (0..THREADS)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || publish_n(&tracker, PER_THREAD))
            })
            .collect();
        let mut issued: Vec<u64> = publishers
            .into_iter()
            .flat_map(|handle| handle.join().expect("join"))
            .map(SequenceNumber::get)
            .collect();
        issued.sort_unstable();
        let total = (THREADS * PER_THREAD) as u64;
        assert_eq!(issued, (1..=total).collect::<Vec<_>>());
        assert_eq!(tracker.outstanding_count(), THREADS * PER_THREAD);
        assert_eq!(tracker.next_publish_seq_no(), total + 1);
    }

    #[test]
    fn waiter_released_only_after_concurrent_confirms_reach_listener() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 2000;
        const CHUNK: u64 = 10;
        let tracker = Arc::new(enabled_tracker());
        let highest_seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen = Arc::clone(&highest_seen);
        tracker.add_confirm_callbacks(
            move |seq, _| {
                thread::sleep(Duration::from_micros(50));
                seen.fetch_max(seq.get(), Ordering::SeqCst);
            },
            |seq, _| panic!("unexpected nack for {seq}"),
        );
        let publishers: Vec<_> = (0..THREADS)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || publish_n(&tracker, PER_THREAD))
            })
            .collect();
        for handle in publishers {
            handle.join().expect("join");
        }
        let total = (THREADS * PER_THREAD) as u64;

        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_for_all_confirmed(Duration::from_secs(10)))
        };
        let receive_path = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for upto in (CHUNK..=total).step_by(CHUNK as usize) {
                    tracker.on_confirm(upto, true, true).expect("confirm");
                }
            })
        };
        assert_eq!(waiter.join().expect("join"), Ok(true));
        assert_eq!(highest_seen.load(Ordering::SeqCst), total);
        receive_path.join().expect("join");
        assert_eq!(tracker.counters().acked, total);
    }

    #[test]
    fn confirm_below_high_water_mark_still_resolves_and_dispatches() {
        let tracker = enabled_tracker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let acks = Arc::clone(&seen);
        tracker.add_confirm_callbacks(move |seq, _| acks.lock().push(seq.get()), |_, _| {});
        publish_n(&tracker, 5);
        assert_eq!(tracker.on_confirm(4, false, true), Ok(1));
        assert_eq!(tracker.on_confirm(2, false, true), Ok(1));
        assert_eq!(*seen.lock(), vec![4, 2]);
        assert_eq!(tracker.outstanding(), vec![seq(1), seq(3), seq(5)]);
        assert_eq!(tracker.counters().unknown_confirms, 0);
    }

    #[test]
    fn individual_confirms_drain_in_order() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 5);
        for n in 1..=5u64 {
            assert_eq!(tracker.on_confirm(n, false, true).expect("confirm"), 1);
        }
        assert_eq!(tracker.outstanding_count(), 0);
        assert!(tracker
            .wait_for_all_confirmed(Duration::ZERO)
            .expect("wait"));
        assert_eq!(tracker.counters().unknown_confirms, 0);
    }

    #[test]
    fn cumulative_confirms_resolve_prefixes() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 5);
        assert_eq!(tracker.on_confirm(3, true, true).expect("confirm"), 3);
        assert_eq!(tracker.outstanding(), vec![seq(4), seq(5)]);
        assert_eq!(tracker.on_confirm(5, true, true).expect("confirm"), 2);
        assert!(tracker.outstanding().is_empty());
    }

    #[test]
    fn cumulative_confirm_after_out_of_order_single() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 5);
        tracker.on_confirm(4, false, true).expect("single");
        assert_eq!(tracker.on_confirm(3, true, true).expect("multiple"), 3);
        assert_eq!(tracker.outstanding(), vec![seq(5)]);
    }

    #[test]
    fn unknown_single_confirm_is_rejected() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 2);
        assert_eq!(
            tracker.on_confirm(7, false, true),
            Err(ConfirmError::UnknownSequence(seq(7)))
        );
        assert_eq!(tracker.outstanding(), vec![seq(1), seq(2)]);
        assert_eq!(tracker.counters().unknown_confirms, 1);
    }

    #[test]
    fn confirming_twice_is_rejected() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 2);
        tracker.on_confirm(1, false, true).expect("first");
        assert_eq!(
            tracker.on_confirm(1, false, false),
            Err(ConfirmError::UnknownSequence(seq(1)))
        );
        assert_eq!(tracker.outstanding(), vec![seq(2)]);
    }

    #[test]
    fn exhausted_sequence_space_is_fatal() {
        let tracker = enabled_tracker();
        tracker.state.lock().allocator = SequenceAllocator::starting_at(u64::MAX);
        assert_eq!(tracker.publish().expect("last"), seq(u64::MAX));
        assert_eq!(tracker.publish(), Err(ConfirmError::SequenceExhausted));
        assert_eq!(tracker.next_publish_seq_no(), 0);
        tracker.on_confirm(u64::MAX, true, true).expect("confirm");
        assert_eq!(tracker.publish(), Err(ConfirmError::SequenceExhausted));
    }

    #[test]
    fn listeners_see_confirms_in_arrival_order() {
        let tracker = enabled_tracker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let acks = Arc::clone(&seen);
        let nacks = Arc::clone(&seen);
        tracker.add_confirm_callbacks(
            move |seq, multiple| acks.lock().push((true, seq.get(), multiple)),
            move |seq, multiple| nacks.lock().push((false, seq.get(), multiple)),
        );
        publish_n(&tracker, 6);
        tracker.on_confirm(1, false, true).expect("1");
        tracker.on_confirm(3, true, false).expect("3");
        tracker.on_confirm(4, false, true).expect("4");
        tracker.on_confirm(6, true, true).expect("6");
        assert_eq!(
            *seen.lock(),
            vec![
                (true, 1, false),
                (false, 3, true),
                (true, 4, false),
                (true, 6, true)
            ]
        );
        let counters = tracker.counters();
        assert_eq!(counters.published, 6);
        assert_eq!(counters.acked, 4);
        assert_eq!(counters.nacked, 2);
        assert_eq!(counters.multiple_frames, 2);
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let tracker = enabled_tracker();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = tracker.add_confirm_callbacks(
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_, _| {},
        );
        publish_n(&tracker, 2);
        tracker.on_confirm(1, false, true).expect("1");
        assert!(tracker.remove_confirm_listener(id));
        tracker.on_confirm(2, false, true).expect("2");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn cumulative_confirm_with_nothing_outstanding_still_dispatches() {
        let tracker = enabled_tracker();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tracker.add_confirm_callbacks(
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_, _| {},
        );
        publish_n(&tracker, 2);
        tracker.on_confirm(2, true, true).expect("first");
        assert_eq!(tracker.on_confirm(2, true, true).expect("again"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_can_publish_during_dispatch() {
        let tracker = Arc::new(enabled_tracker());
        let inner = Arc::clone(&tracker);
        let republished = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&republished);
        tracker.add_confirm_callbacks(
            |_, _| {},
            move |_, _| {
                *slot.lock() = Some(inner.publish().expect("republish"));
            },
        );
        publish_n(&tracker, 1);
        tracker.on_confirm(1, false, false).expect("nack");
        assert_eq!(*republished.lock(), Some(seq(2)));
        assert_eq!(tracker.outstanding(), vec![seq(2)]);
        // Break the Arc cycle held by the listener.
        tracker.clear_confirm_listeners();
    }

    #[test]
    fn wait_returns_immediately_when_nothing_outstanding() {
        let tracker = enabled_tracker();
        assert!(tracker
            .wait_for_all_confirmed(Duration::ZERO)
            .expect("wait"));
    }

    #[test]
    fn wait_timeout_leaves_state_untouched() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 3);
        tracker.on_confirm(1, false, true).expect("1");
        let started = Instant::now();
        assert!(!tracker
            .wait_for_all_confirmed(Duration::from_millis(30))
            .expect("wait"));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(tracker.outstanding(), vec![seq(2), seq(3)]);
        assert_eq!(tracker.counters().wait_timeouts, 1);
        tracker.on_confirm(3, true, true).expect("rest");
        assert!(tracker
            .wait_for_all_confirmed(Duration::ZERO)
            .expect("wait"));
    }

    #[test]
    fn confirms_from_receive_thread_release_waiter() {
        let tracker = Arc::new(enabled_tracker());
        publish_n(&tracker, 5);
        let receive_path = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                tracker.on_confirm(2, true, true).expect("2");
                tracker.on_confirm(3, false, true).expect("3");
                tracker.on_confirm(5, true, true).expect("5");
            })
        };
        assert!(tracker
            .wait_for_all_confirmed(Duration::from_secs(5))
            .expect("wait"));
        assert_eq!(tracker.outstanding_count(), 0);
        receive_path.join().expect("join");
    }

    #[test]
    fn drain_is_not_observed_before_listener_returns() {
        let tracker = Arc::new(enabled_tracker());
        let listener_done = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&listener_done);
        tracker.add_confirm_callbacks(
            move |_, _| {
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            },
            |_, _| {},
        );
        publish_n(&tracker, 1);
        let receive_path = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.on_confirm(1, false, true).expect("confirm"))
        };
        assert!(tracker
            .wait_for_all_confirmed(Duration::from_secs(5))
            .expect("wait"));
        assert!(listener_done.load(Ordering::SeqCst));
        receive_path.join().expect("join");
    }

    #[test]
    fn reset_releases_blocked_waiter() {
        let tracker = Arc::new(enabled_tracker());
        publish_n(&tracker, 4);
        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let started = Instant::now();
                let result = tracker.wait_for_all_confirmed(Duration::from_secs(30));
                (result, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        tracker.reset();
        let (result, elapsed) = waiter.join().expect("join");
        assert_eq!(result, Err(ConfirmError::ChannelReset { generation: 1 }));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn reset_clears_state_and_restarts_sequence() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 3);
        tracker.on_confirm(1, false, false).expect("nack");
        tracker.reset();
        assert!(tracker.is_enabled());
        assert_eq!(tracker.outstanding_count(), 0);
        assert_eq!(tracker.generation(), 1);
        assert_eq!(tracker.publish().expect("publish"), SequenceNumber::FIRST);
        // A confirm from the dead channel generation is unknown now.
        assert_eq!(
            tracker.on_confirm(3, false, true),
            Err(ConfirmError::UnknownSequence(seq(3)))
        );
        // Nacks before the reset do not leak into the next strict wait.
        tracker.on_confirm(1, false, true).expect("ack");
        tracker
            .wait_for_confirms_or_fail(Some(Duration::ZERO))
            .expect("strict wait");
        assert_eq!(tracker.counters().resets, 1);
    }

    #[test]
    fn strict_wait_reports_timeout_with_outstanding() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 3);
        tracker.on_confirm(2, false, true).expect("2");
        assert_eq!(
            tracker.wait_for_confirms_or_fail(Some(Duration::from_millis(10))),
            Err(ConfirmError::Timeout {
                outstanding: vec![seq(1), seq(3)],
            })
        );
    }

    #[test]
    fn strict_wait_reports_nacks_once() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 4);
        tracker.on_confirm(2, true, false).expect("nack");
        tracker.on_confirm(4, true, true).expect("ack");
        assert_eq!(
            tracker.wait_for_confirms_or_fail(None),
            Err(ConfirmError::Nacked { count: 2 })
        );
        tracker
            .wait_for_confirms_or_fail(None)
            .expect("nacks already reported");
    }

    // Batches of five, each drained through a mix of single and cumulative
    // confirms. A simulated queue gets its messages before the confirm goes
    // out, so a drained batch must always show exactly five new messages.
    #[test]
    fn batches_drain_with_mixed_confirms() {
        const BATCHES: usize = 20;
        const MESSAGES_PER_BATCH: usize = 5;

        let tracker = Arc::new(enabled_tracker());
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        for batch in 0..BATCHES {
            let mut published = Vec::with_capacity(MESSAGES_PER_BATCH);
            for _ in 0..MESSAGES_PER_BATCH {
                let seq = tracker.publish().expect("publish");
                queue.lock().push_back(seq);
                published.push(seq);
            }
            let receive_path = {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    tracker.on_confirm(published[0].get(), false, true).expect("single");
                    tracker.on_confirm(published[2].get(), true, true).expect("multiple");
                    tracker.on_confirm(published[3].get(), false, true).expect("single");
                    tracker.on_confirm(published[4].get(), true, true).expect("multiple");
                })
            };
            assert!(
                tracker
                    .wait_for_all_confirmed(Duration::from_secs(10))
                    .expect("wait"),
                "batch {batch} not confirmed: {:?}",
                tracker.outstanding()
            );
            receive_path.join().expect("join");
            let drained: Vec<_> = queue.lock().drain(..).collect();
            assert_eq!(drained.len(), MESSAGES_PER_BATCH, "batch {batch}");
        }
        assert_eq!(tracker.counters().acked, (BATCHES * MESSAGES_PER_BATCH) as u64);
    }

    #[tokio::test]
    async fn async_wait_is_released_by_confirms() {
        let tracker = Arc::new(enabled_tracker());
        publish_n(&tracker, 3);
        let receive_path = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracker.on_confirm(3, true, true).expect("confirm");
            })
        };
        assert!(tracker
            .wait_for_all_confirmed_async(Duration::from_secs(5))
            .await
            .expect("wait"));
        receive_path.await.expect("join");
    }

    #[tokio::test]
    async fn async_wait_times_out_without_side_effects() {
        let tracker = enabled_tracker();
        publish_n(&tracker, 2);
        assert!(!tracker
            .wait_for_all_confirmed_async(Duration::from_millis(20))
            .await
            .expect("wait"));
        assert_eq!(tracker.outstanding(), vec![seq(1), seq(2)]);
    }

    #[tokio::test]
    async fn async_wait_is_released_by_reset() {
        let tracker = Arc::new(enabled_tracker());
        publish_n(&tracker, 2);
        let resetter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracker.reset();
            })
        };
        assert_eq!(
            tracker
                .wait_for_all_confirmed_async(Duration::from_secs(30))
                .await,
            Err(ConfirmError::ChannelReset { generation: 1 })
        );
        resetter.await.expect("join");
    }
}
