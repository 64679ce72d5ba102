// In-process broker with fanout exchanges, bounded queues and publisher confirms.
// Channels in confirm mode count delivery tags on the broker side and emit
// confirm frames from a dedicated writer task, the same way a network broker
// would send them back on the channel's frame stream.
use ahash::RandomState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use felix_common::ids::ChannelId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

#[cfg(feature = "telemetry")]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        metrics::counter!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        NoopCounter
    };
}

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
struct NoopCounter;

#[cfg(not(feature = "telemetry"))]
impl NoopCounter {
    fn increment(&self, _value: u64) {}
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("queue {0} already declared with different options")]
    QueueOptionsMismatch(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("delivery tag space exhausted")]
    DeliveryTagExhausted,
}

/// Exchange declared on every broker, bound like the default fanout exchange.
pub const DEFAULT_FANOUT_EXCHANGE: &str = "amq.fanout";

const CONFIRM_QUEUE_DEPTH: usize = 1024;

/// Queue declaration arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// When set, publishes to a full queue are rejected and nacked.
    pub max_length: Option<usize>,
}

#[derive(Debug)]
struct QueueState {
    name: String,
    options: QueueOptions,
    messages: Mutex<VecDeque<Bytes>>,
}

impl QueueState {
    fn new(name: String, options: QueueOptions) -> Self {
        Self {
            name,
            options,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    // Returns false when the queue is full and the message was rejected.
    fn offer(&self, payload: &Bytes) -> bool {
        let mut messages = self.messages.lock();
        if let Some(max) = self.options.max_length
            && messages.len() >= max
        {
            return false;
        }
        messages.push_back(payload.clone());
        true
    }

    fn depth(&self) -> usize {
        self.messages.lock().len()
    }

    fn purge(&self) -> usize {
        let mut messages = self.messages.lock();
        let purged = messages.len();
        messages.clear();
        purged
    }

    fn pop(&self) -> Option<Bytes> {
        self.messages.lock().pop_front()
    }
}

#[derive(Debug)]
struct ExchangeState {
    // Snapshot used by the publish path: lock-free read, no per-publish allocation.
    bindings_snapshot: ArcSwap<Vec<Arc<QueueState>>>,
    // Mutated only on bind/unbind paths.
    bindings: Mutex<Vec<Arc<QueueState>>>,
}

impl ExchangeState {
    fn new() -> Self {
        Self {
            bindings_snapshot: ArcSwap::from_pointee(Vec::new()),
            bindings: Mutex::new(Vec::new()),
        }
    }

    fn bind(&self, queue: Arc<QueueState>) -> bool {
        let mut bindings = self.bindings.lock();
        if bindings.iter().any(|bound| bound.name == queue.name) {
            return false;
        }
        bindings.push(queue);
        self.bindings_snapshot.store(Arc::new(bindings.clone()));
        true
    }

    fn unbind(&self, queue: &str) -> bool {
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|bound| bound.name != queue);
        let removed = bindings.len() != before;
        if removed {
            self.bindings_snapshot.store(Arc::new(bindings.clone()));
        }
        removed
    }
}

/// Result of routing one publish through an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    /// At least one bound queue refused the message.
    pub rejected: bool,
}

/// In-process broker.
///
/// ```
/// use bytes::Bytes;
/// use felix_broker::{Broker, QueueOptions, DEFAULT_FANOUT_EXCHANGE};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Broker::new();
///     broker.declare_queue("q1", QueueOptions::default()).await.expect("declare");
///     broker.bind_queue(DEFAULT_FANOUT_EXCHANGE, "q1").await.expect("bind");
///     broker
///         .route(DEFAULT_FANOUT_EXCHANGE, Bytes::from_static(b"hello"))
///         .await
///         .expect("route");
///     assert_eq!(broker.queue_purge("q1").await.expect("purge"), 1);
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    queues: RwLock<HashMap<String, Arc<QueueState>, RandomState>>,
    exchanges: RwLock<HashMap<String, Arc<ExchangeState>, RandomState>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let mut exchanges = HashMap::with_hasher(RandomState::new());
        exchanges.insert(
            DEFAULT_FANOUT_EXCHANGE.to_string(),
            Arc::new(ExchangeState::new()),
        );
        Self {
            queues: RwLock::new(HashMap::with_hasher(RandomState::new())),
            exchanges: RwLock::new(exchanges),
        }
    }

    /// Declares a fanout exchange. Returns false if it already existed.
    pub async fn declare_exchange(&self, name: impl Into<String>) -> bool {
        let mut exchanges = self.exchanges.write().await;
        let name = name.into();
        if exchanges.contains_key(&name) {
            return false;
        }
        exchanges.insert(name, Arc::new(ExchangeState::new()));
        true
    }

    /// Declares a queue. Re-declaring with identical options is a no-op
    /// returning false.
    pub async fn declare_queue(
        &self,
        name: impl Into<String>,
        options: QueueOptions,
    ) -> Result<bool> {
        let name = name.into();
        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(&name) {
            if existing.options != options {
                return Err(BrokerError::QueueOptionsMismatch(name));
            }
            return Ok(false);
        }
        queues.insert(name.clone(), Arc::new(QueueState::new(name, options)));
        Ok(true)
    }

    /// Deletes a queue and removes it from every exchange. Returns the number of
    /// messages dropped with it.
    pub async fn delete_queue(&self, name: &str) -> Result<usize> {
        let queue = self
            .queues
            .write()
            .await
            .remove(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        let exchanges = self.exchanges.read().await;
        for exchange in exchanges.values() {
            exchange.unbind(name);
        }
        Ok(queue.purge())
    }

    pub async fn bind_queue(&self, exchange: &str, queue: &str) -> Result<bool> {
        let queue_state = self.get_queue(queue).await?;
        let exchange_state = self.get_exchange(exchange).await?;
        Ok(exchange_state.bind(queue_state))
    }

    pub async fn unbind_queue(&self, exchange: &str, queue: &str) -> Result<bool> {
        let exchange_state = self.get_exchange(exchange).await?;
        Ok(exchange_state.unbind(queue))
    }

    /// Delivers `payload` to every queue bound to `exchange`.
    ///
    /// Every bound queue has either accepted or refused the message by the time
    /// this returns.
    pub async fn route(&self, exchange: &str, payload: Bytes) -> Result<RouteOutcome> {
        let exchange_state = self.get_exchange(exchange).await?;
        let bindings = exchange_state.bindings_snapshot.load_full();
        let mut refused: SmallVec<[&str; 4]> = SmallVec::new();
        let mut delivered = 0;
        for queue in bindings.iter() {
            if queue.offer(&payload) {
                delivered += 1;
            } else {
                refused.push(queue.name.as_str());
            }
        }
        if !refused.is_empty() {
            debug!(exchange, queues = ?refused, "publish refused by full queues");
        }
        t_counter!("felix_broker_routed_total").increment(delivered as u64);
        Ok(RouteOutcome {
            delivered,
            rejected: !refused.is_empty(),
        })
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<usize> {
        Ok(self.get_queue(queue).await?.depth())
    }

    /// Drops every message in the queue and returns how many were removed.
    pub async fn queue_purge(&self, queue: &str) -> Result<usize> {
        Ok(self.get_queue(queue).await?.purge())
    }

    /// Takes the oldest message from the queue, if any.
    pub async fn basic_get(&self, queue: &str) -> Result<Option<Bytes>> {
        Ok(self.get_queue(queue).await?.pop())
    }

    /// Opens a channel. Confirm frames for it arrive on the returned receiver
    /// once [`BrokerChannel::confirm_select`] has been called.
    pub async fn open_channel(self: &Arc<Self>) -> (BrokerChannel, ConfirmReceiver) {
        let id = ChannelId::new();
        let (pending_tx, pending_rx) = mpsc::channel(CONFIRM_QUEUE_DEPTH);
        let (frames_tx, frames_rx) = mpsc::channel(CONFIRM_QUEUE_DEPTH);
        tokio::spawn(run_confirm_writer(id, pending_rx, frames_tx));
        debug!(channel_id = %id, "broker channel opened");
        let channel = BrokerChannel {
            id,
            broker: Arc::clone(self),
            publish: tokio::sync::Mutex::new(PublishState {
                confirm_mode: false,
                next_tag: 1,
                pending_tx: Some(pending_tx),
            }),
        };
        (channel, ConfirmReceiver { frames: frames_rx })
    }

    async fn get_queue(&self, queue: &str) -> Result<Arc<QueueState>> {
        self.queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn get_exchange(&self, exchange: &str) -> Result<Arc<ExchangeState>> {
        self.exchanges
            .read()
            .await
            .get(exchange)
            .cloned()
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))
    }
}

/// Confirm frame as the broker sends it back on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmFrame {
    pub delivery_tag: u64,
    pub multiple: bool,
    pub ack: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingConfirm {
    delivery_tag: u64,
    ack: bool,
}

#[derive(Debug)]
struct PublishState {
    confirm_mode: bool,
    next_tag: u64,
    // Dropped on close so the writer task drains and exits.
    pending_tx: Option<mpsc::Sender<PendingConfirm>>,
}

/// Broker side of one client channel.
///
/// Publishes are serialized per channel: routing and delivery-tag assignment
/// happen under one lock, so tags follow publish order exactly.
#[derive(Debug)]
pub struct BrokerChannel {
    id: ChannelId,
    broker: Arc<Broker>,
    publish: tokio::sync::Mutex<PublishState>,
}

impl BrokerChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Puts the channel in confirm mode. Idempotent.
    pub async fn confirm_select(&self) -> Result<()> {
        let mut state = self.publish.lock().await;
        if state.pending_tx.is_none() {
            return Err(BrokerError::ChannelClosed);
        }
        if !state.confirm_mode {
            state.confirm_mode = true;
            debug!(channel_id = %self.id, "confirm mode selected");
        }
        Ok(())
    }

    /// Routes a message and, in confirm mode, schedules its confirm. Returns the
    /// delivery tag the broker assigned, or `None` outside confirm mode.
    pub async fn basic_publish(&self, exchange: &str, payload: Bytes) -> Result<Option<u64>> {
        let mut state = self.publish.lock().await;
        let Some(pending_tx) = state.pending_tx.clone() else {
            return Err(BrokerError::ChannelClosed);
        };
        let outcome = self.broker.route(exchange, payload).await?;
        if !state.confirm_mode {
            return Ok(None);
        }
        let delivery_tag = state.next_tag;
        state.next_tag = delivery_tag
            .checked_add(1)
            .ok_or(BrokerError::DeliveryTagExhausted)?;
        pending_tx
            .send(PendingConfirm {
                delivery_tag,
                ack: !outcome.rejected,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;
        Ok(Some(delivery_tag))
    }

    /// Closes the channel. Confirms already scheduled are still delivered, then
    /// the confirm receiver ends.
    pub async fn close(&self) {
        let mut state = self.publish.lock().await;
        if state.pending_tx.take().is_some() {
            debug!(channel_id = %self.id, "broker channel closed");
        }
    }
}

/// Receiving end of a channel's confirm frames.
#[derive(Debug)]
pub struct ConfirmReceiver {
    frames: mpsc::Receiver<ConfirmFrame>,
}

impl ConfirmReceiver {
    pub async fn recv(&mut self) -> Option<ConfirmFrame> {
        self.frames.recv().await
    }
}

// Single writer per channel: drains whatever confirms are pending and emits them
// in tag order, folding runs of same-outcome tags into one `multiple` frame.
// Earlier tags were always emitted first, so a cumulative frame covers exactly
// the run it was built from.
async fn run_confirm_writer(
    channel_id: ChannelId,
    mut pending_rx: mpsc::Receiver<PendingConfirm>,
    frames_tx: mpsc::Sender<ConfirmFrame>,
) {
    let mut batch: Vec<PendingConfirm> = Vec::new();
    while let Some(first) = pending_rx.recv().await {
        batch.clear();
        batch.push(first);
        while let Ok(next) = pending_rx.try_recv() {
            batch.push(next);
        }
        for frame in coalesce_confirms(&batch) {
            if frames_tx.send(frame).await.is_err() {
                debug!(%channel_id, "confirm receiver dropped; writer exiting");
                return;
            }
        }
    }
    debug!(%channel_id, "confirm writer exited");
}

fn coalesce_confirms(batch: &[PendingConfirm]) -> Vec<ConfirmFrame> {
    let mut frames = Vec::new();
    let mut index = 0;
    while index < batch.len() {
        let start = batch[index];
        let mut end = index;
        while end + 1 < batch.len()
            && batch[end + 1].ack == start.ack
            && batch[end + 1].delivery_tag == batch[end].delivery_tag + 1
        {
            end += 1;
        }
        frames.push(ConfirmFrame {
            delivery_tag: batch[end].delivery_tag,
            multiple: end > index,
            ack: start.ack,
        });
        index = end + 1;
    }
    frames
}
