use felix_broker::{Broker, BrokerChannel, ConfirmReceiver, DEFAULT_FANOUT_EXCHANGE, QueueOptions};
use felix_confirm::{ConfirmError, ConfirmTracker};
use std::sync::{Arc, Once};
use tokio::task::JoinHandle;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub async fn fanout_queues(broker: &Broker, count: usize) -> Vec<String> {
    let mut queues = Vec::with_capacity(count);
    for index in 0..count {
        let name = format!("visibility-{index}");
        broker
            .declare_queue(name.clone(), QueueOptions::default())
            .await
            .expect("declare");
        broker
            .bind_queue(DEFAULT_FANOUT_EXCHANGE, &name)
            .await
            .expect("bind");
        queues.push(name);
    }
    queues
}

/// Opens a confirm-mode channel and wires its confirm frames into a tracker.
pub async fn confirm_channel(
    broker: &Arc<Broker>,
) -> (BrokerChannel, Arc<ConfirmTracker>, JoinHandle<Result<(), ConfirmError>>) {
    let (channel, confirms) = broker.open_channel().await;
    channel.confirm_select().await.expect("confirm select");
    let tracker = Arc::new(ConfirmTracker::new(channel.id()));
    tracker.enable();
    let receive_path = spawn_receive_path(Arc::clone(&tracker), confirms);
    (channel, tracker, receive_path)
}

// Stands in for the transport's receive loop: one task per channel, confirms
// fed to the tracker in the order the broker sent them.
pub fn spawn_receive_path(
    tracker: Arc<ConfirmTracker>,
    mut confirms: ConfirmReceiver,
) -> JoinHandle<Result<(), ConfirmError>> {
    tokio::spawn(async move {
        while let Some(frame) = confirms.recv().await {
            tracker.on_confirm(frame.delivery_tag, frame.multiple, frame.ack)?;
        }
        Ok(())
    })
}
