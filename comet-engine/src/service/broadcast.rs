//! Real-time event fan-out
//!
//! Delivery is best-effort: publishing never blocks and never fails the
//! pipeline run that produced the event.

use comet_core::domain::event::PipelineEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Sink for progress and terminal events
pub trait EventBroadcaster: Send + Sync {
    fn publish(&self, event: PipelineEvent);
}

/// Broadcaster backed by a tokio broadcast channel
///
/// Slow subscribers lose the oldest events rather than slowing the engine.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<PipelineEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn publish(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No subscribers for pipeline event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_core::domain::event::EventKind;
    use uuid::Uuid;

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let broadcaster = ChannelBroadcaster::new(4);
        broadcaster.publish(PipelineEvent::new(
            EventKind::Started,
            Uuid::new_v4(),
            serde_json::Value::Null,
        ));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = ChannelBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();
        let run_id = Uuid::new_v4();

        broadcaster.publish(PipelineEvent::new(
            EventKind::Completed,
            run_id,
            serde_json::Value::Null,
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Completed);
        assert_eq!(event.run_id, run_id);
    }
}
