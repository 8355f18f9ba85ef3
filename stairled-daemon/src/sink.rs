use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use stairled_engine::trigger::{TriggerEvent, TriggerSink};

/// Default trigger sink: structured log line plus a broadcast channel an
/// external surface (UI, recorder) can subscribe to.
pub struct TriggerPublisher {
    events: broadcast::Sender<TriggerEvent>,
}

impl TriggerPublisher {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl TriggerSink for TriggerPublisher {
    async fn record(
        &self,
        event: TriggerEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "trigger: sensor {:?} value {} -> animation {:?}",
            event.sensor_name, event.value, event.animation_name
        );
        // no subscribers is fine; the log line above already recorded it
        let _ = self.events.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_recorded_events() {
        let publisher = TriggerPublisher::new(8);
        let mut events = publisher.subscribe();

        let event = TriggerEvent {
            sensor_name: "hall".into(),
            value: 400,
            animation_name: "sweep".into(),
            timestamp_ms: 12,
        };
        publisher.record(event.clone()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn recording_without_subscribers_succeeds() {
        let publisher = TriggerPublisher::new(8);
        let event = TriggerEvent {
            sensor_name: "hall".into(),
            value: 1,
            animation_name: "sweep".into(),
            timestamp_ms: 0,
        };
        publisher.record(event).await.unwrap();
    }
}
