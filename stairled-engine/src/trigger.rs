use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Structured record of one successful sensor trigger. Persistence is a
/// sink concern; the core only emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub sensor_name: String,
    pub value: i32,
    pub animation_name: String,
    pub timestamp_ms: u64,
}

#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn record(
        &self,
        event: TriggerEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
