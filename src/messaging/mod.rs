pub mod consumer;
pub mod kafka;

use async_trait::async_trait;

pub use consumer::run_consumer;
pub use kafka::KafkaProducer;

/// Broker header carrying the fully qualified payload type
pub const PAYLOAD_TYPE_HEADER: &str = "payloadTypeName";

/// Anything the outbox relay can publish to
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload_type_name: &str, payload: &[u8]) -> anyhow::Result<()>;
}
