use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};

use super::{EventSink, PAYLOAD_TYPE_HEADER};
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

pub struct KafkaProducer {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
}

impl KafkaProducer {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()
            .context("Failed to create Kafka producer")?;

        let cb_config = CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        };

        Ok(Self {
            producer,
            circuit_breaker: CircuitBreaker::new(cb_config),
        })
    }

    /// Shared handle, used by the health monitor to derive broker health
    pub fn circuit_breaker(&self) -> CircuitBreaker {
        self.circuit_breaker.clone()
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state().await
    }
}

#[async_trait]
impl EventSink for KafkaProducer {
    async fn publish(&self, topic: &str, key: &str, payload_type_name: &str, payload: &[u8]) -> Result<()> {
        let result = self
            .circuit_breaker
            .call(async {
                let headers = OwnedHeaders::new().insert(Header {
                    key: PAYLOAD_TYPE_HEADER,
                    value: Some(payload_type_name),
                });
                let record = FutureRecord::to(topic).key(key).payload(payload).headers(headers);

                self.producer
                    .send(record, Timeout::After(Duration::from_secs(5)))
                    .await
                    .map_err(|(e, _)| anyhow::anyhow!("Kafka send error: {}", e))?;

                Ok::<(), anyhow::Error>(())
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %topic, key = %key, "Published to Kafka");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(topic = %topic, "Circuit breaker open - Kafka unavailable");
                Err(anyhow::anyhow!("Circuit breaker open for Kafka"))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, topic = %topic, "Failed to publish to Kafka");
                Err(e)
            }
        }
    }
}
