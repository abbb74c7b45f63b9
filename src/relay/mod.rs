use std::sync::Arc;
use std::time::Duration;

use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use sqlx::AnyPool;

use crate::events::{outbox, topic_for, OutboxRecord};
use crate::messaging::EventSink;
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

// ============================================================================
// Outbox Relay Actor - built-in alternative to the CDC connector
// ============================================================================
//
// Polls `event_outbox` in position order and publishes each row to
// `{namespace}.{type}` keyed by its aggregate id. A row is deleted only after
// the broker acknowledged it. The first row that cannot be published ends
// the batch, so later rows never overtake it; it is retried on the next poll.
//
// ============================================================================

// ============================================================================
// Messages
// ============================================================================

/// Publish one batch of pending outbox rows
#[derive(Debug)]
pub struct PollOutbox;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

impl Reply for RelayReport {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

// ============================================================================
// Outbox Relay Actor
// ============================================================================

pub struct OutboxRelay {
    pool: AnyPool,
    sink: Arc<dyn EventSink>,
    namespace: String,
    batch_size: i64,
    poll_interval: Option<Duration>,
    retry_config: RetryConfig,
    metrics: Arc<Metrics>,
}

impl OutboxRelay {
    pub fn new(pool: AnyPool, sink: Arc<dyn EventSink>, namespace: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            sink,
            namespace: namespace.into(),
            batch_size: 100,
            poll_interval: Some(Duration::from_millis(500)),
            retry_config: RetryConfig::aggressive(),
            metrics,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// `None` disables the polling loop; batches then only run on PollOutbox
    pub fn with_poll_interval(mut self, poll_interval: Option<Duration>) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub async fn relay_batch(&self) -> RelayReport {
        let mut report = RelayReport::default();

        let rows = match outbox::fetch_pending(&self.pool, self.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read outbox");
                return report;
            }
        };

        for row in &rows {
            if !self.publish(row).await {
                report.failed += 1;
                break;
            }

            if let Err(e) = outbox::remove(&self.pool, row.position).await {
                // Already published; it will be published again next poll
                tracing::error!(error = %e, event_id = %row.id, "Failed to remove relayed outbox row");
                break;
            }
            report.published += 1;
        }

        if report.published > 0 || report.failed > 0 {
            tracing::debug!(published = report.published, failed = report.failed, "Outbox batch relayed");
        }
        report
    }

    async fn publish(&self, row: &OutboxRecord) -> bool {
        let topic = topic_for(&self.namespace, &row.event_type);
        let sink = self.sink.as_ref();
        let topic_ref = topic.as_str();

        let result = retry_with_backoff(self.retry_config.clone(), move |attempt| {
            tracing::debug!(attempt = attempt, event_id = %row.id, "Attempting to publish outbox row");
            sink.publish(topic_ref, &row.aggregate_id, &row.payload_type_name, &row.payload)
        })
        .await;

        match result {
            RetryResult::Success(()) => {
                self.metrics.record_relay(&row.event_type, true);
                tracing::info!(
                    event_id = %row.id,
                    topic = %topic,
                    aggregate_id = %row.aggregate_id,
                    "Relayed outbox event"
                );
                true
            }
            RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
                self.metrics.record_relay(&row.event_type, false);
                tracing::error!(
                    error = %e,
                    event_id = %row.id,
                    topic = %topic,
                    "Failed to relay outbox event, keeping it for the next poll"
                );
                false
            }
        }
    }
}

impl Actor for OutboxRelay {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(
            namespace = %state.namespace,
            batch_size = state.batch_size,
            "OutboxRelay started"
        );

        if let Some(poll_interval) = state.poll_interval {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(poll_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    // Waits for the batch, so polls never pile up in the mailbox
                    if actor_ref.ask(PollOutbox).send().await.is_err() {
                        break;
                    }
                }
                tracing::info!("Outbox polling stopped");
            });
        }

        Ok(state)
    }
}

impl Message<PollOutbox> for OutboxRelay {
    type Reply = RelayReport;

    async fn handle(&mut self, _msg: PollOutbox, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.relay_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use crate::db::UnitOfWork;
    use crate::events::proto::{Connection, ConnectionChangedEvent};
    use crate::events::{DomainEvent, OutboxWriter};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Published {
        topic: String,
        key: String,
        payload_type_name: String,
    }

    /// Accepts the first `accept` publishes, fails the rest
    struct RecordingSink {
        accept: usize,
        published: Mutex<Vec<Published>>,
    }

    impl RecordingSink {
        fn new(accept: usize) -> Arc<Self> {
            Arc::new(Self {
                accept,
                published: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, topic: &str, key: &str, payload_type_name: &str, _payload: &[u8]) -> anyhow::Result<()> {
            let mut published = self.published.lock().unwrap();
            if published.len() >= self.accept {
                anyhow::bail!("broker unavailable");
            }
            published.push(Published {
                topic: topic.to_string(),
                key: key.to_string(),
                payload_type_name: payload_type_name.to_string(),
            });
            Ok(())
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    async fn write_connection_events(pool: &AnyPool, ids: &[i64]) {
        let events: Vec<DomainEvent> = ids
            .iter()
            .map(|id| {
                ConnectionChangedEvent::created(Connection {
                    id: *id,
                    session_id: format!("s-{}", id),
                    user_name: "admin".to_string(),
                    host: "node-a:9400".to_string(),
                })
                .into()
            })
            .collect();

        let mut uow = UnitOfWork::begin(pool).await.unwrap();
        OutboxWriter::new().publish(&mut uow, &events).await.unwrap();
        uow.commit().await.unwrap();
    }

    fn relay(pool: &AnyPool, sink: Arc<RecordingSink>) -> OutboxRelay {
        OutboxRelay::new(pool.clone(), sink, "canvas", Arc::new(Metrics::new().unwrap()))
            .with_poll_interval(None)
            .with_retry(fast_retry())
    }

    #[tokio::test]
    async fn test_relay_publishes_in_order_and_drains_outbox() {
        let pool = memory_pool().await;
        write_connection_events(&pool, &[1, 2, 3]).await;
        let sink = RecordingSink::new(usize::MAX);

        let report = relay(&pool, sink.clone()).relay_batch().await;

        assert_eq!(report, RelayReport { published: 3, failed: 0 });
        let keys: Vec<String> = sink.published().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
        assert_eq!(sink.published()[0].topic, "canvas.ConnectionChangedEvent");
        assert_eq!(sink.published()[0].payload_type_name, "canvas.events.ConnectionChangedEvent");
        assert!(outbox::fetch_pending(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_keeps_remaining_rows() {
        let pool = memory_pool().await;
        write_connection_events(&pool, &[1, 2, 3]).await;
        let sink = RecordingSink::new(1);
        let relay = relay(&pool, sink.clone());

        let report = relay.relay_batch().await;

        assert_eq!(report, RelayReport { published: 1, failed: 1 });
        let pending: Vec<String> = outbox::fetch_pending(&pool, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.aggregate_id)
            .collect();
        assert_eq!(pending, vec!["2", "3"]);
        assert_eq!(
            relay
                .metrics
                .relay_failed
                .with_label_values(&["ConnectionChangedEvent"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_batch_size_limits_each_poll() {
        let pool = memory_pool().await;
        write_connection_events(&pool, &[1, 2, 3]).await;
        let sink = RecordingSink::new(usize::MAX);
        let relay = relay(&pool, sink.clone()).with_batch_size(2);

        assert_eq!(relay.relay_batch().await.published, 2);
        assert_eq!(relay.relay_batch().await.published, 1);
        assert_eq!(relay.relay_batch().await, RelayReport::default());
    }

    #[tokio::test]
    async fn test_actor_relays_on_poll() {
        let pool = memory_pool().await;
        write_connection_events(&pool, &[1]).await;
        let sink = RecordingSink::new(usize::MAX);

        let actor_ref = OutboxRelay::spawn(relay(&pool, sink.clone()));
        let Ok(report) = actor_ref.ask(PollOutbox).send().await else {
            panic!("relay did not answer");
        };

        assert_eq!(report.published, 1);
        assert_eq!(sink.published().len(), 1);
    }
}
