use std::sync::Arc;
use std::time::Instant;

use futures_util::TryStreamExt;
use sqlx::AnyPool;

use super::control::{ControlMessage, PushMessage};
use super::directory::{SubscriptionDirectory, SubscriptionRecord};
use crate::db::{StoreError, UnitOfWork};
use crate::delivery::{Delivery, DeliveryTarget};
use crate::events::proto::{
    ChangeType, ClientMessageReceivedEvent, ConnectionChangedEvent, FileDescriptorChangedEvent, FileState,
};
use crate::events::{short_name, DecodeError, DomainEvent, EventRegistry};
use crate::gateway::SessionMessage;
use crate::metrics::Metrics;
use crate::utils::IsTransient;

// ============================================================================
// Notification Dispatcher
// ============================================================================
//
// Turns broker events into directory updates and pushes:
// - FileDescriptorChangedEvent (CREATED/UPDATED, now UPLOADED, with a
//   canvasId attribute) -> push to every subscriber of that canvas
// - ClientMessageReceivedEvent with subscribe/unsubscribe JSON -> directory
// - ConnectionChangedEvent DELETED -> drop that connection's subscriptions
//
// A push that finds its connection gone (NotFound, Unreachable) removes the
// subscription instead of failing the message. Everything here is safe to
// run twice for the same broker message.
//
// ============================================================================

pub const CANVAS_ATTRIBUTE: &str = "canvasId";

/// A broker message detached from the consumer
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub type_name: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Pushed { delivered: usize, stale_removed: usize },
    SubscriptionChanged,
    ConnectionCleaned { removed: u64 },
    Ignored,
    UnknownType,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Pushed { .. } => "pushed",
            DispatchOutcome::SubscriptionChanged => "subscription_changed",
            DispatchOutcome::ConnectionCleaned { .. } => "connection_cleaned",
            DispatchOutcome::Ignored => "ignored",
            DispatchOutcome::UnknownType => "unknown_type",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Malformed(DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encoding push message failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IsTransient for DispatchError {
    fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Store(_))
    }
}

pub struct NotificationDispatcher {
    pool: AnyPool,
    events: EventRegistry,
    directory: SubscriptionDirectory,
    delivery: Arc<dyn Delivery>,
    metrics: Arc<Metrics>,
}

impl NotificationDispatcher {
    pub fn new(pool: AnyPool, events: EventRegistry, delivery: Arc<dyn Delivery>, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            events,
            directory: SubscriptionDirectory::new(),
            delivery,
            metrics,
        }
    }

    pub async fn handle(&self, record: &InboundRecord) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let event_type = record.type_name.as_deref().map(short_name).unwrap_or("none");

        let result = self.dispatch(record).await;

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(DispatchError::Malformed(_)) => "malformed",
            Err(_) => "failed",
        };
        self.metrics
            .record_consumed(event_type, outcome, started.elapsed().as_secs_f64());

        result
    }

    async fn dispatch(&self, record: &InboundRecord) -> Result<DispatchOutcome, DispatchError> {
        let event = match self.events.decode(&record.payload, record.type_name.as_deref()) {
            Ok(event) => event,
            Err(DecodeError::UnknownType(type_name)) => {
                tracing::debug!(
                    topic = %record.topic,
                    type_name = ?type_name,
                    "Skipping event of unknown type"
                );
                return Ok(DispatchOutcome::UnknownType);
            }
            Err(e) => return Err(DispatchError::Malformed(e)),
        };

        match event {
            DomainEvent::FileChanged(e) => self.on_file_changed(e).await,
            DomainEvent::ConnectionChanged(e) => self.on_connection_changed(e).await,
            DomainEvent::ClientMessageReceived(e) => self.on_client_message(e).await,
        }
    }

    async fn on_file_changed(&self, event: FileDescriptorChangedEvent) -> Result<DispatchOutcome, DispatchError> {
        if !matches!(event.change_type(), ChangeType::Created | ChangeType::Updated) {
            return Ok(DispatchOutcome::Ignored);
        }
        let Some(file) = event.new_value else {
            return Ok(DispatchOutcome::Ignored);
        };
        if file.state() != FileState::Uploaded {
            return Ok(DispatchOutcome::Ignored);
        }
        let Some(raw_canvas_id) = file.attributes.get(CANVAS_ATTRIBUTE) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Ok(canvas_id) = raw_canvas_id.parse::<i64>() else {
            tracing::warn!(file_id = file.id, canvas_id = %raw_canvas_id, "File has a non-numeric canvasId");
            return Ok(DispatchOutcome::Ignored);
        };

        let subscribers = self.subscribers(canvas_id).await?;
        let push = PushMessage::FileUploaded {
            canvas_id,
            file_id: file.id,
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
        }
        .to_json()?;

        let mut delivered = 0;
        let mut stale_removed = 0;
        for subscription in subscribers {
            let target = DeliveryTarget::Connection(subscription.connection_id);
            match self.delivery.deliver(target, SessionMessage::Text(push.clone())).await {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.record_push("delivered");
                }
                Err(e) if e.is_stale_target() => {
                    self.metrics.record_push(e.label());
                    tracing::info!(
                        canvas_id = canvas_id,
                        connection_id = subscription.connection_id,
                        reason = %e,
                        "Removing stale subscription"
                    );
                    self.remove_stale(&subscription).await?;
                    stale_removed += 1;
                }
                Err(e) => {
                    self.metrics.record_push(e.label());
                    tracing::warn!(
                        canvas_id = canvas_id,
                        connection_id = subscription.connection_id,
                        error = %e,
                        "Push not delivered"
                    );
                }
            }
        }

        tracing::debug!(
            canvas_id = canvas_id,
            file_id = file.id,
            delivered = delivered,
            stale_removed = stale_removed,
            "File upload dispatched"
        );
        Ok(DispatchOutcome::Pushed { delivered, stale_removed })
    }

    async fn on_connection_changed(&self, event: ConnectionChangedEvent) -> Result<DispatchOutcome, DispatchError> {
        if event.change_type() != ChangeType::Deleted {
            return Ok(DispatchOutcome::Ignored);
        }
        let Some(connection_id) = event.connection().map(|c| c.id) else {
            return Ok(DispatchOutcome::Ignored);
        };

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let removed = self.directory.delete_all_for_connection(&mut uow, connection_id).await?;
        uow.commit().await?;

        if removed > 0 {
            tracing::info!(connection_id = connection_id, removed = removed, "Removed subscriptions of closed connection");
        }
        Ok(DispatchOutcome::ConnectionCleaned { removed })
    }

    async fn on_client_message(&self, event: ClientMessageReceivedEvent) -> Result<DispatchOutcome, DispatchError> {
        let Some(connection_id) = event.connection.as_ref().map(|c| c.id) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(text) = event.text_payload() else {
            return Ok(DispatchOutcome::Ignored);
        };

        let control = match ControlMessage::parse(text) {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!(connection_id = connection_id, error = %e, "Ignoring invalid control message");
                return Ok(DispatchOutcome::Ignored);
            }
        };

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        match control {
            ControlMessage::Subscribe { canvas_id } => {
                self.directory.subscribe(&mut uow, canvas_id, connection_id).await?;
                tracing::info!(canvas_id = canvas_id, connection_id = connection_id, "Connection subscribed");
            }
            ControlMessage::Unsubscribe { canvas_id } => {
                self.directory.unsubscribe(&mut uow, canvas_id, connection_id).await?;
                tracing::info!(canvas_id = canvas_id, connection_id = connection_id, "Connection unsubscribed");
            }
        }
        uow.commit().await?;

        Ok(DispatchOutcome::SubscriptionChanged)
    }

    /// Read the subscriber list and release the transaction before any push
    async fn subscribers(&self, canvas_id: i64) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let subscribers: Vec<SubscriptionRecord> = self
            .directory
            .find_subscribers(&mut uow, canvas_id)
            .try_collect()
            .await?;
        uow.commit().await?;
        Ok(subscribers)
    }

    async fn remove_stale(&self, subscription: &SubscriptionRecord) -> Result<(), StoreError> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        self.directory
            .unsubscribe(&mut uow, subscription.canvas_id, subscription.connection_id)
            .await?;
        uow.commit().await?;
        self.metrics.stale_subscriptions_removed.inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use crate::delivery::DeliveryError;
    use crate::events::proto::{Connection, FileDescriptor};
    use crate::gateway::{ConnectionRecord, ConnectionRegistry};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    fn inbound(event: impl Into<DomainEvent>) -> InboundRecord {
        let event = event.into();
        let (payload, type_name) = event.encode();
        InboundRecord {
            topic: format!("canvas.{}", event.event_name()),
            partition: 0,
            offset: 0,
            key: None,
            type_name: Some(type_name.to_string()),
            payload,
        }
    }

    fn connection(id: i64) -> Connection {
        Connection {
            id,
            session_id: format!("session-{}", id),
            user_name: "admin".to_string(),
            host: "node-a:9400".to_string(),
        }
    }

    fn uploaded(canvas_id: Option<&str>) -> FileDescriptorChangedEvent {
        let mut attributes = HashMap::new();
        if let Some(canvas_id) = canvas_id {
            attributes.insert(CANVAS_ATTRIBUTE.to_string(), canvas_id.to_string());
        }
        let file = FileDescriptor {
            id: 1,
            state: FileState::Uploaded as i32,
            version: 2,
            file_name: "plan.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            attributes,
        };
        let pending = FileDescriptor {
            state: FileState::Pending as i32,
            version: 1,
            ..file.clone()
        };
        FileDescriptorChangedEvent::updated(pending, file)
    }

    fn control(connection_id: i64, text: &str) -> ClientMessageReceivedEvent {
        ClientMessageReceivedEvent::text(connection(connection_id), text)
    }

    struct Node {
        pool: AnyPool,
        registry: Arc<ConnectionRegistry>,
        dispatcher: NotificationDispatcher,
    }

    async fn node() -> Node {
        let pool = memory_pool().await;
        let metrics = metrics();
        let registry = Arc::new(ConnectionRegistry::new("node-a:9400", 8, metrics.clone()));
        let dispatcher = NotificationDispatcher::new(
            pool.clone(),
            EventRegistry::with_domain_events(),
            registry.clone(),
            metrics,
        );
        Node { pool, registry, dispatcher }
    }

    fn session(registry: &ConnectionRegistry, id: i64) -> mpsc::Receiver<SessionMessage> {
        registry.register(ConnectionRecord {
            id,
            session_id: format!("session-{}", id),
            user_name: "admin".to_string(),
            host: "node-a:9400".to_string(),
        })
    }

    async fn subscription_count(pool: &AnyPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM canvas_subscription")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    /// Records every attempt and answers with a fixed result
    struct ScriptedDelivery {
        attempts: Mutex<Vec<DeliveryTarget>>,
        answer: Result<(), DeliveryError>,
    }

    impl ScriptedDelivery {
        fn new(answer: Result<(), DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                answer,
            })
        }
    }

    #[async_trait]
    impl Delivery for ScriptedDelivery {
        async fn deliver(&self, target: DeliveryTarget, _message: SessionMessage) -> Result<(), DeliveryError> {
            self.attempts.lock().unwrap().push(target);
            self.answer.clone()
        }
    }

    #[tokio::test]
    async fn test_subscribed_connection_receives_upload_push() {
        let node = node().await;
        let mut rx = session(&node.registry, 7);

        let outcome = node.dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::SubscriptionChanged);

        let outcome = node.dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 1, stale_removed: 0 });

        let Some(SessionMessage::Text(text)) = rx.recv().await else {
            panic!("expected a text push");
        };
        let push: PushMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(
            push,
            PushMessage::FileUploaded {
                canvas_id: 42,
                file_id: 1,
                file_name: "plan.pdf".to_string(),
                content_type: "application/pdf".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_connection_receives_nothing() {
        let node = node().await;
        let mut rx = session(&node.registry, 7);

        node.dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        node.dispatcher.handle(&inbound(control(7, r#"{"type":"unsubscribe","canvasId":42}"#))).await.unwrap();

        let outcome = node.dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 0, stale_removed: 0 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_connection_loses_subscriptions_without_delivery_attempts() {
        let pool = memory_pool().await;
        let delivery = ScriptedDelivery::new(Ok(()));
        let dispatcher = NotificationDispatcher::new(
            pool.clone(),
            EventRegistry::with_domain_events(),
            delivery.clone(),
            metrics(),
        );

        dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":43}"#))).await.unwrap();

        let outcome = dispatcher.handle(&inbound(ConnectionChangedEvent::deleted(connection(7)))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::ConnectionCleaned { removed: 2 });
        assert_eq!(subscription_count(&pool).await, 0);

        let outcome = dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 0, stale_removed: 0 });
        assert!(delivery.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_to_missing_connection_removes_subscription() {
        let node = node().await;
        let mut live = session(&node.registry, 7);

        node.dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        node.dispatcher.handle(&inbound(control(8, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();

        let outcome = node.dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 1, stale_removed: 1 });
        assert!(live.recv().await.is_some());
        assert_eq!(subscription_count(&node.pool).await, 1);

        // second dispatch no longer tries connection 8
        let outcome = node.dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 1, stale_removed: 0 });
    }

    #[tokio::test]
    async fn test_unreachable_owner_counts_as_stale_but_backpressure_does_not() {
        let pool = memory_pool().await;
        let unreachable = ScriptedDelivery::new(Err(DeliveryError::Unreachable("timeout".to_string())));
        let dispatcher = NotificationDispatcher::new(
            pool.clone(),
            EventRegistry::with_domain_events(),
            unreachable,
            metrics(),
        );
        dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        let outcome = dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 0, stale_removed: 1 });
        assert_eq!(subscription_count(&pool).await, 0);

        let pool = memory_pool().await;
        let busy = ScriptedDelivery::new(Err(DeliveryError::Backpressure));
        let dispatcher = NotificationDispatcher::new(pool.clone(), EventRegistry::with_domain_events(), busy, metrics());
        dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        let outcome = dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Pushed { delivered: 0, stale_removed: 0 });
        assert_eq!(subscription_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_irrelevant_file_events_are_ignored() {
        let node = node().await;
        let _rx = session(&node.registry, 7);
        node.dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();

        assert_eq!(node.dispatcher.handle(&inbound(uploaded(None))).await.unwrap(), DispatchOutcome::Ignored);
        assert_eq!(node.dispatcher.handle(&inbound(uploaded(Some("abc")))).await.unwrap(), DispatchOutcome::Ignored);

        let mut pending = uploaded(Some("42"));
        if let Some(file) = pending.new_value.as_mut() {
            file.state = FileState::Pending as i32;
        }
        assert_eq!(node.dispatcher.handle(&inbound(pending)).await.unwrap(), DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_invalid_control_message_is_ignored() {
        let node = node().await;

        let outcome = node.dispatcher.handle(&inbound(control(7, "hello there"))).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(subscription_count(&node.pool).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_harmless() {
        let node = node().await;
        let mut rx = session(&node.registry, 7);

        for _ in 0..2 {
            node.dispatcher.handle(&inbound(control(7, r#"{"type":"subscribe","canvasId":42}"#))).await.unwrap();
        }
        assert_eq!(subscription_count(&node.pool).await, 1);

        node.dispatcher.handle(&inbound(uploaded(Some("42")))).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_payloads() {
        let node = node().await;

        let mut foreign = inbound(uploaded(Some("42")));
        foreign.type_name = Some("billing.events.InvoicePaid".to_string());
        assert_eq!(node.dispatcher.handle(&foreign).await.unwrap(), DispatchOutcome::UnknownType);

        let mut untyped = inbound(uploaded(Some("42")));
        untyped.type_name = None;
        assert_eq!(node.dispatcher.handle(&untyped).await.unwrap(), DispatchOutcome::UnknownType);

        let mut garbage = inbound(uploaded(Some("42")));
        garbage.payload = vec![0xff, 0xff, 0xff];
        let result = node.dispatcher.handle(&garbage).await;
        assert!(matches!(result, Err(DispatchError::Malformed(_))));
        assert!(!result.unwrap_err().is_transient());
    }
}
