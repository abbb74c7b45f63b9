use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::repository::ConnectionRecord;
use super::SessionMessage;
use crate::delivery::{Delivery, DeliveryError, DeliveryTarget};
use crate::metrics::Metrics;

// ============================================================================
// Connection Registry
// ============================================================================
//
// Node-local table of live sessions. An entry is inserted and removed only by
// its own session; deliveries from the dispatcher and the router look entries
// up concurrently and enqueue onto the session's bounded outbound queue.
//
// A full queue is reported as Backpressure, never waited on.
//
// ============================================================================

struct ConnectionContext {
    record: ConnectionRecord,
    outbound: mpsc::Sender<SessionMessage>,
}

pub struct ConnectionRegistry {
    local_node: String,
    queue_capacity: usize,
    contexts: DashMap<i64, ConnectionContext>,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new(local_node: impl Into<String>, queue_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            local_node: local_node.into(),
            queue_capacity: queue_capacity.max(1),
            contexts: DashMap::new(),
            metrics,
        }
    }

    /// `host:port` other nodes use to reach this registry
    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Register a live session; the returned receiver is its outbound queue
    pub fn register(&self, record: ConnectionRecord) -> mpsc::Receiver<SessionMessage> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = record.id;

        if self
            .contexts
            .insert(id, ConnectionContext { record, outbound: tx })
            .is_some()
        {
            tracing::warn!(connection_id = id, "Replaced an existing connection context");
        }

        self.metrics.active_connections.set(self.contexts.len() as i64);
        tracing::debug!(connection_id = id, "Connection context registered");
        rx
    }

    pub fn remove(&self, id: i64) -> Option<ConnectionRecord> {
        let removed = self.contexts.remove(&id).map(|(_, ctx)| ctx.record);
        self.metrics.active_connections.set(self.contexts.len() as i64);
        removed
    }

    pub fn contains(&self, id: i64) -> bool {
        self.contexts.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn send_to_connection(&self, id: i64, message: SessionMessage) -> Result<(), DeliveryError> {
        let ctx = self.contexts.get(&id).ok_or(DeliveryError::NotFound)?;

        match ctx.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.backpressure_rejections.inc();
                tracing::warn!(connection_id = id, "Outbound queue full");
                Err(DeliveryError::Backpressure)
            }
            // Session loop already gone; teardown is about to remove the entry
            Err(TrySendError::Closed(_)) => Err(DeliveryError::NotFound),
        }
    }

    /// Fan out to every local session of `user_name`. Succeeds if at least
    /// one queue accepted the message.
    pub fn send_to_user(&self, user_name: &str, message: SessionMessage) -> Result<(), DeliveryError> {
        let targets: Vec<i64> = self
            .contexts
            .iter()
            .filter(|entry| entry.record.user_name == user_name)
            .map(|entry| *entry.key())
            .collect();

        if targets.is_empty() {
            return Err(DeliveryError::NotFound);
        }

        let mut delivered = 0;
        let mut backpressured = 0;
        for id in targets {
            match self.send_to_connection(id, message.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Backpressure) => backpressured += 1,
                Err(_) => {}
            }
        }

        match (delivered, backpressured) {
            (0, 0) => Err(DeliveryError::NotFound),
            (0, _) => Err(DeliveryError::Backpressure),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Delivery for ConnectionRegistry {
    async fn deliver(&self, target: DeliveryTarget, message: SessionMessage) -> Result<(), DeliveryError> {
        match target {
            DeliveryTarget::Connection(id) => self.send_to_connection(id, message),
            DeliveryTarget::User(user_name) => self.send_to_user(&user_name, message),
        }
    }
}
