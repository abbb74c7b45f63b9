use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::AnyPool;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use super::proto::message_router_client::MessageRouterClient;
use super::proto::{deliver_request, deliver_response, message_payload, DeliverRequest, ErrorCode, MessagePayload};
use crate::delivery::{Delivery, DeliveryError, DeliveryTarget};
use crate::gateway::{ConnectionRegistry, ConnectionRepository, SessionMessage};

// ============================================================================
// Router Client
// ============================================================================
//
// Calling side of cross-node delivery. One lazily connected channel per peer
// node, dropped again whenever the peer stops answering so the next call
// reconnects.
//
// ============================================================================

pub struct RouterClient {
    channels: DashMap<String, Channel>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RouterClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            connect_timeout: request_timeout,
            request_timeout,
        }
    }

    async fn channel(&self, node: &str) -> Result<Channel, DeliveryError> {
        if let Some(channel) = self.channels.get(node) {
            return Ok(channel.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", node))
            .map_err(|e| DeliveryError::Unreachable(format!("invalid node address {}: {}", node, e)))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| DeliveryError::Unreachable(format!("{}: {}", node, e)))?;

        tracing::debug!(node, "Connected to peer router");
        self.channels.insert(node.to_string(), channel.clone());
        Ok(channel)
    }

    /// Ask `node` to deliver `message` to one of its local targets
    pub async fn deliver(&self, node: &str, target: DeliveryTarget, message: SessionMessage) -> Result<(), DeliveryError> {
        let text = match message {
            SessionMessage::Text(text) => text,
            other => return Err(DeliveryError::Undefined(format!("{:?} cannot be routed", other))),
        };

        let request = DeliverRequest {
            target: Some(match target {
                DeliveryTarget::Connection(id) => deliver_request::Target::ConnectionId(id),
                DeliveryTarget::User(user_name) => deliver_request::Target::UserName(user_name),
            }),
            message: Some(MessagePayload {
                content: Some(message_payload::Content::Text(text)),
            }),
        };

        let mut client = MessageRouterClient::new(self.channel(node).await?);

        let response = match tokio::time::timeout(self.request_timeout, client.deliver(request)).await {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) => {
                return Err(match status.code() {
                    Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
                        self.channels.remove(node);
                        DeliveryError::Unreachable(format!("{}: {}", node, status.message()))
                    }
                    _ => DeliveryError::Undefined(format!("{}: {}", node, status.message())),
                });
            }
            Err(_) => {
                self.channels.remove(node);
                return Err(DeliveryError::Unreachable(format!("{} timed out", node)));
            }
        };

        match response.outcome {
            Some(deliver_response::Outcome::Success(true)) => Ok(()),
            Some(deliver_response::Outcome::Error(failure)) if failure.code() == ErrorCode::NotFound => {
                Err(DeliveryError::NotFound)
            }
            Some(deliver_response::Outcome::Error(failure)) => Err(DeliveryError::Undefined(failure.message)),
            _ => Err(DeliveryError::Undefined(format!("{} returned no outcome", node))),
        }
    }
}

// ============================================================================
// Cluster Delivery
// ============================================================================

/// Delivery that resolves a connection's owning node from the store and
/// routes there when it is not this one.
pub struct ClusterDelivery {
    pool: AnyPool,
    connections: ConnectionRepository,
    registry: Arc<ConnectionRegistry>,
    client: RouterClient,
}

impl ClusterDelivery {
    pub fn new(pool: AnyPool, registry: Arc<ConnectionRegistry>, client: RouterClient) -> Self {
        Self {
            pool,
            connections: ConnectionRepository::new(),
            registry,
            client,
        }
    }

    async fn deliver_to_connection(&self, id: i64, message: SessionMessage) -> Result<(), DeliveryError> {
        if self.registry.contains(id) {
            return self.registry.send_to_connection(id, message);
        }

        let record = self
            .connections
            .find_by_id(&self.pool, id)
            .await
            .map_err(|e| DeliveryError::Undefined(e.to_string()))?
            .ok_or(DeliveryError::NotFound)?;

        if record.host == self.registry.local_node() {
            // Record says it is ours but no session is live here
            return Err(DeliveryError::NotFound);
        }

        tracing::debug!(connection_id = id, node = %record.host, "Routing delivery to owning node");
        self.client
            .deliver(&record.host, DeliveryTarget::Connection(id), message)
            .await
    }

    async fn deliver_to_user(&self, user_name: &str, message: SessionMessage) -> Result<(), DeliveryError> {
        let hosts = self
            .connections
            .find_hosts_for_user(&self.pool, user_name)
            .await
            .map_err(|e| DeliveryError::Undefined(e.to_string()))?;

        let mut outcomes = vec![self.registry.send_to_user(user_name, message.clone())];
        for host in hosts.iter().filter(|h| h.as_str() != self.registry.local_node()) {
            outcomes.push(
                self.client
                    .deliver(host, DeliveryTarget::User(user_name.to_string()), message.clone())
                    .await,
            );
        }

        combine(outcomes)
    }
}

/// Success if any node accepted; otherwise the most actionable failure
fn combine(outcomes: Vec<Result<(), DeliveryError>>) -> Result<(), DeliveryError> {
    let mut worst: Option<DeliveryError> = None;

    for outcome in outcomes {
        let err = match outcome {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        worst = Some(match worst {
            None => err,
            Some(prev) => {
                if rank(&err) > rank(&prev) {
                    err
                } else {
                    prev
                }
            }
        });
    }

    Err(worst.unwrap_or(DeliveryError::NotFound))
}

fn rank(err: &DeliveryError) -> u8 {
    match err {
        DeliveryError::NotFound => 0,
        DeliveryError::Unreachable(_) => 1,
        DeliveryError::Undefined(_) => 2,
        DeliveryError::Backpressure => 3,
    }
}

#[async_trait]
impl Delivery for ClusterDelivery {
    async fn deliver(&self, target: DeliveryTarget, message: SessionMessage) -> Result<(), DeliveryError> {
        match target {
            DeliveryTarget::Connection(id) => self.deliver_to_connection(id, message).await,
            DeliveryTarget::User(user_name) => self.deliver_to_user(&user_name, message).await,
        }
    }
}
