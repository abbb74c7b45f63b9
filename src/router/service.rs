use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::{Request, Response, Status};

use super::proto::message_router_server::MessageRouter;
use super::proto::{deliver_request, message_payload, DeliverRequest, DeliverResponse, ErrorCode};
use crate::delivery::{Delivery, DeliveryError, DeliveryTarget};
use crate::gateway::{ConnectionRegistry, SessionMessage};
use crate::metrics::Metrics;

// ============================================================================
// Router Service
// ============================================================================
//
// Receiving side of cross-node delivery. Every outcome travels back in the
// response body: NOT_FOUND when this node holds no matching session, UNDEFINED
// for everything else that went wrong (full queue, bad request, timeout).
//
// ============================================================================

pub struct RouterService {
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl RouterService {
    pub fn new(registry: Arc<ConnectionRegistry>, timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            timeout,
            metrics,
        }
    }

    async fn handle(&self, request: DeliverRequest) -> DeliverResponse {
        let target = match request.target {
            Some(deliver_request::Target::ConnectionId(id)) => DeliveryTarget::Connection(id),
            Some(deliver_request::Target::UserName(user_name)) => DeliveryTarget::User(user_name),
            None => return DeliverResponse::failure(ErrorCode::Undefined, "request has no target"),
        };

        let message = match request.message.and_then(|m| m.content) {
            Some(message_payload::Content::Text(text)) => SessionMessage::Text(text),
            None => return DeliverResponse::failure(ErrorCode::Undefined, "request has no message"),
        };

        match tokio::time::timeout(self.timeout, self.registry.deliver(target.clone(), message)).await {
            Ok(Ok(())) => DeliverResponse::success(),
            Ok(Err(DeliveryError::NotFound)) => {
                DeliverResponse::failure(ErrorCode::NotFound, format!("{:?} not found on this node", target))
            }
            Ok(Err(e)) => DeliverResponse::failure(ErrorCode::Undefined, e.to_string()),
            Err(_) => DeliverResponse::failure(ErrorCode::Undefined, "local delivery timed out"),
        }
    }
}

#[async_trait]
impl MessageRouter for RouterService {
    async fn deliver(&self, request: Request<DeliverRequest>) -> Result<Response<DeliverResponse>, Status> {
        let response = self.handle(request.into_inner()).await;

        let outcome = match &response.outcome {
            Some(super::proto::deliver_response::Outcome::Success(_)) => "success",
            Some(super::proto::deliver_response::Outcome::Error(failure)) => match failure.code() {
                ErrorCode::NotFound => "not_found",
                _ => "undefined",
            },
            None => "undefined",
        };
        self.metrics.record_rpc(outcome);
        tracing::debug!(outcome, "Handled routed delivery");

        Ok(Response::new(response))
    }
}
