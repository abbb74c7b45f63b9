use async_trait::async_trait;

use crate::gateway::SessionMessage;

// ============================================================================
// Delivery seam
// ============================================================================
//
// Implemented by the node-local registry (local contexts only) and by the
// cluster-aware delivery that resolves a connection's owning node first.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    Connection(i64),
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("target not found")]
    NotFound,

    #[error("outbound queue full")]
    Backpressure,

    #[error("owning node unreachable: {0}")]
    Unreachable(String),

    #[error("delivery outcome undefined: {0}")]
    Undefined(String),
}

impl DeliveryError {
    /// The target is gone or cannot be reached; its subscriptions are stale
    pub fn is_stale_target(&self) -> bool {
        matches!(self, DeliveryError::NotFound | DeliveryError::Unreachable(_))
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryError::NotFound => "not_found",
            DeliveryError::Backpressure => "backpressure",
            DeliveryError::Unreachable(_) => "unreachable",
            DeliveryError::Undefined(_) => "undefined",
        }
    }
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, target: DeliveryTarget, message: SessionMessage) -> Result<(), DeliveryError>;
}
