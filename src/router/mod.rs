// Cross-node delivery over gRPC
mod client;
pub mod proto;
mod service;

pub use client::{ClusterDelivery, RouterClient};
pub use proto::message_router_server::MessageRouterServer;
pub use service::RouterService;
