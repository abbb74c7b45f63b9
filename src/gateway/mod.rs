pub mod registry;
pub mod repository;
pub mod session;

pub use registry::ConnectionRegistry;
pub use repository::{ConnectionRecord, ConnectionRepository};
pub use session::{Handshake, SessionError, SessionGateway, TransportError};

/// A frame on the client-facing session transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}
