pub mod codec;
pub mod outbox;
pub mod proto;

pub use codec::{short_name, topic_for, DecodeError, DomainEvent, EventKind, EventRegistry};
pub use outbox::{OutboxRecord, OutboxWriter};
