use std::collections::HashMap;

use prost::Message;

use super::proto::{
    ClientMessageReceivedEvent, ConnectionChangedEvent, FileDescriptorChangedEvent, Header,
};

// ============================================================================
// Event Envelope Codec
// ============================================================================
//
// `DomainEvent` is the closed set of event kinds this service writes and
// understands. Decoding goes through an `EventRegistry` populated at startup
// that maps the payload type name carried next to every payload to a decode
// function. A type name that is absent or not registered is `UnknownType`,
// which consumers treat as "not for me" rather than a failure.
//
// ============================================================================

pub const FILE_DESCRIPTOR_CHANGED: &str = "canvas.events.FileDescriptorChangedEvent";
pub const CONNECTION_CHANGED: &str = "canvas.events.ConnectionChangedEvent";
pub const CLIENT_MESSAGE_RECEIVED: &str = "canvas.events.ClientMessageReceivedEvent";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event type {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownType(Option<String>),

    #[error("malformed {type_name} payload: {source}")]
    Malformed {
        type_name: String,
        #[source]
        source: prost::DecodeError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    FileChanged(FileDescriptorChangedEvent),
    ConnectionChanged(ConnectionChangedEvent),
    ClientMessageReceived(ClientMessageReceivedEvent),
}

impl DomainEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::FileChanged(_) => FILE_DESCRIPTOR_CHANGED,
            DomainEvent::ConnectionChanged(_) => CONNECTION_CHANGED,
            DomainEvent::ClientMessageReceived(_) => CLIENT_MESSAGE_RECEIVED,
        }
    }

    /// Unqualified event name, used as the outbox `type` column and topic suffix
    pub fn event_name(&self) -> &'static str {
        short_name(self.type_name())
    }

    pub fn header(&self) -> Option<&Header> {
        match self {
            DomainEvent::FileChanged(e) => e.header.as_ref(),
            DomainEvent::ConnectionChanged(e) => e.header.as_ref(),
            DomainEvent::ClientMessageReceived(e) => e.header.as_ref(),
        }
    }

    pub fn encode(&self) -> (Vec<u8>, &'static str) {
        let bytes = match self {
            DomainEvent::FileChanged(e) => e.encode_to_vec(),
            DomainEvent::ConnectionChanged(e) => e.encode_to_vec(),
            DomainEvent::ClientMessageReceived(e) => e.encode_to_vec(),
        };
        (bytes, self.type_name())
    }
}

/// A protobuf message that is one of the `DomainEvent` kinds
pub trait EventKind: Message + Default + Into<DomainEvent> {
    const TYPE_NAME: &'static str;
}

impl EventKind for FileDescriptorChangedEvent {
    const TYPE_NAME: &'static str = FILE_DESCRIPTOR_CHANGED;
}

impl EventKind for ConnectionChangedEvent {
    const TYPE_NAME: &'static str = CONNECTION_CHANGED;
}

impl EventKind for ClientMessageReceivedEvent {
    const TYPE_NAME: &'static str = CLIENT_MESSAGE_RECEIVED;
}

impl From<FileDescriptorChangedEvent> for DomainEvent {
    fn from(event: FileDescriptorChangedEvent) -> Self {
        DomainEvent::FileChanged(event)
    }
}

impl From<ConnectionChangedEvent> for DomainEvent {
    fn from(event: ConnectionChangedEvent) -> Self {
        DomainEvent::ConnectionChanged(event)
    }
}

impl From<ClientMessageReceivedEvent> for DomainEvent {
    fn from(event: ClientMessageReceivedEvent) -> Self {
        DomainEvent::ClientMessageReceived(event)
    }
}

type DecodeFn = fn(&[u8]) -> Result<DomainEvent, prost::DecodeError>;

fn decode_as<M: EventKind>(bytes: &[u8]) -> Result<DomainEvent, prost::DecodeError> {
    M::decode(bytes).map(Into::into)
}

#[derive(Clone, Default)]
pub struct EventRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind this service knows about
    pub fn with_domain_events() -> Self {
        let mut registry = Self::new();
        registry.register::<FileDescriptorChangedEvent>();
        registry.register::<ConnectionChangedEvent>();
        registry.register::<ClientMessageReceivedEvent>();
        registry
    }

    pub fn register<M: EventKind>(&mut self) {
        self.decoders.insert(M::TYPE_NAME, decode_as::<M>);
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    pub fn decode(&self, bytes: &[u8], type_name: Option<&str>) -> Result<DomainEvent, DecodeError> {
        let type_name = type_name.ok_or(DecodeError::UnknownType(None))?;
        let decoder = self
            .decoders
            .get(type_name)
            .ok_or_else(|| DecodeError::UnknownType(Some(type_name.to_string())))?;

        decoder(bytes).map_err(|source| DecodeError::Malformed {
            type_name: type_name.to_string(),
            source,
        })
    }
}

/// `canvas.events.FileDescriptorChangedEvent` -> `FileDescriptorChangedEvent`
pub fn short_name(type_name: &str) -> &str {
    type_name.rsplit('.').next().unwrap_or(type_name)
}

/// Broker topic for an event name: `{namespace}.{EventName}`
pub fn topic_for(namespace: &str, event_name: &str) -> String {
    format!("{}.{}", namespace, short_name(event_name))
}
