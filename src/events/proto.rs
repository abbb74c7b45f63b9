use std::collections::HashMap;
use std::time::SystemTime;

// ============================================================================
// Event wire types
// ============================================================================
//
// Protobuf messages carried as outbox payloads and broker message bodies.
// Declared by hand with prost derives; field tags are part of the wire
// contract and must never be renumbered.
//
// ============================================================================

pub const SUBJECT_FILE_DESCRIPTOR: &str = "file-descriptor";
pub const SUBJECT_CONNECTION: &str = "connection";
pub const SUBJECT_CLIENT_MESSAGE: &str = "client-message";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Subject {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(message, optional, tag = "2")]
    pub subject: Option<Subject>,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
}

impl Header {
    /// Fresh header stamped with a new event id and the current time
    pub fn new(subject_type: &str, subject_id: impl ToString) -> Self {
        Self {
            event_id: uuid::Uuid::now_v7().to_string(),
            subject: Some(Subject {
                r#type: subject_type.to_string(),
                id: subject_id.to_string(),
            }),
            timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ChangeType {
    Unspecified = 0,
    Created = 1,
    Updated = 2,
    Deleted = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FileState {
    Unspecified = 0,
    Pending = 1,
    Uploaded = 2,
    Failed = 3,
    Deleted = 4,
}

// ============================================================================
// File descriptors
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct FileDescriptor {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(enumeration = "FileState", tag = "2")]
    pub state: i32,
    #[prost(int64, tag = "3")]
    pub version: i64,
    #[prost(string, tag = "4")]
    pub file_name: String,
    #[prost(string, tag = "5")]
    pub content_type: String,
    #[prost(map = "string, string", tag = "6")]
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FileDescriptorChangedEvent {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(enumeration = "ChangeType", tag = "2")]
    pub change_type: i32,
    #[prost(message, optional, tag = "3")]
    pub old_value: Option<FileDescriptor>,
    #[prost(message, optional, tag = "4")]
    pub new_value: Option<FileDescriptor>,
}

impl FileDescriptorChangedEvent {
    pub fn created(descriptor: FileDescriptor) -> Self {
        Self {
            header: Some(Header::new(SUBJECT_FILE_DESCRIPTOR, descriptor.id)),
            change_type: ChangeType::Created as i32,
            old_value: None,
            new_value: Some(descriptor),
        }
    }

    pub fn updated(old: FileDescriptor, new: FileDescriptor) -> Self {
        Self {
            header: Some(Header::new(SUBJECT_FILE_DESCRIPTOR, new.id)),
            change_type: ChangeType::Updated as i32,
            old_value: Some(old),
            new_value: Some(new),
        }
    }
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct Connection {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(string, tag = "3")]
    pub user_name: String,
    #[prost(string, tag = "4")]
    pub host: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionChangedEvent {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(enumeration = "ChangeType", tag = "2")]
    pub change_type: i32,
    #[prost(message, optional, tag = "3")]
    pub old_value: Option<Connection>,
    #[prost(message, optional, tag = "4")]
    pub new_value: Option<Connection>,
}

impl ConnectionChangedEvent {
    pub fn created(connection: Connection) -> Self {
        Self {
            header: Some(Header::new(SUBJECT_CONNECTION, connection.id)),
            change_type: ChangeType::Created as i32,
            old_value: None,
            new_value: Some(connection),
        }
    }

    pub fn deleted(connection: Connection) -> Self {
        Self {
            header: Some(Header::new(SUBJECT_CONNECTION, connection.id)),
            change_type: ChangeType::Deleted as i32,
            old_value: Some(connection),
            new_value: None,
        }
    }

    /// The connection this event is about, whichever side carries it
    pub fn connection(&self) -> Option<&Connection> {
        self.new_value.as_ref().or(self.old_value.as_ref())
    }
}

// ============================================================================
// Inbound client messages
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientMessageReceivedEvent {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(message, optional, tag = "2")]
    pub connection: Option<Connection>,
    #[prost(oneof = "client_message_received_event::Message", tags = "3")]
    pub message: Option<client_message_received_event::Message>,
}

pub mod client_message_received_event {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(string, tag = "3")]
        Text(String),
    }
}

impl ClientMessageReceivedEvent {
    pub fn text(connection: Connection, text: impl Into<String>) -> Self {
        Self {
            header: Some(Header::new(SUBJECT_CLIENT_MESSAGE, connection.id)),
            connection: Some(connection),
            message: Some(client_message_received_event::Message::Text(text.into())),
        }
    }

    pub fn text_payload(&self) -> Option<&str> {
        match &self.message {
            Some(client_message_received_event::Message::Text(text)) => Some(text),
            None => None,
        }
    }
}
