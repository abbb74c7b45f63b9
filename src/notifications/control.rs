use serde::{Deserialize, Serialize};

// ============================================================================
// Client-facing JSON messages
// ============================================================================

/// Inbound control message sent by a client over its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { canvas_id: i64 },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { canvas_id: i64 },
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Outbound push sent to subscribed sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushMessage {
    #[serde(rename_all = "camelCase")]
    FileUploaded {
        canvas_id: i64,
        file_id: i64,
        file_name: String,
        content_type: String,
    },
}

impl PushMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
