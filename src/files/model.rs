use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::events::proto;

// ============================================================================
// File Descriptor Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Pending,
    Uploaded,
    Failed,
    Deleted,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "PENDING",
            FileState::Uploaded => "UPLOADED",
            FileState::Failed => "FAILED",
            FileState::Deleted => "DELETED",
        }
    }

    /// PENDING ends in UPLOADED or FAILED. Nothing drives DELETED yet.
    pub fn can_transition_to(self, next: FileState) -> bool {
        matches!(
            (self, next),
            (FileState::Pending, FileState::Uploaded) | (FileState::Pending, FileState::Failed)
        )
    }

    pub fn to_proto(self) -> proto::FileState {
        match self {
            FileState::Pending => proto::FileState::Pending,
            FileState::Uploaded => proto::FileState::Uploaded,
            FileState::Failed => proto::FileState::Failed,
            FileState::Deleted => proto::FileState::Deleted,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FileState::Pending),
            "UPLOADED" => Ok(FileState::Uploaded),
            "FAILED" => Ok(FileState::Failed),
            "DELETED" => Ok(FileState::Deleted),
            other => Err(format!("unknown file state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub file_name: String,
    pub content_type: String,
    pub attributes: HashMap<String, String>,
}

impl NewFile {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// A persisted file descriptor; every mutation advances `version` by one
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub state: FileState,
    pub version: i64,
    pub file_name: String,
    pub content_type: String,
    pub attributes: HashMap<String, String>,
}

impl FileRecord {
    pub fn to_proto(&self) -> proto::FileDescriptor {
        proto::FileDescriptor {
            id: self.id,
            state: self.state.to_proto() as i32,
            version: self.version,
            file_name: self.file_name.clone(),
            content_type: self.content_type.clone(),
            attributes: self.attributes.clone(),
        }
    }
}
