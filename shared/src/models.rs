//! Shared data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::discovery::ImportDocumentsMetadata;

/// Longest chat message accepted from a client, in characters.
pub const MAX_MESSAGE_CHARS: u64 = 8000;

/// Who said something in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Role name the Gemini API expects.
    pub fn api_role(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "model",
        }
    }
}

/// One message in a chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Set on assistant turns that stand in for a failed model call
    #[serde(default)]
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), false)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into(), false)
    }

    pub fn fallback(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into(), true)
    }

    fn new(role: Role, content: String, failed: bool) -> Self {
        Self {
            role,
            content,
            failed,
            created_at: Utc::now(),
        }
    }
}

/// Acknowledgement returned once an import has been submitted.
#[derive(Debug, Serialize)]
pub struct ImportAck {
    pub operation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImportDocumentsMetadata>,
}

/// Chat request payload.
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(max = MAX_MESSAGE_CHARS))]
    pub message: String,
}

/// Chat response payload.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// `None` when the message was blank and nothing was sent
    pub reply: Option<Turn>,
    pub turns: Vec<Turn>,
}

/// Transcript of the caller's session.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub turns: Vec<Turn>,
}
