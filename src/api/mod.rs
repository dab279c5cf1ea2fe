pub mod client;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use client::ApiClient;

pub const DEFAULT_API_BASE: &str = "http://localhost:8007";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
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
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat/` and `POST /api/chat/query`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatQuery {
    pub query: String,
    pub document_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryResponse {
    pub response: String,
}

/// One row of remote chat history as posted by the client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub role: Role,
    pub content: String,
    pub session_id: String,
    pub document_filter_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DocumentInfo {
    pub id: i64,
    pub filename: String,
    pub status: String,
    pub file_size: Option<i64>,
    pub created_at: Option<String>,
}

impl DocumentInfo {
    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DocumentList {
    pub documents: Vec<DocumentInfo>,
}

/// Raw response body of the streaming chat endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, ApiError>>;

/// The slice of the backend the chat core talks to.
///
/// `ApiClient` is the HTTP implementation; tests substitute scripted fakes.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open the chunked answer stream for one query. Non-2xx is an error.
    async fn open_chat_stream(&self, query: &ChatQuery) -> Result<ByteStream, ApiError>;

    async fn fetch_history(&self, token: &str) -> Result<Vec<Message>, ApiError>;

    async fn append_history(&self, token: &str, record: &HistoryRecord) -> Result<(), ApiError>;

    async fn clear_history(&self, token: &str) -> Result<(), ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::Parse(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let parsed = serde_json::from_str::<Message>(r#"{"role":"system","content":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_chat_query_sends_null_document() {
        let body = ChatQuery {
            query: "What is this?".into(),
            document_id: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["document_id"], serde_json::Value::Null);
    }

    #[test]
    fn test_token_pair_default_type() {
        let pair: TokenPair =
            serde_json::from_str(r#"{"access_token":"a","refresh_token":"r"}"#).unwrap();
        assert_eq!(pair.token_type, "bearer");
    }
}
