//! Shared error types including RFC7807 Problem Details.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{FeedType, MutationKind};

/// RFC7807 Problem Details (application/problem+json)
///
/// The backend answers failed `/inbox/*` calls with this envelope; the client
/// only reads it to produce a readable message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type", default)]
    pub type_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// Transport-level failure of a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// Whether repeating the same read could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout => true,
            ApiError::Http { status, .. } => *status == 429 || *status >= 500,
            ApiError::Deserialize(_) => false,
        }
    }

    pub fn problem_detail(&self) -> Option<String> {
        match self {
            ApiError::Http { body, .. } => try_problem_detail(body),
            _ => None,
        }
    }
}

/// Errors surfaced by the inbox engine, either returned or published on the
/// error topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InboxError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("no active session")]
    NotSignedIn,
    #[error("realtime channel disconnected: {0}")]
    ChannelDisconnected(String),
    #[error("response belongs to a superseded request")]
    StaleResponse,
    #[error("{kind} failed for message {message_id}: {source}")]
    MutationFailed {
        message_id: String,
        kind: MutationKind,
        #[source]
        source: ApiError,
    },
    #[error("mark all read failed for {feed}: {source}")]
    MarkAllReadFailed {
        feed: FeedType,
        #[source]
        source: ApiError,
    },
    #[error("loading {feed} failed: {source}")]
    PageLoadFailed {
        feed: FeedType,
        #[source]
        source: ApiError,
    },
    #[error("message {0} is not loaded")]
    MessageNotFound(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}
