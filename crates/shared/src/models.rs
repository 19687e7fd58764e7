//! Shared data models for the inbox feed protocol.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::InboxError;
use crate::protocol::jwt_expiry;

// --- Identity ---

/// Opaque bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(<{} bytes>)", self.0.len())
    }
}

impl From<&str> for AuthToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AuthToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_url: Option<String>,
}

/// The signed-in principal. At most one is active per client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub token: AuthToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub endpoints: EndpointOverrides,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, token: impl Into<AuthToken>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            tenant_id: None,
            endpoints: EndpointOverrides::default(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: EndpointOverrides) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Same user, tenant and endpoints; the token may differ.
    pub fn same_principal(&self, other: &Identity) -> bool {
        self.user_id == other.user_id
            && self.tenant_id == other.tenant_id
            && self.endpoints == other.endpoints
    }

    /// Reject identities that cannot open a session.
    ///
    /// JWT-shaped tokens are inspected for an `exp` claim; opaque tokens pass
    /// as long as they are non-empty.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), InboxError> {
        if self.user_id.trim().is_empty() {
            return Err(InboxError::InvalidIdentity("missing user id".to_string()));
        }
        validate_token(&self.token, now)
    }
}

pub fn validate_token(token: &AuthToken, now: DateTime<Utc>) -> Result<(), InboxError> {
    if token.is_empty() {
        return Err(InboxError::InvalidIdentity("missing auth token".to_string()));
    }
    if let Some(exp) = jwt_expiry(token.as_str()) {
        if exp <= now {
            return Err(InboxError::InvalidIdentity(format!(
                "auth token expired at {exp}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthCause {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// One authentication state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub identity: Option<Identity>,
    pub cause: AuthCause,
}

// --- Feeds ---

/// Partition of the message store.
///
/// Serialized as a plain tag: `inbox`, `archive`, `snoozed`, or
/// `custom:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FeedType {
    Inbox,
    Archive,
    Snoozed,
    Custom(String),
}

impl FeedType {
    pub fn custom(name: impl Into<String>) -> Self {
        FeedType::Custom(name.into())
    }

    pub fn tag(&self) -> String {
        match self {
            FeedType::Inbox => "inbox".to_string(),
            FeedType::Archive => "archive".to_string(),
            FeedType::Snoozed => "snoozed".to_string(),
            FeedType::Custom(name) => format!("custom:{name}"),
        }
    }

    /// Feed a message belongs in once its archive state is known.
    ///
    /// Only the inbox/archive pair is re-filed; other partitions keep what
    /// they were given.
    pub fn refile(&self, message: &Message) -> FeedType {
        match (self, message.is_archived()) {
            (FeedType::Inbox, true) => FeedType::Archive,
            (FeedType::Archive, false) => FeedType::Inbox,
            (other, _) => other.clone(),
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl From<String> for FeedType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "inbox" => FeedType::Inbox,
            "archive" => FeedType::Archive,
            "snoozed" => FeedType::Snoozed,
            other => FeedType::Custom(other.strip_prefix("custom:").unwrap_or(other).to_string()),
        }
    }
}

impl From<FeedType> for String {
    fn from(feed: FeedType) -> Self {
        feed.tag()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub feed_type: FeedType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Feed order: newest first, ties broken by ascending id.
    pub fn feed_order(a: &Message, b: &Message) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }

    pub fn apply_patch(&mut self, patch: &MessagePatch) {
        if let Some(read_at) = patch.read_at {
            self.read_at = read_at;
        }
        if let Some(archived_at) = patch.archived_at {
            self.archived_at = archived_at;
        }
        if let Some(payload) = &patch.payload {
            self.payload = payload.clone();
        }
    }
}

/// Partial update pushed by the server.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_at: Option<Option<DateTime<Utc>>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub archived_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// One page as returned by the backend, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub feed: FeedType,
    pub cursor: Option<String>,
    pub limit: u32,
}

// --- Mutations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    MarkRead,
    MarkUnread,
    Archive,
    Unarchive,
}

impl MutationKind {
    /// Action segment of `POST /inbox/messages/{id}/{action}`.
    pub fn action(&self) -> &'static str {
        match self {
            MutationKind::MarkRead => "read",
            MutationKind::MarkUnread => "unread",
            MutationKind::Archive => "archive",
            MutationKind::Unarchive => "unarchive",
        }
    }

    /// True when the message already reflects this mutation.
    pub fn is_satisfied_by(&self, message: &Message) -> bool {
        match self {
            MutationKind::MarkRead => message.is_read(),
            MutationKind::MarkUnread => !message.is_read(),
            MutationKind::Archive => message.is_archived(),
            MutationKind::Unarchive => !message.is_archived(),
        }
    }

    pub fn apply(&self, message: &mut Message, now: DateTime<Utc>) {
        match self {
            MutationKind::MarkRead => message.read_at = Some(now),
            MutationKind::MarkUnread => message.read_at = None,
            MutationKind::Archive => message.archived_at = Some(now),
            MutationKind::Unarchive => message.archived_at = None,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

// --- Device tokens ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenProvider {
    Apn,
    FirebaseFcm,
    Expo,
    OneSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserToken {
    pub token: String,
    pub provider: TokenProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceMetadata>,
}

// --- Realtime ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    Subscribe {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
    },
    Reauthenticate {
        token: AuthToken,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "message.created")]
    MessageCreated { message: Message },
    #[serde(rename = "message.updated")]
    MessageUpdated { id: String, patch: MessagePatch },
    #[serde(rename = "message.removed")]
    MessageRemoved { id: String },
    #[serde(rename = "unread.snapshot")]
    UnreadCountSnapshot {
        #[serde(default = "default_snapshot_feed")]
        feed: FeedType,
        count: u64,
    },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(default)]
        correlation_id: Option<String>,
    },
}

fn default_snapshot_feed() -> FeedType {
    FeedType::Inbox
}
