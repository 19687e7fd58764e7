//! Inbox Client - session and realtime feed synchronization engine
//!
//! Keeps an authenticated session, a persistent realtime channel and a set of
//! paginated message feeds in sync with the inbox backend, and publishes every
//! change to topic listeners.

pub mod api_client;
pub mod client;
pub mod config;
pub mod feed;
pub mod global;
pub mod listeners;
pub mod logging;
pub mod mutations;
pub mod session;
pub mod storage;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

pub use api_client::{ApiClient, InboxBackend};
pub use client::InboxClient;
pub use config::ClientConfig;
pub use feed::{FeedSnapshot, FeedState, FeedStore};
pub use listeners::{InboxEvent, ListenerRegistry, Subscription, Topic};
pub use mutations::{MutationField, MutationQueue, PendingMutation};
pub use session::{SessionGate, SessionManager, SessionObserver, SessionTicket, SignInOutcome};
pub use storage::SessionStorage;
pub use transport::{
    ChannelError, ChannelEvent, ConnectionState, Connector, FrameSink, FrameStream,
    RealtimeChannel, ReconnectConfig, WebSocketConnector,
};

pub use inbox_shared as shared;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
