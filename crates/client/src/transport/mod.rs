//! Realtime transport: a persistent duplex channel with automatic reconnect.
//!
//! # Architecture
//!
//! ```text
//! RealtimeChannel (one per session)
//!     ├── connection task (tokio)
//!     │     ├── Connector::connect(url)  ── WebSocketConnector in production
//!     │     ├── handshake commands       ── subscribe for the identity
//!     │     ├── read loop  → ChannelEvent::Frame
//!     │     └── write loop ← ChannelHandle::send
//!     └── Reconnection (exponential backoff with jitter, until closed)
//! ```
//!
//! The channel never decides what a reconnect means for cached data; it
//! reports `ChannelEvent::Opened { resumed: true }` and the owner resyncs.

mod channel;
mod websocket;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use inbox_shared::ServerEvent;
use rand::Rng;

pub use channel::{ChannelHandle, RealtimeChannel};
pub use websocket::WebSocketConnector;

/// Connection state for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting before the next attempt after a disconnect.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
        /// Milliseconds until next retry.
        next_retry_ms: u64,
    },
    /// Closed by its owner; never reconnects.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Upper bound of the random delay added to each wait
    pub max_jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            max_jitter_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        if delay.is_finite() && delay < self.max_delay_ms as f64 {
            delay as u64
        } else {
            self.max_delay_ms
        }
    }

    /// Backoff delay plus random jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        Duration::from_millis(self.delay_for_attempt(attempt) + jitter)
    }

    pub fn gives_up_after(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Failed to establish connection.
    ConnectionFailed(String),
    /// Failed to send a frame.
    SendFailed(String),
    /// Peer violated the framing protocol.
    Protocol(String),
    /// Channel was closed.
    Closed,
    /// Operation timed out.
    Timeout,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Closed => write!(f, "Channel closed"),
            Self::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Outgoing half of a connected link, carrying text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;
/// Incoming half of a connected link, carrying text frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Opens one duplex text link.
///
/// Production uses [`WebSocketConnector`]; tests substitute in-memory links.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ChannelError>;
}

/// What the channel reports to its owner.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    State(ConnectionState),
    /// A link was established. `resumed` is true when an earlier link of the
    /// same channel was lost, meaning pushes may have been missed.
    Opened { resumed: bool },
    Frame(ServerEvent),
}
