//! Realtime channel with state management and auto-reconnect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use inbox_shared::{ClientCommand, ServerEvent, WsEnvelope};
use tokio::sync::{mpsc, oneshot, watch};

use super::{
    ChannelError, ChannelEvent, ConnectionState, Connector, FrameSink, FrameStream,
    ReconnectConfig,
};
use crate::lock;

type UrlBuilder = Arc<dyn Fn() -> Option<String> + Send + Sync>;
type Handshake = Arc<dyn Fn() -> Vec<ClientCommand> + Send + Sync>;
type EventHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Handle for sending commands through a channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    sender: mpsc::UnboundedSender<ClientCommand>,
}

impl ChannelHandle {
    /// Queue a command; it is written once a link is up.
    pub fn send(&self, cmd: ClientCommand) -> Result<(), ChannelError> {
        self.sender.send(cmd).map_err(|_| ChannelError::Closed)
    }
}

/// A persistent channel to the realtime endpoint.
///
/// Opening spawns a tokio task that connects, runs the handshake, forwards
/// server events and reconnects with backoff until [`close`](Self::close) is
/// called or the channel is dropped.
pub struct RealtimeChannel {
    handle: ChannelHandle,
    state: watch::Receiver<ConnectionState>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RealtimeChannel {
    /// Start the connection loop.
    ///
    /// `url_builder` is called before every attempt so reconnects pick up a
    /// refreshed token; returning `None` closes the channel. `handshake`
    /// produces the commands written first on every new link.
    pub fn open(
        connector: Arc<dyn Connector>,
        reconnect: ReconnectConfig,
        url_builder: impl Fn() -> Option<String> + Send + Sync + 'static,
        handshake: impl Fn() -> Vec<ClientCommand> + Send + Sync + 'static,
        on_event: impl Fn(ChannelEvent) + Send + Sync + 'static,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = ConnectionTask {
            connector,
            reconnect,
            url_builder: Arc::new(url_builder),
            handshake: Arc::new(handshake),
            on_event: Arc::new(on_event),
            state: state_tx,
        };
        tokio::spawn(task.run(receiver, shutdown_rx));

        Self {
            handle: ChannelHandle { sender },
            state: state_rx,
            shutdown: Mutex::new(Some(shutdown_tx)),
        }
    }

    /// Get a handle for sending commands
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    pub fn send(&self, cmd: ClientCommand) -> Result<(), ChannelError> {
        self.handle.send(cmd)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait until a link is up. Returns `false` on timeout or once closed.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let result = tokio::time::timeout(timeout, state.wait_for(ConnectionState::is_connected)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Stop reconnecting and drop the current link. Idempotent.
    pub fn close(&self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct ConnectionTask {
    connector: Arc<dyn Connector>,
    reconnect: ReconnectConfig,
    url_builder: UrlBuilder,
    handshake: Handshake,
    on_event: EventHandler,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionTask {
    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state.clone());
        (self.on_event)(ChannelEvent::State(state));
    }

    async fn run(
        self,
        mut outgoing: mpsc::UnboundedReceiver<ClientCommand>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut attempt = 0u32;
        let mut ever_connected = false;

        loop {
            let Some(url) = (self.url_builder)() else {
                crate::log_info!("No credentials for realtime channel, closing");
                break;
            };

            if attempt == 0 {
                self.set_state(ConnectionState::Connecting);
            }

            let connected = tokio::select! {
                result = self.connector.connect(&url) => result,
                _ = &mut shutdown => break,
            };

            match connected {
                Ok((mut sink, mut stream)) => {
                    if let Err(e) = self.write_handshake(&mut sink).await {
                        crate::log_warn!("Realtime handshake failed: {}", e);
                    } else {
                        attempt = 0;
                        self.set_state(ConnectionState::Connected);
                        (self.on_event)(ChannelEvent::Opened {
                            resumed: ever_connected,
                        });
                        ever_connected = true;

                        let shutdown_requested = self
                            .pump(&mut sink, &mut stream, &mut outgoing, &mut shutdown)
                            .await;
                        let _ = sink.close().await;
                        if shutdown_requested {
                            break;
                        }
                        crate::log_warn!("Realtime channel disconnected");
                    }
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e) => {
                    crate::log_warn!("Realtime connect failed: {}", e);
                }
            }

            if self.reconnect.gives_up_after(attempt) {
                crate::log_error!(
                    "Giving up on realtime channel after {} attempts",
                    attempt
                );
                break;
            }

            let delay = self.reconnect.jittered_delay(attempt);
            attempt += 1;
            self.set_state(ConnectionState::Reconnecting {
                attempt,
                next_retry_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            crate::log_info!(
                "Reconnecting in {:.1}s (attempt {})",
                delay.as_secs_f32(),
                attempt
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    crate::log_info!("Channel closed during reconnect backoff");
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Closed);
    }

    async fn write_handshake(&self, sink: &mut FrameSink) -> Result<(), ChannelError> {
        for cmd in (self.handshake)() {
            write_command(sink, cmd).await?;
        }
        Ok(())
    }

    /// Move frames until the link drops. Returns true when the owner asked to close.
    async fn pump(
        &self,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
        outgoing: &mut mpsc::UnboundedReceiver<ClientCommand>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => match serde_json::from_str::<WsEnvelope<ServerEvent>>(&text) {
                        Ok(envelope) => (self.on_event)(ChannelEvent::Frame(envelope.payload)),
                        Err(e) => crate::log_warn!("Skipping unparseable frame: {}", e),
                    },
                    Some(Err(e)) => {
                        crate::log_warn!("Realtime read error: {}", e);
                        return false;
                    }
                    None => return false,
                },
                cmd = outgoing.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = write_command(sink, cmd).await {
                            crate::log_error!("Send failed: {}", e);
                            return false;
                        }
                    }
                    // Every handle is gone; nobody can talk to this channel anymore
                    None => return true,
                },
                _ = &mut *shutdown => return true,
            }
        }
    }
}

async fn write_command(sink: &mut FrameSink, cmd: ClientCommand) -> Result<(), ChannelError> {
    let json = serde_json::to_string(&WsEnvelope::new(cmd))
        .map_err(|e| ChannelError::SendFailed(format!("serialize failed: {e}")))?;
    crate::log_debug!("Sending frame: {}", json);
    sink.send(json).await
}
