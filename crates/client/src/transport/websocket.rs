//! WebSocket connector using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ChannelError, Connector, FrameSink, FrameStream};

/// Opens `ws://` / `wss://` links.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ChannelError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| ChannelError::SendFailed(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, ChannelError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    crate::log_debug!("received close frame: {:?}", frame);
                    Some(Err(ChannelError::Closed))
                }
                // Pong is handled automatically by tungstenite; binary frames are not part of the protocol
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Protocol(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
