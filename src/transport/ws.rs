use futures::future::{self, BoxFuture};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use super::{Channel, Connector, SessionAddress, TransportError};
use crate::protocol::Frame;

/// Opens session channels as WebSockets against the relay.
///
/// Ping/pong is answered by tungstenite itself; close frames end the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, address: SessionAddress) -> BoxFuture<'static, Result<Channel, TransportError>> {
        let url = address.channel_url();
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            tracing::info!(url = %url, "relay channel connected");

            let (ws_tx, ws_rx) = ws.split();
            let sink = ws_tx
                .sink_map_err(|e| TransportError::Io(e.to_string()))
                .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame))));
            let stream = ws_rx.filter_map(|msg| future::ready(from_message(msg)));

            Ok(Channel {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.to_vec().into()),
    }
}

fn from_message(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(bytes::Bytes::from(data.to_vec())))),
        // Ping/Pong handled by tungstenite; Close is followed by end of stream.
        Ok(_) => None,
        Err(e) => Some(Err(TransportError::Io(e.to_string()))),
    }
}
