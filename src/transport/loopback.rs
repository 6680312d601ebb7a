//! In-process connector.
//!
//! [`LoopbackConnector::new`] returns the connector together with a
//! [`LoopbackAcceptor`]. Each connection attempt shows up on the acceptor as a
//! [`PendingConnection`] that can be accepted (yielding the relay-side
//! [`LoopbackPeer`]) or rejected, which makes it possible to drive every
//! transport state deterministically.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Channel, Connector, SessionAddress, TransportError};
use crate::protocol::Frame;

pub struct LoopbackConnector {
    pending_tx: mpsc::UnboundedSender<PendingConnection>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, LoopbackAcceptor) {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        (Self { pending_tx }, LoopbackAcceptor { pending_rx })
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, address: SessionAddress) -> BoxFuture<'static, Result<Channel, TransportError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = self
            .pending_tx
            .send(PendingConnection {
                address,
                reply: reply_tx,
            })
            .is_ok();
        Box::pin(async move {
            if !queued {
                return Err(TransportError::Connect("no listener".into()));
            }
            reply_rx
                .await
                .map_err(|_| TransportError::Connect("listener went away".into()))?
        })
    }
}

/// Relay side of a [`LoopbackConnector`].
pub struct LoopbackAcceptor {
    pending_rx: mpsc::UnboundedReceiver<PendingConnection>,
}

impl LoopbackAcceptor {
    /// Wait for the next connection attempt.
    pub async fn accept(&mut self) -> Option<PendingConnection> {
        self.pending_rx.recv().await
    }

    /// Take a connection attempt if one is already queued.
    pub fn try_accept(&mut self) -> Option<PendingConnection> {
        self.pending_rx.try_recv().ok()
    }
}

/// A connection attempt waiting for the relay's verdict.
pub struct PendingConnection {
    pub address: SessionAddress,
    reply: oneshot::Sender<Result<Channel, TransportError>>,
}

impl PendingConnection {
    /// Complete the handshake. If the client already gave up, the returned
    /// peer is closed from the start.
    pub fn accept(self) -> LoopbackPeer {
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<Result<Frame, TransportError>>();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel::<Frame>();

        let sink = futures::sink::unfold(from_client_tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        let channel = Channel {
            sink: Box::pin(sink),
            stream: Box::pin(UnboundedReceiverStream::new(to_client_rx)),
        };
        // On failure the channel is dropped here, closing both directions.
        let _ = self.reply.send(Ok(channel));

        LoopbackPeer {
            address: self.address,
            outgoing: Some(to_client_tx),
            incoming: from_client_rx,
        }
    }

    pub fn reject(self, reason: &str) {
        let _ = self.reply.send(Err(TransportError::Connect(reason.to_string())));
    }
}

/// Relay side of an accepted loopback channel.
pub struct LoopbackPeer {
    pub address: SessionAddress,
    outgoing: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    incoming: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackPeer {
    /// Push terminal output to the client as a text frame.
    pub fn send_output(&self, text: &str) -> bool {
        self.push(Ok(Frame::Text(text.to_string())))
    }

    /// Push raw bytes to the client as a binary frame.
    pub fn send_binary(&self, data: Bytes) -> bool {
        self.push(Ok(Frame::Binary(data)))
    }

    /// Break the channel with an error.
    pub fn fail(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    fn push(&self, item: Result<Frame, TransportError>) -> bool {
        self.outgoing
            .as_ref()
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false)
    }

    /// Whether the client end is still attached.
    pub fn is_connected(&self) -> bool {
        self.outgoing.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Resolve once the client end has gone away.
    pub async fn closed(&self) {
        if let Some(tx) = &self.outgoing {
            tx.closed().await;
        }
    }

    /// Close the channel from the relay side.
    pub fn close(mut self) {
        self.outgoing.take();
    }

    /// Next frame sent by the client, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Collect frames until none arrives for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(quiet, self.incoming.recv()).await {
            frames.push(frame);
        }
        frames
    }
}
