//! Per-session channel transport.
//!
//! A [`ChannelTransport`] owns one bidirectional channel to a relay-mediated
//! shell. It is opened fresh for every connection attempt and reports what
//! happens to it as [`TransportEvent`]s, each tagged with the generation it was
//! opened under, on the owning session's queue.
//!
//! The concrete channel comes from a [`Connector`]: [`WsConnector`] speaks
//! WebSocket via tokio-tungstenite, [`LoopbackConnector`] is an in-process
//! pair for embedding and tests.

pub mod loopback;
pub mod ws;

pub use loopback::{LoopbackAcceptor, LoopbackConnector, LoopbackPeer, PendingConnection};
pub use ws::WsConnector;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ControlMessage, Frame, Geometry};

/// Default delay between the first geometry change and the resize frame that
/// carries the latest geometry.
pub const RESIZE_COALESCE_WINDOW: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("channel error: {0}")]
    Io(String),
    #[error("channel closed")]
    Closed,
}

/// Identifies one connection attempt of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where and how to open a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    /// Relay endpoint, e.g. `ws://relay.internal:8080/ws/shell`.
    pub url: String,
    /// Shell to launch on the remote host.
    pub shell: Option<String>,
    /// Initial terminal geometry.
    pub geometry: Geometry,
}

impl SessionAddress {
    pub fn new(url: impl Into<String>, shell: Option<String>, geometry: Geometry) -> Self {
        Self {
            url: url.into(),
            shell,
            geometry,
        }
    }

    /// The URL to dial, with session-scoped parameters appended as a query.
    pub fn channel_url(&self) -> String {
        let mut params = Vec::with_capacity(3);
        if let Some(shell) = &self.shell {
            params.push(format!("shell={}", encode_query_value(shell)));
        }
        params.push(format!("cols={}", self.geometry.cols));
        params.push(format!("rows={}", self.geometry.rows));
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, sep, params.join("&"))
    }
}

/// Percent-encode everything outside the unreserved set.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open channel: frames out, frames in.
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens session channels.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, address: SessionAddress) -> BoxFuture<'static, Result<Channel, TransportError>>;
}

/// What happened to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Output(String),
    /// The remote end closed the channel.
    Closed,
    /// Connecting failed, or the channel broke.
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: Generation,
    pub kind: TransportEventKind,
}

/// Handle to one connection attempt.
///
/// Dropping the handle closes the channel.
pub struct ChannelTransport {
    generation: Generation,
    input_tx: mpsc::UnboundedSender<String>,
    geometry_tx: watch::Sender<Geometry>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ChannelTransport {
    /// Start connecting. Progress is reported on `events`.
    pub fn open(
        connector: &dyn Connector,
        address: SessionAddress,
        generation: Generation,
        events: mpsc::UnboundedSender<TransportEvent>,
        coalesce_window: Duration,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (geometry_tx, geometry_rx) = watch::channel(address.geometry);
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tracing::debug!(%generation, url = %address.url, "opening channel");
        let task = TransportTask {
            generation,
            events,
            input_rx,
            geometry_rx,
            connected: connected.clone(),
            cancel: cancel.clone(),
            last_sent: address.geometry,
            coalesce_window,
        };
        let connecting = connector.connect(address);
        tokio::spawn(task.run(connecting));

        Self {
            generation,
            input_tx,
            geometry_tx,
            connected,
            cancel,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send keystrokes. Dropped (returns `false`) unless connected.
    pub fn send(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            tracing::trace!(generation = %self.generation, len = data.len(), "dropping input, not connected");
            return false;
        }
        self.input_tx
            .send(String::from_utf8_lossy(data).into_owned())
            .is_ok()
    }

    /// Record a geometry change. Bursts collapse into one frame carrying the
    /// latest geometry, sent only while connected.
    pub fn resize(&self, geometry: Geometry) {
        self.geometry_tx.send_replace(geometry);
    }

    /// Close the channel. Safe to call repeatedly and from any state.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct TransportTask {
    generation: Generation,
    events: mpsc::UnboundedSender<TransportEvent>,
    input_rx: mpsc::UnboundedReceiver<String>,
    geometry_rx: watch::Receiver<Geometry>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    last_sent: Geometry,
    coalesce_window: Duration,
}

impl TransportTask {
    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            generation: self.generation,
            kind,
        });
    }

    async fn run(mut self, connecting: BoxFuture<'static, Result<Channel, TransportError>>) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(generation = %self.generation, "connect cancelled");
                return;
            }
            result = connecting => result,
        };

        let Channel { mut sink, mut stream } = match result {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(generation = %self.generation, error = %e, "connect failed");
                self.emit(TransportEventKind::Failed(e));
                return;
            }
        };

        // close() may have raced the final step of the handshake.
        if self.cancel.is_cancelled() {
            let _ = sink.close().await;
            return;
        }

        self.connected.store(true, Ordering::Release);
        self.emit(TransportEventKind::Opened);

        // Geometry changes made while connecting are flushed now.
        let mut resize_due = match self.geometry_rx.has_changed() {
            Ok(true) => Some(Instant::now()),
            _ => None,
        };
        let mut geometry_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }

                Some(text) = self.input_rx.recv() => {
                    if let Err(e) = sink.send(ControlMessage::Input(text).encode()).await {
                        self.fail(e);
                        break;
                    }
                }

                changed = self.geometry_rx.changed(), if geometry_open => {
                    if changed.is_err() {
                        geometry_open = false;
                        continue;
                    }
                    resize_due.get_or_insert_with(|| Instant::now() + self.coalesce_window);
                }

                _ = sleep_until_due(resize_due), if resize_due.is_some() => {
                    resize_due = None;
                    let latest = *self.geometry_rx.borrow_and_update();
                    if latest == self.last_sent {
                        continue;
                    }
                    tracing::debug!(generation = %self.generation, geometry = %latest, "sending resize");
                    if let Err(e) = sink.send(ControlMessage::Resize(latest).encode()).await {
                        self.fail(e);
                        break;
                    }
                    self.last_sent = latest;
                }

                frame = stream.next() => match frame {
                    Some(Ok(frame)) => self.emit(TransportEventKind::Output(frame.into_output())),
                    Some(Err(e)) => {
                        self.fail(e);
                        break;
                    }
                    None => {
                        tracing::debug!(generation = %self.generation, "channel closed by peer");
                        self.connected.store(false, Ordering::Release);
                        self.emit(TransportEventKind::Closed);
                        break;
                    }
                },
            }
        }

        self.connected.store(false, Ordering::Release);
    }

    fn fail(&self, error: TransportError) {
        tracing::warn!(generation = %self.generation, error = %error, "channel failed");
        self.connected.store(false, Ordering::Release);
        self.emit(TransportEventKind::Failed(error));
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_resize;
    use bytes::Bytes;

    fn address() -> SessionAddress {
        SessionAddress::new("ws://relay.test/ws/shell", Some("bash".into()), Geometry::new(80, 24))
    }

    #[test]
    fn channel_url_carries_session_parameters() {
        assert_eq!(
            address().channel_url(),
            "ws://relay.test/ws/shell?shell=bash&cols=80&rows=24"
        );
    }

    #[test]
    fn channel_url_appends_to_existing_query() {
        let mut addr = address();
        addr.url = "ws://relay.test/ws/shell?host=web-01".into();
        addr.shell = Some("/bin/zsh".into());
        assert_eq!(
            addr.channel_url(),
            "ws://relay.test/ws/shell?host=web-01&shell=%2Fbin%2Fzsh&cols=80&rows=24"
        );
    }

    #[test]
    fn generation_increments() {
        assert_eq!(Generation::default().next(), Generation(1));
        assert_eq!(Generation(41).next().to_string(), "42");
    }

    #[tokio::test(start_paused = true)]
    async fn input_is_dropped_until_connected() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(1),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );

        assert!(!transport.send(b"early"));

        let mut peer = acceptor.accept().await.unwrap().accept();
        let opened = events_rx.recv().await.unwrap();
        assert_eq!(opened.kind, TransportEventKind::Opened);
        assert_eq!(opened.generation, Generation(1));

        assert!(transport.send(b"late"));
        assert_eq!(peer.recv().await, Some(Frame::Text("late".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn resize_burst_collapses_to_latest() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(1),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );
        let mut peer = acceptor.accept().await.unwrap().accept();
        events_rx.recv().await.unwrap();

        for (cols, rows) in [(81, 24), (90, 25), (100, 30), (110, 35), (120, 40)] {
            transport.resize(Geometry::new(cols, rows));
        }

        let frames = peer.drain(Duration::from_millis(100)).await;
        assert_eq!(
            frames,
            vec![Frame::Binary(encode_resize(Geometry::new(120, 40)))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resize_while_connecting_is_flushed_on_open() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(1),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );
        let pending = acceptor.accept().await.unwrap();
        transport.resize(Geometry::new(132, 43));
        let mut peer = pending.accept();

        assert_eq!(
            peer.recv().await,
            Some(Frame::Binary(encode_resize(Geometry::new(132, 43))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resize_to_current_geometry_sends_nothing() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(1),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );
        let mut peer = acceptor.accept().await.unwrap().accept();
        events_rx.recv().await.unwrap();

        transport.resize(Geometry::new(80, 24));
        assert!(peer.drain(Duration::from_millis(100)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn output_and_remote_close_are_reported() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(7),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );
        let peer = acceptor.accept().await.unwrap().accept();
        assert!(peer.send_output("$ "));
        assert!(peer.send_binary(Bytes::from_static(b"ok")));
        peer.close();

        let kinds: Vec<_> = [
            events_rx.recv().await.unwrap(),
            events_rx.recv().await.unwrap(),
            events_rx.recv().await.unwrap(),
            events_rx.recv().await.unwrap(),
        ]
        .into_iter()
        .inspect(|e| assert_eq!(e.generation, Generation(7)))
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                TransportEventKind::Opened,
                TransportEventKind::Output("$ ".into()),
                TransportEventKind::Output("ok".into()),
                TransportEventKind::Closed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_connect_reports_failure() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(1),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );
        acceptor.accept().await.unwrap().reject("host unreachable");
        let event = events_rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            TransportEventKind::Failed(TransportError::Connect("host unreachable".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_silent() {
        let (connector, mut acceptor) = LoopbackConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::open(
            &connector,
            address(),
            Generation(1),
            events_tx,
            RESIZE_COALESCE_WINDOW,
        );
        let peer = acceptor.accept().await.unwrap().accept();
        events_rx.recv().await.unwrap();

        transport.close();
        transport.close();
        assert!(!transport.is_connected());
        assert!(!transport.send(b"x"));

        peer.closed().await;
        drop(transport);
        // Caller-initiated close produces no Closed/Failed event.
        assert!(events_rx.recv().await.is_none());
    }
}
