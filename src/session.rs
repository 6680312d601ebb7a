//! Session controller: the connection lifecycle of one terminal tab.
//!
//! A [`SessionController`] owns at most one live [`ChannelTransport`] at a time
//! and a fresh one is opened for every connection attempt. Transport events
//! land on a per-session queue drained by a single driver task; each event
//! carries the [`Generation`] it was opened under and anything not matching
//! the current generation is discarded, so a superseded attempt can never
//! write output or flip the status.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::protocol::Geometry;
use crate::recording::recorder::{ActiveRecording, PendingAppend};
use crate::recording::{RecordingId, RecordingSession, RecordingStateError, StoreError};
use crate::sink::{NullSink, OutputSink};
use crate::transport::{
    ChannelTransport, Connector, SessionAddress, TransportEvent, TransportEventKind,
    RESIZE_COALESCE_WINDOW,
};

pub use crate::transport::Generation;

/// Tab-scoped session identifier, allocated monotonically by the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Latest status together with the attempt it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub generation: Generation,
    pub status: ConnectionStatus,
}

/// Invoked on every status transition, after internal locks are released.
///
/// Callbacks are serialized, so they observe transitions in order. A callback
/// must not call back into a mutating method of the same controller.
pub type StatusCallback = Arc<dyn Fn(SessionId, ConnectionStatus) + Send + Sync>;

#[derive(Clone)]
pub struct SessionOptions {
    /// Delay between the first resize and the frame carrying the latest size.
    pub coalesce_window: Duration,
    pub on_status: Option<StatusCallback>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            coalesce_window: RESIZE_COALESCE_WINDOW,
            on_status: None,
        }
    }
}

struct State {
    status: ConnectionStatus,
    generation: Generation,
    transport: Option<ChannelTransport>,
    address: SessionAddress,
    sink: Arc<dyn OutputSink>,
    /// Diagnostic lines emitted since the last successful connection.
    diagnostics: Vec<String>,
    recording: Option<ActiveRecording>,
}

struct Shared {
    id: SessionId,
    connector: Arc<dyn Connector>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<State>,
    status_tx: watch::Sender<StatusUpdate>,
    /// Serializes status callbacks. Always taken while `state` is held.
    notify: Mutex<()>,
    /// Serializes store writes of the active recording outside `state`.
    /// Always taken while `state` is held.
    recording_io: Mutex<()>,
    on_status: Option<StatusCallback>,
    coalesce_window: Duration,
}

/// Connection lifecycle of one terminal session.
///
/// Must be created inside a Tokio runtime; the driver task is spawned on
/// construction and stopped when the controller is dropped.
pub struct SessionController {
    shared: Arc<Shared>,
    driver: CancellationToken,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    pub fn new(id: SessionId, connector: Arc<dyn Connector>, address: SessionAddress) -> Self {
        Self::with_options(id, connector, address, SessionOptions::default())
    }

    pub fn with_options(
        id: SessionId,
        connector: Arc<dyn Connector>,
        address: SessionAddress,
        options: SessionOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(StatusUpdate {
            generation: Generation::default(),
            status: ConnectionStatus::Disconnected,
        });
        let shared = Arc::new(Shared {
            id,
            connector,
            events_tx,
            state: Mutex::new(State {
                status: ConnectionStatus::Disconnected,
                generation: Generation::default(),
                transport: None,
                address,
                sink: Arc::new(NullSink),
                diagnostics: Vec::new(),
                recording: None,
            }),
            status_tx,
            notify: Mutex::new(()),
            recording_io: Mutex::new(()),
            on_status: options.on_status,
            coalesce_window: options.coalesce_window,
        });

        let driver = CancellationToken::new();
        tokio::spawn(drive(shared.clone(), events_rx, driver.clone()));
        Self { shared, driver }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status_tx.borrow().status
    }

    pub fn generation(&self) -> Generation {
        self.shared.state.lock().generation
    }

    /// Geometry the next connection will open with.
    pub fn geometry(&self) -> Geometry {
        self.shared.state.lock().address.geometry
    }

    pub fn address(&self) -> SessionAddress {
        self.shared.state.lock().address.clone()
    }

    /// Diagnostic lines emitted since the last successful connection.
    pub fn diagnostics(&self) -> Vec<String> {
        self.shared.state.lock().diagnostics.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusUpdate> {
        self.shared.status_tx.subscribe()
    }

    /// Route output (and diagnostic lines) to `sink` from now on.
    pub fn attach_sink(&self, sink: Arc<dyn OutputSink>) {
        self.shared.state.lock().sink = sink;
    }

    /// Start a new connection attempt, superseding any current one.
    ///
    /// An active recording is sealed first. Returns the new attempt's
    /// generation; progress is observable through [`Self::subscribe_status`].
    pub fn begin_connect(&self) -> Generation {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let previous = st.transport.take();
        let recording = shared.take_recording(&mut st);

        st.generation = st.generation.next();
        let generation = st.generation;
        let transport = ChannelTransport::open(
            shared.connector.as_ref(),
            st.address.clone(),
            generation,
            shared.events_tx.clone(),
            shared.coalesce_window,
        );
        st.transport = Some(transport);
        tracing::info!(session_id = %shared.id, %generation, url = %st.address.url, "connecting");

        let notify = shared.transition(&mut st, ConnectionStatus::Connecting);
        drop(st);
        shared.notify(notify, ConnectionStatus::Connecting);

        if let Some(transport) = previous {
            transport.close();
        }
        seal_quietly(shared.id, recording);
        generation
    }

    /// Connect and wait until the attempt settles.
    ///
    /// Resolves with the attempt's resulting status, or with the current
    /// status if the attempt was superseded by another connect or a close.
    pub async fn connect(&self) -> ConnectionStatus {
        let mut rx = self.shared.status_tx.subscribe();
        let generation = self.begin_connect();
        let settled = rx
            .wait_for(|u| u.generation != generation || u.status != ConnectionStatus::Connecting)
            .await
            .map(|u| u.status);
        settled.unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Forward keystrokes. Returns `false` (and drops them) unless connected.
    pub fn send(&self, data: &[u8]) -> bool {
        let st = self.shared.state.lock();
        if st.status != ConnectionStatus::Connected {
            return false;
        }
        st.transport.as_ref().is_some_and(|t| t.send(data))
    }

    /// Record a new terminal size and forward it to the live channel.
    ///
    /// The size is remembered for the next connect. Zero dimensions are
    /// ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            tracing::debug!(session_id = %self.shared.id, cols, rows, "ignoring empty geometry");
            return;
        }
        let geometry = Geometry::new(cols, rows);
        let mut st = self.shared.state.lock();
        st.address.geometry = geometry;
        if let Some(transport) = &st.transport {
            transport.resize(geometry);
        }
    }

    /// Tear the session down. Safe to call repeatedly and from any state.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let transport = st.transport.take();
        let recording = shared.take_recording(&mut st);
        // Late events from the closed transport no longer match.
        st.generation = st.generation.next();
        let changed = st.status != ConnectionStatus::Disconnected;
        let notify = shared.transition(&mut st, ConnectionStatus::Disconnected);
        drop(st);
        if changed {
            tracing::info!(session_id = %shared.id, "session closed");
            shared.notify(notify, ConnectionStatus::Disconnected);
        } else {
            drop(notify);
        }

        if let Some(transport) = transport {
            transport.close();
        }
        seal_quietly(shared.id, recording);
    }

    pub fn is_recording(&self) -> bool {
        self.shared.state.lock().recording.is_some()
    }

    pub fn recording_id(&self) -> Option<RecordingId> {
        self.shared
            .state
            .lock()
            .recording
            .as_ref()
            .map(|r| r.id().to_string())
    }

    /// Attach a new recording, created by `create` only if the session is
    /// connected and not already recording.
    pub(crate) fn install_recording<F>(&self, create: F) -> Result<RecordingId, RecordingStateError>
    where
        F: FnOnce() -> Result<ActiveRecording, StoreError>,
    {
        let mut st = self.shared.state.lock();
        if st.recording.is_some() {
            return Err(RecordingStateError::AlreadyRecording);
        }
        if st.status != ConnectionStatus::Connected {
            return Err(RecordingStateError::NotConnected);
        }
        let active = create()?;
        let id = active.id().to_string();
        st.recording = Some(active);
        Ok(id)
    }

    /// Seal the active recording. If the store refuses, the recording goes
    /// back on the session unless the session has moved on, in which case it
    /// is finalized with what was already stored.
    pub(crate) fn seal_recording(&self) -> Result<RecordingSession, RecordingStateError> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let generation = st.generation;
        let mut handoff = shared
            .take_recording(&mut st)
            .ok_or(RecordingStateError::NotRecording)?;
        drop(st);

        let result = handoff.recording.seal();
        let RecordingHandoff { recording, io } = handoff;
        drop(io);
        match result {
            Ok(sealed) => Ok(sealed),
            Err(e) => {
                let mut st = shared.state.lock();
                if st.generation == generation
                    && st.status == ConnectionStatus::Connected
                    && st.recording.is_none()
                {
                    st.recording = Some(recording);
                } else {
                    drop(st);
                    recording.seal_partial();
                }
                Err(e.into())
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close();
        self.driver.cancel();
    }
}

impl Shared {
    /// Set the status and publish it on the watch. The returned guard keeps
    /// callback order equal to transition order; pass it to [`Self::notify`].
    fn transition(&self, st: &mut State, status: ConnectionStatus) -> MutexGuard<'_, ()> {
        st.status = status;
        self.status_tx.send_replace(StatusUpdate {
            generation: st.generation,
            status,
        });
        self.notify.lock()
    }

    fn notify(&self, guard: MutexGuard<'_, ()>, status: ConnectionStatus) {
        if let Some(callback) = &self.on_status {
            callback(self.id, status);
        }
        drop(guard);
    }

    fn handle(&self, event: TransportEvent) {
        let mut st = self.state.lock();
        if event.generation != st.generation {
            tracing::trace!(
                session_id = %self.id,
                stale = %event.generation,
                current = %st.generation,
                "discarding stale transport event"
            );
            return;
        }

        match event.kind {
            TransportEventKind::Opened => {
                if st.status != ConnectionStatus::Connecting {
                    return;
                }
                st.diagnostics.clear();
                tracing::info!(session_id = %self.id, generation = %event.generation, "connected");
                let notify = self.transition(&mut st, ConnectionStatus::Connected);
                drop(st);
                self.notify(notify, ConnectionStatus::Connected);
            }
            TransportEventKind::Output(text) => {
                let batch = st.recording.as_mut().and_then(|r| r.record(&text));
                let io = batch.as_ref().map(|_| self.recording_io.lock());
                let sink = st.sink.clone();
                drop(st);
                sink.write(&text);
                if let (Some(batch), Some(io)) = (batch, io) {
                    self.append_batch(batch, io);
                }
            }
            TransportEventKind::Closed => {
                self.terminate(st, ConnectionStatus::Disconnected, "connection closed by remote host".into());
            }
            TransportEventKind::Failed(error) => {
                self.terminate(st, ConnectionStatus::Error, error.to_string());
            }
        }
    }

    /// Detach the active recording for sealing. The returned handoff holds
    /// the recording write lock, so any batch still being written lands first.
    fn take_recording(&self, st: &mut State) -> Option<RecordingHandoff<'_>> {
        let recording = st.recording.take()?;
        Some(RecordingHandoff {
            recording,
            io: self.recording_io.lock(),
        })
    }

    /// Write a full batch outside the state lock. A rejected batch is put
    /// back on the recording if it is still active.
    fn append_batch(&self, batch: PendingAppend, io: MutexGuard<'_, ()>) {
        let recording_id = batch.recording_id().to_string();
        let result = batch.write();
        drop(io);
        let Err((e, events)) = result else { return };
        tracing::warn!(session_id = %self.id, %recording_id, error = %e, "failed to append events");

        let mut st = self.state.lock();
        match st.recording.as_mut() {
            Some(recording) if recording.id() == recording_id => recording.requeue(events),
            _ => tracing::warn!(
                session_id = %self.id,
                %recording_id,
                dropped = events.len(),
                "recording ended before a failed batch could be retried"
            ),
        }
    }

    /// The current transport ended on its own.
    fn terminate(&self, mut st: MutexGuard<'_, State>, status: ConnectionStatus, line: String) {
        tracing::warn!(session_id = %self.id, generation = %st.generation, %status, reason = %line, "session ended");
        let transport = st.transport.take();
        let recording = self.take_recording(&mut st);
        st.diagnostics.push(line.clone());
        let sink = st.sink.clone();
        let notify = self.transition(&mut st, status);
        drop(st);
        self.notify(notify, status);

        drop(transport);
        seal_quietly(self.id, recording);
        sink.write(&format!("\r\n[{line}]\r\n"));
    }
}

/// An active recording taken off a session, with the recording write lock.
struct RecordingHandoff<'a> {
    recording: ActiveRecording,
    io: MutexGuard<'a, ()>,
}

/// Seal a recording that ended as a side effect of the session going away.
fn seal_quietly(session_id: SessionId, handoff: Option<RecordingHandoff<'_>>) {
    let Some(RecordingHandoff { mut recording, io }) = handoff else { return };
    let recording_id = recording.id().to_string();
    let result = recording.seal();
    drop(io);
    match result {
        Ok(sealed) => {
            tracing::info!(%session_id, %recording_id, events = sealed.events.len(), "recording sealed");
        }
        Err(e) => {
            tracing::warn!(%session_id, %recording_id, error = %e, "failed to seal recording");
            recording.seal_partial();
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        shared.handle(event);
    }
    tracing::debug!(session_id = %shared.id, "session driver stopped");
}
