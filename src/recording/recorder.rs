use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use super::store::{RecordingStore, StoreError};
use super::{Event, NewRecording, RecordingId, RecordingSession, RecordingSummary};
use crate::session::{SessionController, SessionId};

/// Output events buffered before they are handed to the store.
pub const APPEND_BATCH_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RecordingStateError {
    #[error("session is already recording")]
    AlreadyRecording,
    #[error("session is not recording")]
    NotRecording,
    #[error("session is not connected")]
    NotConnected,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Starts and stops recordings on sessions, and fronts the store's catalog.
///
/// The recorder holds no per-session state itself: the active recording lives
/// in the session controller, which feeds it every output chunk and seals it
/// when the session goes away.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn RecordingStore>,
}

impl Recorder {
    pub fn new(store: Arc<dyn RecordingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordingStore> {
        &self.store
    }

    /// Begin recording a connected session's output.
    pub fn start(
        &self,
        session: &SessionController,
        machine_label: &str,
    ) -> Result<RecordingId, RecordingStateError> {
        let store = self.store.clone();
        let session_id = session.id();
        let id = session.install_recording(|| {
            ActiveRecording::create(store, session_id, machine_label)
        })?;
        tracing::info!(%session_id, recording_id = %id, "recording started");
        Ok(id)
    }

    /// Seal the session's active recording and return it.
    ///
    /// If the store rejects the seal, the session keeps recording and the
    /// call can be retried.
    pub fn stop(&self, session: &SessionController) -> Result<RecordingSession, RecordingStateError> {
        let sealed = session.seal_recording()?;
        tracing::info!(
            session_id = %session.id(),
            recording_id = %sealed.id,
            events = sealed.events.len(),
            "recording stopped"
        );
        Ok(sealed)
    }

    pub fn list(&self) -> Result<Vec<RecordingSummary>, StoreError> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<RecordingSession, StoreError> {
        self.store.get(id)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(id)
    }
}

/// A recording in progress, owned by the session it captures.
pub struct ActiveRecording {
    id: RecordingId,
    store: Arc<dyn RecordingStore>,
    started: Instant,
    start_time_ms: u64,
    pending: Vec<Event>,
    last_time: f64,
    finalized: bool,
}

impl std::fmt::Debug for ActiveRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRecording")
            .field("id", &self.id)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ActiveRecording {
    pub(crate) fn create(
        store: Arc<dyn RecordingStore>,
        session_id: SessionId,
        machine_label: &str,
    ) -> Result<Self, StoreError> {
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = store.create(NewRecording {
            session_id,
            machine_label: machine_label.to_string(),
            start_time_ms,
        })?;
        Ok(Self {
            id,
            store,
            started: Instant::now(),
            start_time_ms,
            pending: Vec::with_capacity(APPEND_BATCH_SIZE),
            last_time: 0.0,
            finalized: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capture one output chunk, timestamped against the monotonic clock.
    ///
    /// Returns a full batch for the caller to hand to the store once it has
    /// released its own locks.
    pub(crate) fn record(&mut self, data: &str) -> Option<PendingAppend> {
        let time = self.started.elapsed().as_secs_f64().max(self.last_time);
        self.last_time = time;
        self.pending.push(Event::output(data, time));
        if self.pending.len() < APPEND_BATCH_SIZE {
            return None;
        }
        Some(PendingAppend {
            id: self.id.clone(),
            store: self.store.clone(),
            events: std::mem::take(&mut self.pending),
        })
    }

    /// Put back a batch the store rejected, ahead of anything recorded since.
    pub(crate) fn requeue(&mut self, mut events: Vec<Event>) {
        events.append(&mut self.pending);
        self.pending = events;
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.append(&self.id, &self.pending)?;
        self.pending.clear();
        Ok(())
    }

    fn end_time_ms(&self) -> u64 {
        self.start_time_ms + self.started.elapsed().as_millis() as u64
    }

    /// Flush remaining events and finalize. On failure nothing buffered is
    /// lost and the seal can be retried.
    pub(crate) fn seal(&mut self) -> Result<RecordingSession, StoreError> {
        self.flush()?;
        if !self.finalized {
            self.store.finalize(&self.id, self.end_time_ms())?;
            self.finalized = true;
        }
        self.store.get(&self.id)
    }

    /// Finalize without the events that could not be flushed, so the stored
    /// recording stays playable.
    pub(crate) fn seal_partial(self) {
        if self.finalized {
            return;
        }
        match self.store.finalize(&self.id, self.end_time_ms()) {
            Ok(()) => tracing::warn!(
                recording_id = %self.id,
                dropped = self.pending.len(),
                "recording sealed without its last events"
            ),
            Err(e) => tracing::warn!(recording_id = %self.id, error = %e, "failed to finalize recording"),
        }
    }
}

/// A full batch of events detached from its recording.
pub(crate) struct PendingAppend {
    id: RecordingId,
    store: Arc<dyn RecordingStore>,
    events: Vec<Event>,
}

impl PendingAppend {
    pub(crate) fn recording_id(&self) -> &str {
        &self.id
    }

    /// Hand the batch to the store, returning the events if it refused them.
    pub(crate) fn write(self) -> Result<(), (StoreError, Vec<Event>)> {
        self.store
            .append(&self.id, &self.events)
            .map_err(|e| (e, self.events))
    }
}
