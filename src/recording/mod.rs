//! Session recordings: timestamped logs of a session's output.

pub mod recorder;
pub mod store;

pub use recorder::{Recorder, RecordingStateError, APPEND_BATCH_SIZE};
pub use store::{FileStore, MemoryStore, RecordingStore, StoreError};

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

pub type RecordingId = String;

/// Kind of a recorded event. Only output is ever captured; keystrokes are
/// not, so secrets typed at unechoed prompts never reach a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "o")]
    Output,
}

/// One chunk of output and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: String,
    /// Seconds since the recording started.
    pub time: f64,
}

impl Event {
    pub fn output(data: impl Into<String>, time: f64) -> Self {
        Self {
            kind: EventKind::Output,
            data: data.into(),
            time,
        }
    }
}

/// Metadata supplied when a recording is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecording {
    pub session_id: SessionId,
    pub machine_label: String,
    /// Wall-clock start, milliseconds since the Unix epoch.
    pub start_time_ms: u64,
}

/// A recording with its full event log.
///
/// Immutable once `end_time_ms` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: RecordingId,
    pub session_id: SessionId,
    pub machine_label: String,
    pub start_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl RecordingSession {
    pub fn is_sealed(&self) -> bool {
        self.end_time_ms.is_some()
    }

    /// Length of the recording in seconds, once sealed.
    pub fn duration(&self) -> Option<f64> {
        self.end_time_ms
            .map(|end| end.saturating_sub(self.start_time_ms) as f64 / 1000.0)
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            id: self.id.clone(),
            session_id: self.session_id,
            machine_label: self.machine_label.clone(),
            start_time_ms: self.start_time_ms,
            duration: self.duration(),
            event_count: self.events.len(),
        }
    }
}

/// Catalog entry returned by [`RecordingStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub id: RecordingId,
    pub session_id: SessionId,
    pub machine_label: String,
    pub start_time_ms: u64,
    /// `None` while still recording.
    pub duration: Option<f64>,
    pub event_count: usize,
}
