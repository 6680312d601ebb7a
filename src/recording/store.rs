//! Persistence for recordings.
//!
//! The [`RecordingStore`] trait is what the recorder writes through and the
//! player reads from. [`MemoryStore`] keeps everything in-process;
//! [`FileStore`] lays recordings out on disk as a metadata document plus a
//! JSON-lines event log per recording, so appends never rewrite earlier events.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{Event, NewRecording, RecordingId, RecordingSession, RecordingSummary};
use crate::session::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("recording not found: {0}")]
    NotFound(RecordingId),
    #[error("recording already finalized: {0}")]
    Sealed(RecordingId),
    #[error("recording storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recording serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Storage backend for recordings.
pub trait RecordingStore: Send + Sync {
    /// Create an empty, unsealed recording and return its id.
    fn create(&self, meta: NewRecording) -> Result<RecordingId, StoreError>;

    /// Append events to an unsealed recording.
    fn append(&self, id: &str, events: &[Event]) -> Result<(), StoreError>;

    /// Seal a recording. Further appends fail with [`StoreError::Sealed`].
    fn finalize(&self, id: &str, end_time_ms: u64) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<RecordingSession, StoreError>;

    /// Every stored recording, oldest first.
    fn list(&self) -> Result<Vec<RecordingSummary>, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

fn new_id() -> RecordingId {
    uuid::Uuid::new_v4().to_string()
}

fn sort_summaries(summaries: &mut [RecordingSummary]) {
    summaries.sort_by(|a, b| {
        a.start_time_ms
            .cmp(&b.start_time_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ── In-memory ───────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    recordings: RwLock<HashMap<RecordingId, RecordingSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordingStore for MemoryStore {
    fn create(&self, meta: NewRecording) -> Result<RecordingId, StoreError> {
        let id = new_id();
        let recording = RecordingSession {
            id: id.clone(),
            session_id: meta.session_id,
            machine_label: meta.machine_label,
            start_time_ms: meta.start_time_ms,
            end_time_ms: None,
            events: Vec::new(),
        };
        self.recordings.write().insert(id.clone(), recording);
        Ok(id)
    }

    fn append(&self, id: &str, events: &[Event]) -> Result<(), StoreError> {
        let mut recordings = self.recordings.write();
        let recording = recordings
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if recording.is_sealed() {
            return Err(StoreError::Sealed(id.to_string()));
        }
        recording.events.extend_from_slice(events);
        Ok(())
    }

    fn finalize(&self, id: &str, end_time_ms: u64) -> Result<(), StoreError> {
        let mut recordings = self.recordings.write();
        let recording = recordings
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if recording.is_sealed() {
            return Err(StoreError::Sealed(id.to_string()));
        }
        recording.end_time_ms = Some(end_time_ms.max(recording.start_time_ms));
        Ok(())
    }

    fn get(&self, id: &str) -> Result<RecordingSession, StoreError> {
        self.recordings
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<RecordingSummary>, StoreError> {
        let mut summaries: Vec<_> = self
            .recordings
            .read()
            .values()
            .map(RecordingSession::summary)
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.recordings
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

// ── On disk ─────────────────────────────────────────────────────

const META_SUFFIX: &str = ".meta.json";
const EVENTS_SUFFIX: &str = ".events.jsonl";

/// On-disk metadata document (`<id>.meta.json`).
#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    id: RecordingId,
    session_id: SessionId,
    machine_label: String,
    start_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time_ms: Option<u64>,
}

/// Directory-backed store.
///
/// Writes are serialized through a single lock; reads go straight to disk.
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "recording store opened");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids are generated UUIDs; anything else could escape the directory.
    fn check_id(id: &str) -> Result<(), StoreError> {
        uuid::Uuid::parse_str(id)
            .map(|_| ())
            .map_err(|_| StoreError::NotFound(id.to_string()))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{META_SUFFIX}"))
    }

    fn events_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{EVENTS_SUFFIX}"))
    }

    fn read_meta(&self, id: &str) -> Result<Meta, StoreError> {
        Self::check_id(id)?;
        let raw = match fs::read_to_string(self.meta_path(id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write via a temp file and rename so a crash never leaves half a document.
    fn write_meta(&self, meta: &Meta) -> Result<(), StoreError> {
        let path = self.meta_path(&meta.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_events(&self, id: &str) -> Result<Vec<Event>, StoreError> {
        let file = match File::open(self.events_path(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(recording_id = %id, line = lineno + 1, error = %e, "skipping malformed event");
                }
            }
        }
        Ok(events)
    }

    fn count_events(&self, id: &str) -> Result<usize, StoreError> {
        Ok(self.read_events(id)?.len())
    }
}

impl RecordingStore for FileStore {
    fn create(&self, meta: NewRecording) -> Result<RecordingId, StoreError> {
        let id = new_id();
        let _guard = self.write_lock.lock();
        File::create(self.events_path(&id))?;
        self.write_meta(&Meta {
            id: id.clone(),
            session_id: meta.session_id,
            machine_label: meta.machine_label,
            start_time_ms: meta.start_time_ms,
            end_time_ms: None,
        })?;
        tracing::debug!(recording_id = %id, "recording created");
        Ok(id)
    }

    fn append(&self, id: &str, events: &[Event]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let meta = self.read_meta(id)?;
        if meta.end_time_ms.is_some() {
            return Err(StoreError::Sealed(id.to_string()));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(id))?;
        let mut out = BufWriter::new(file);
        for event in events {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    fn finalize(&self, id: &str, end_time_ms: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut meta = self.read_meta(id)?;
        if meta.end_time_ms.is_some() {
            return Err(StoreError::Sealed(id.to_string()));
        }
        meta.end_time_ms = Some(end_time_ms.max(meta.start_time_ms));
        self.write_meta(&meta)?;
        tracing::debug!(recording_id = %id, "recording finalized");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<RecordingSession, StoreError> {
        let meta = self.read_meta(id)?;
        let events = self.read_events(id)?;
        Ok(RecordingSession {
            id: meta.id,
            session_id: meta.session_id,
            machine_label: meta.machine_label,
            start_time_ms: meta.start_time_ms,
            end_time_ms: meta.end_time_ms,
            events,
        })
    }

    fn list(&self) -> Result<Vec<RecordingSummary>, StoreError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            let meta = match self.read_meta(id) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(file = ?entry.path(), error = %e, "skipping unreadable recording");
                    continue;
                }
            };
            let event_count = match self.count_events(id) {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(recording_id = %id, error = %e, "skipping recording with unreadable events");
                    continue;
                }
            };
            let duration = meta
                .end_time_ms
                .map(|end| end.saturating_sub(meta.start_time_ms) as f64 / 1000.0);
            summaries.push(RecordingSummary {
                id: meta.id,
                session_id: meta.session_id,
                machine_label: meta.machine_label,
                start_time_ms: meta.start_time_ms,
                duration,
                event_count,
            });
        }
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        Self::check_id(id)?;
        match fs::remove_file(self.meta_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.events_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(recording_id = %id, "recording deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_recording(start: u64) -> NewRecording {
        NewRecording {
            session_id: SessionId(1),
            machine_label: "db-02".into(),
            start_time_ms: start,
        }
    }

    /// Behaviour both backends share.
    fn exercise(store: &dyn RecordingStore) {
        let id = store.create(new_recording(10_000)).unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        store
            .append(&id, &[Event::output("a", 0.0), Event::output("b", 1.0)])
            .unwrap();
        store.append(&id, &[Event::output("c", 3.0)]).unwrap();

        let open = store.get(&id).unwrap();
        assert!(!open.is_sealed());
        assert_eq!(store.list().unwrap()[0].duration, None);

        store.finalize(&id, 13_000).unwrap();
        let sealed = store.get(&id).unwrap();
        assert_eq!(
            sealed.events,
            vec![
                Event::output("a", 0.0),
                Event::output("b", 1.0),
                Event::output("c", 3.0)
            ]
        );
        assert_eq!(sealed.duration(), Some(3.0));

        assert!(matches!(
            store.append(&id, &[Event::output("late", 4.0)]),
            Err(StoreError::Sealed(_))
        ));
        assert!(matches!(store.finalize(&id, 14_000), Err(StoreError::Sealed(_))));

        let other = store.create(new_recording(5_000)).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, other, "oldest first");
        assert_eq!(listed[1].event_count, 3);
        assert_eq!(listed[1].duration, Some(3.0));

        store.delete(&id).unwrap();
        assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn memory_store_lifecycle() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn file_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStore::open(dir.path()).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FileStore::open(dir.path()).unwrap();
            let id = store.create(new_recording(0)).unwrap();
            store.append(&id, &[Event::output("x", 0.5)]).unwrap();
            store.finalize(&id, 500).unwrap();
            id
        };
        let store = FileStore::open(dir.path()).unwrap();
        let rec = store.get(&id).unwrap();
        assert_eq!(rec.events, vec![Event::output("x", 0.5)]);
        assert_eq!(rec.duration(), Some(0.5));
    }

    #[test]
    fn file_store_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let id = store.create(new_recording(0)).unwrap();
        store.append(&id, &[Event::output("ok", 0.0)]).unwrap();

        let mut f = OpenOptions::new()
            .append(true)
            .open(store.events_path(&id))
            .unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);
        store.append(&id, &[Event::output("still ok", 1.0)]).unwrap();

        let rec = store.get(&id).unwrap();
        assert_eq!(
            rec.events,
            vec![Event::output("ok", 0.0), Event::output("still ok", 1.0)]
        );
    }

    #[test]
    fn list_skips_recordings_with_unreadable_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let healthy = store.create(new_recording(0)).unwrap();
        let broken = store.create(new_recording(1)).unwrap();

        // A directory where the event log should be fails on read.
        fs::remove_file(store.events_path(&broken)).unwrap();
        fs::create_dir(store.events_path(&broken)).unwrap();
        assert!(store.get(&broken).is_err());

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, healthy);
    }

    #[test]
    fn file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get("../etc/passwd"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete("x/y"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn missing_recording_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.append("nope", &[]),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.finalize("nope", 1), Err(StoreError::NotFound(_))));
    }
}
