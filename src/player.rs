//! Deterministic replay of sealed recordings.
//!
//! The player walks a recording's events in order and writes each one to an
//! [`OutputSink`], waiting the recorded gap (scaled by the playback speed, and
//! never less than a minimum tick) between consecutive events. Every play run
//! gets its own run id; pausing, restarting, seeking or loading bumps the id
//! and cancels the run's pending sleep, so a superseded run never writes.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::recording::{Event, RecordingId, RecordingStore, StoreError};
use crate::sink::OutputSink;

/// Lower bound on the delay between two replayed events.
pub const DEFAULT_MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackSpeed {
    Half,
    #[default]
    Normal,
    Double,
    Quadruple,
}

impl PlaybackSpeed {
    pub const ALL: [PlaybackSpeed; 4] = [Self::Half, Self::Normal, Self::Double, Self::Quadruple];

    pub fn factor(self) -> f64 {
        match self {
            Self::Half => 0.5,
            Self::Normal => 1.0,
            Self::Double => 2.0,
            Self::Quadruple => 4.0,
        }
    }

    /// The menu entry for an exact multiplier, if there is one.
    pub fn from_factor(factor: f64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.factor() == factor)
    }
}

impl std::fmt::Display for PlaybackSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x", self.factor())
    }
}

impl FromStr for PlaybackSpeed {
    type Err = String;

    /// Accepts `0.5`, `1`, `2`, `4`, optionally suffixed with `x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let number = trimmed.strip_suffix(|c: char| c == 'x' || c == 'X').unwrap_or(trimmed);
        number
            .parse::<f64>()
            .ok()
            .and_then(Self::from_factor)
            .ok_or_else(|| format!("unsupported playback speed '{s}' (expected 0.5, 1, 2 or 4)"))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackState {
    pub recording_id: Option<RecordingId>,
    /// Index of the next event to write.
    pub cursor: usize,
    pub event_count: usize,
    /// `cursor / event_count` as a percentage.
    pub progress: f64,
    pub playing: bool,
    pub speed: PlaybackSpeed,
}

impl PlaybackState {
    fn update_progress(&mut self) {
        self.progress = if self.event_count == 0 {
            0.0
        } else {
            self.cursor as f64 / self.event_count as f64 * 100.0
        };
    }

    pub fn is_finished(&self) -> bool {
        self.recording_id.is_some() && self.cursor >= self.event_count
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("recording is still in progress: {0}")]
    NotFinalized(RecordingId),
    #[error("no recording loaded")]
    NothingLoaded,
}

struct Core {
    state: PlaybackState,
    events: Arc<[Event]>,
    run: u64,
    cancel: Option<CancellationToken>,
}

impl Core {
    /// Supersede the current run, if any.
    fn stop_run(&mut self) {
        self.run += 1;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.state.playing = false;
    }
}

struct Inner {
    store: Arc<dyn RecordingStore>,
    sink: Arc<dyn OutputSink>,
    min_tick: Duration,
    /// Held across every sink write. Taken before `core`.
    output: Mutex<()>,
    core: Mutex<Core>,
    state_tx: watch::Sender<PlaybackState>,
}

impl Inner {
    fn publish(&self, core: &Core) {
        self.state_tx.send_replace(core.state.clone());
    }
}

/// Replays recordings into a sink.
///
/// Must be used inside a Tokio runtime.
pub struct Player {
    inner: Arc<Inner>,
}

impl Player {
    pub fn new(store: Arc<dyn RecordingStore>, sink: Arc<dyn OutputSink>) -> Self {
        Self::with_min_tick(store, sink, DEFAULT_MIN_TICK)
    }

    pub fn with_min_tick(
        store: Arc<dyn RecordingStore>,
        sink: Arc<dyn OutputSink>,
        min_tick: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::default());
        Self {
            inner: Arc::new(Inner {
                store,
                sink,
                min_tick,
                output: Mutex::new(()),
                core: Mutex::new(Core {
                    state: PlaybackState::default(),
                    events: Arc::from(Vec::new()),
                    run: 0,
                    cancel: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.inner.state_tx.subscribe()
    }

    /// Load a sealed recording, replacing whatever was loaded. The speed is
    /// kept; everything else starts over and the sink is cleared.
    pub fn load(&self, recording_id: &str) -> Result<PlaybackState, PlayerError> {
        let recording = self.inner.store.get(recording_id)?;
        if !recording.is_sealed() {
            return Err(PlayerError::NotFinalized(recording.id));
        }

        let _output = self.inner.output.lock();
        let mut core = self.inner.core.lock();
        core.stop_run();
        let speed = core.state.speed;
        core.state = PlaybackState {
            recording_id: Some(recording.id),
            cursor: 0,
            event_count: recording.events.len(),
            progress: 0.0,
            playing: false,
            speed,
        };
        core.events = Arc::from(recording.events);
        self.inner.publish(&core);
        let state = core.state.clone();
        drop(core);
        self.inner.sink.clear();
        tracing::debug!(recording_id = %recording_id, events = state.event_count, "recording loaded");
        Ok(state)
    }

    /// Start or resume playback from the cursor. At the end of the recording
    /// this is a no-op; call [`Self::restart`] first.
    pub fn play(&self) -> Result<(), PlayerError> {
        let mut core = self.inner.core.lock();
        if core.state.recording_id.is_none() {
            return Err(PlayerError::NothingLoaded);
        }
        if core.state.playing {
            return Ok(());
        }
        if core.state.cursor >= core.events.len() {
            self.inner.publish(&core);
            return Ok(());
        }

        core.run += 1;
        let run = core.run;
        let cancel = CancellationToken::new();
        core.cancel = Some(cancel.clone());
        core.state.playing = true;
        self.inner.publish(&core);
        drop(core);

        tokio::spawn(play_run(self.inner.clone(), run, cancel));
        Ok(())
    }

    pub fn pause(&self) {
        let mut core = self.inner.core.lock();
        if core.state.playing {
            core.stop_run();
            self.inner.publish(&core);
        }
    }

    pub fn toggle(&self) -> Result<(), PlayerError> {
        if self.state().playing {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    /// Clear the sink and rewind to the first event, paused.
    pub fn restart(&self) {
        let _output = self.inner.output.lock();
        let mut core = self.inner.core.lock();
        core.stop_run();
        core.state.cursor = 0;
        core.state.update_progress();
        self.inner.publish(&core);
        drop(core);
        self.inner.sink.clear();
    }

    /// Takes effect from the next delay computed.
    pub fn set_speed(&self, speed: PlaybackSpeed) {
        let mut core = self.inner.core.lock();
        core.state.speed = speed;
        self.inner.publish(&core);
    }

    /// Jump so that events `[0, index)` are on screen. Playback resumes if
    /// it was running. `index` is clamped to the event count.
    pub fn seek(&self, index: usize) -> Result<(), PlayerError> {
        let was_playing = {
            let _output = self.inner.output.lock();
            let mut core = self.inner.core.lock();
            if core.state.recording_id.is_none() {
                return Err(PlayerError::NothingLoaded);
            }
            let was_playing = core.state.playing;
            core.stop_run();
            let index = index.min(core.events.len());
            core.state.cursor = index;
            core.state.update_progress();
            self.inner.publish(&core);
            let events = core.events.clone();
            drop(core);

            self.inner.sink.clear();
            for event in &events[..index] {
                self.inner.sink.write(&event.data);
            }
            was_playing
        };
        if was_playing {
            self.play()?;
        }
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.inner.core.lock().stop_run();
    }
}

/// One play run: write, wait, advance, until the end or until superseded.
async fn play_run(inner: Arc<Inner>, run: u64, cancel: CancellationToken) {
    loop {
        let delay = {
            let _output = inner.output.lock();
            let mut core = inner.core.lock();
            if core.run != run || !core.state.playing {
                return;
            }
            let index = core.state.cursor;
            let events = core.events.clone();
            let Some(event) = events.get(index) else {
                core.state.playing = false;
                inner.publish(&core);
                return;
            };

            let delay = events.get(index + 1).map(|next| {
                let gap = (next.time - event.time).max(0.0) / core.state.speed.factor();
                // Gaps too large for a Duration wait as long as the timer allows.
                Duration::try_from_secs_f64(gap)
                    .unwrap_or(Duration::MAX)
                    .max(inner.min_tick)
            });
            core.state.cursor = index + 1;
            core.state.update_progress();
            if delay.is_none() {
                core.state.playing = false;
                core.cancel = None;
            }
            inner.publish(&core);
            drop(core);

            inner.sink.write(&event.data);
            delay
        };

        let Some(delay) = delay else {
            tracing::debug!(run, "playback finished");
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
