//! Output sinks: where terminal output ends up.
//!
//! Live sessions and the recording player both drive the same [`OutputSink`]
//! abstraction, so a presentation layer can render either without knowing the
//! source.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

/// A destination for terminal output.
///
/// Implementations must be cheap to call from the session driver; they are
/// invoked synchronously and never while an internal lock is held.
pub trait OutputSink: Send + Sync {
    /// Write a chunk of terminal output.
    fn write(&self, data: &str);

    /// Reset the display (e.g. before replaying from the start).
    fn clear(&self);
}

/// Discards everything. The default sink for a session nobody renders yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&self, _data: &str) {}
    fn clear(&self) {}
}

/// A chunk of output captured by [`BufferSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Monotonic instant at which the chunk was written.
    pub at: Instant,
    pub data: String,
}

/// In-memory sink that keeps every chunk since the last clear.
///
/// Useful for headless rendering and for asserting on output in tests.
/// Clones share the same buffer.
#[derive(Clone)]
pub struct BufferSink {
    chunks: Arc<Mutex<Vec<Chunk>>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferSink {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            chunks: Arc::new(Mutex::new(Vec::new())),
            version: Arc::new(version),
        }
    }

    /// Concatenated output since the last clear.
    pub fn contents(&self) -> String {
        self.chunks.lock().iter().map(|c| c.data.as_str()).collect()
    }

    /// The individual chunks since the last clear.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.lock().clone()
    }

    /// Wait until the buffered contents satisfy `predicate`.
    ///
    /// Returns immediately if they already do.
    pub async fn wait_until<F>(&self, mut predicate: F)
    where
        F: FnMut(&str) -> bool,
    {
        let mut rx = self.version.subscribe();
        loop {
            if predicate(&self.contents()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl OutputSink for BufferSink {
    fn write(&self, data: &str) {
        self.chunks.lock().push(Chunk {
            at: Instant::now(),
            data: data.to_string(),
        });
        self.bump();
    }

    fn clear(&self) {
        self.chunks.lock().clear();
        self.bump();
    }
}

/// Writes straight to the process's stdout. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, data: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data.as_bytes());
        let _ = out.flush();
    }

    fn clear(&self) {
        // Erase display, home cursor.
        self.write("\x1b[2J\x1b[H");
    }
}
