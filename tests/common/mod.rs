#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relayterm::multiplexer::{SessionDefaults, TabManager};
use relayterm::protocol::Geometry;
use relayterm::recording::{
    Event, MemoryStore, NewRecording, Recorder, RecordingId, RecordingSession, RecordingStore,
    RecordingSummary, StoreError,
};
use relayterm::session::{ConnectionStatus, SessionController, SessionId};
use relayterm::sink::{BufferSink, Chunk};
use relayterm::transport::{LoopbackAcceptor, LoopbackConnector, LoopbackPeer, SessionAddress};

pub const TEST_LABEL: &str = "web-01";

/// Components returned from test manager creation.
pub struct TestTabs<S = MemoryStore> {
    pub manager: TabManager,
    /// Relay side: every connection attempt shows up here.
    pub acceptor: LoopbackAcceptor,
    pub store: Arc<S>,
}

/// A manager over a loopback relay and an in-memory recording store.
pub fn create_test_manager() -> TestTabs {
    create_test_manager_with(Arc::new(MemoryStore::new()))
}

/// A manager over a loopback relay recording into `store`.
pub fn create_test_manager_with<S: RecordingStore + 'static>(store: Arc<S>) -> TestTabs<S> {
    let (connector, acceptor) = LoopbackConnector::new();
    let mut defaults = SessionDefaults::new("loopback://relay/ws/shell");
    defaults.machine_label = TEST_LABEL.to_string();
    let manager = TabManager::new(Arc::new(connector), defaults, Recorder::new(store.clone()));
    TestTabs {
        manager,
        acceptor,
        store,
    }
}

/// A bare controller over a loopback relay.
pub fn create_test_controller(id: u64) -> (SessionController, LoopbackAcceptor) {
    let (connector, acceptor) = LoopbackConnector::new();
    let address = SessionAddress::new("loopback://relay/ws/shell", None, Geometry::default());
    (
        SessionController::new(SessionId(id), Arc::new(connector), address),
        acceptor,
    )
}

/// Connect a tab and accept it on the relay side.
pub async fn connect_tab<S>(tabs: &mut TestTabs<S>, id: SessionId) -> LoopbackPeer {
    let TestTabs { manager, acceptor, .. } = tabs;
    let (status, peer) = tokio::join!(manager.connect(id), async {
        acceptor.accept().await.expect("no connection attempt").accept()
    });
    assert_eq!(status, Some(ConnectionStatus::Connected));
    peer
}

/// Connect a controller and accept it on the relay side.
pub async fn connect_controller(c: &SessionController, acceptor: &mut LoopbackAcceptor) -> LoopbackPeer {
    let (status, peer) = tokio::join!(c.connect(), async {
        acceptor.accept().await.expect("no connection attempt").accept()
    });
    assert_eq!(status, ConnectionStatus::Connected);
    peer
}

/// Attach a fresh buffer sink to a tab.
pub fn buffer_sink(manager: &TabManager, id: SessionId) -> BufferSink {
    let sink = BufferSink::new();
    assert!(manager.attach_sink(id, Arc::new(sink.clone())));
    sink
}

/// Store a sealed recording with the given `(data, time)` events.
pub fn sealed_recording(store: &dyn RecordingStore, events: &[(&str, f64)], duration_ms: u64) -> RecordingId {
    let id = store
        .create(NewRecording {
            session_id: SessionId(1),
            machine_label: TEST_LABEL.to_string(),
            start_time_ms: 1_700_000_000_000,
        })
        .unwrap();
    let events: Vec<_> = events.iter().map(|(d, t)| Event::output(*d, *t)).collect();
    store.append(&id, &events).unwrap();
    store.finalize(&id, 1_700_000_000_000 + duration_ms).unwrap();
    id
}

/// Gaps between consecutive chunks.
pub fn gaps(chunks: &[Chunk]) -> Vec<Duration> {
    chunks.windows(2).map(|w| w[1].at - w[0].at).collect()
}

/// Timer granularity is a millisecond; allow a couple of ticks of slack.
pub fn assert_close(actual: Duration, expected: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(2),
        "expected ~{expected:?}, got {actual:?}"
    );
}

/// In-memory store whose appends can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_appends: AtomicBool,
}

impl FlakyStore {
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl RecordingStore for FlakyStore {
    fn create(&self, meta: NewRecording) -> Result<RecordingId, StoreError> {
        self.inner.create(meta)
    }

    fn append(&self, id: &str, events: &[Event]) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.append(id, events)
    }

    fn finalize(&self, id: &str, end_time_ms: u64) -> Result<(), StoreError> {
        self.inner.finalize(id, end_time_ms)
    }

    fn get(&self, id: &str) -> Result<RecordingSession, StoreError> {
        self.inner.get(id)
    }

    fn list(&self) -> Result<Vec<RecordingSummary>, StoreError> {
        self.inner.list()
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id)
    }
}
