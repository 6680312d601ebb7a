//! Tab manager: N concurrent sessions, one docked strip, floating windows.
//!
//! Docked tabs share a single visible slot (the active tab); floating tabs are
//! independently visible. There is always at least one tab. Every operation
//! addressed to a missing tab, or otherwise not applicable, returns
//! `false`/`None` instead of an error, and callers re-query state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::Geometry;
use crate::recording::{Recorder, RecordingId, RecordingSession, RecordingStateError};
use crate::session::{
    ConnectionStatus, Generation, SessionController, SessionId, SessionOptions, StatusCallback,
};
use crate::sink::OutputSink;
use crate::transport::{Connector, SessionAddress, RESIZE_COALESCE_WINDOW};

/// Longest accepted tab name, in characters.
pub const MAX_TAB_NAME_LEN: usize = 64;

const EVENT_CAPACITY: usize = 256;

/// Parameters for every session the manager opens.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub url: String,
    pub shell: Option<String>,
    pub geometry: Geometry,
    pub coalesce_window: Duration,
    /// Host label stamped on recordings.
    pub machine_label: String,
}

impl SessionDefaults {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            shell: None,
            geometry: Geometry::default(),
            coalesce_window: RESIZE_COALESCE_WINDOW,
            machine_label: String::new(),
        }
    }

    fn address(&self) -> SessionAddress {
        SessionAddress::new(self.url.clone(), self.shell.clone(), self.geometry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Docked,
    Floating,
}

/// Snapshot of one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabInfo {
    pub id: SessionId,
    pub name: String,
    pub status: ConnectionStatus,
    pub placement: Placement,
    pub active: bool,
}

impl TabInfo {
    pub fn is_floating(&self) -> bool {
        self.placement == Placement::Floating
    }
}

/// Tab lifecycle notifications, in the order the changes were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    Added(SessionId),
    Closed(SessionId),
    Renamed { id: SessionId, name: String },
    /// The docked tab now in the visible slot, or `None` if no tab is docked.
    Activated(Option<SessionId>),
    PlacementChanged { id: SessionId, placement: Placement },
    StatusChanged { id: SessionId, status: ConnectionStatus },
}

struct Tab {
    id: SessionId,
    name: String,
    status: ConnectionStatus,
    placement: Placement,
    controller: Arc<SessionController>,
}

struct Tabs {
    tabs: Vec<Tab>,
    active: Option<SessionId>,
    next_id: u64,
    events: broadcast::Sender<TabEvent>,
}

impl Tabs {
    fn index_of(&self, id: SessionId) -> Option<usize> {
        self.tabs.iter().position(|t| t.id == id)
    }

    fn info(&self, tab: &Tab) -> TabInfo {
        TabInfo {
            id: tab.id,
            name: tab.name.clone(),
            status: tab.status,
            placement: tab.placement,
            active: self.active == Some(tab.id),
        }
    }

    /// Nearest docked tab to `index`, looking before it first. `index` itself
    /// is skipped.
    fn nearest_docked(&self, index: usize) -> Option<SessionId> {
        let docked = |t: &&Tab| t.placement == Placement::Docked;
        self.tabs[..index.min(self.tabs.len())]
            .iter()
            .rev()
            .find(docked)
            .or_else(|| self.tabs.iter().skip(index + 1).find(docked))
            .map(|t| t.id)
    }

    fn set_active(&mut self, active: Option<SessionId>) {
        if self.active != active {
            self.active = active;
            self.emit(TabEvent::Activated(active));
        }
    }

    fn emit(&self, event: TabEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Owns every tab and its session.
///
/// Must be created inside a Tokio runtime.
pub struct TabManager {
    connector: Arc<dyn Connector>,
    defaults: SessionDefaults,
    recorder: Recorder,
    tabs: Arc<Mutex<Tabs>>,
}

impl TabManager {
    /// Create a manager holding one docked, active, disconnected tab.
    pub fn new(connector: Arc<dyn Connector>, defaults: SessionDefaults, recorder: Recorder) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let manager = Self {
            connector,
            defaults,
            recorder,
            tabs: Arc::new(Mutex::new(Tabs {
                tabs: Vec::new(),
                active: None,
                next_id: 1,
                events,
            })),
        };
        manager.add_tab();
        manager
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TabEvent> {
        self.tabs.lock().events.subscribe()
    }

    /// Open a new docked tab and make it active. The session starts
    /// disconnected.
    pub fn add_tab(&self) -> SessionId {
        let id = {
            let mut tabs = self.tabs.lock();
            let id = SessionId(tabs.next_id);
            tabs.next_id += 1;
            id
        };

        let controller = Arc::new(SessionController::with_options(
            id,
            self.connector.clone(),
            self.defaults.address(),
            SessionOptions {
                coalesce_window: self.defaults.coalesce_window,
                on_status: Some(status_callback(Arc::downgrade(&self.tabs))),
            },
        ));

        let mut tabs = self.tabs.lock();
        tabs.tabs.push(Tab {
            id,
            name: format!("Terminal {id}"),
            status: controller.status(),
            placement: Placement::Docked,
            controller,
        });
        tabs.emit(TabEvent::Added(id));
        tabs.set_active(Some(id));
        tracing::info!(session_id = %id, tabs = tabs.tabs.len(), "tab added");
        id
    }

    /// Close a tab and tear down its session. The last remaining tab is never
    /// closed.
    pub fn close_tab(&self, id: SessionId) -> bool {
        let removed = {
            let mut tabs = self.tabs.lock();
            if tabs.tabs.len() <= 1 {
                tracing::debug!(session_id = %id, "refusing to close the last tab");
                return false;
            }
            let Some(index) = tabs.index_of(id) else {
                return false;
            };
            let fallback = (tabs.active == Some(id)).then(|| tabs.nearest_docked(index));
            let removed = tabs.tabs.remove(index);
            tabs.emit(TabEvent::Closed(id));
            if let Some(next) = fallback {
                tabs.set_active(next);
            }
            tracing::info!(session_id = %id, tabs = tabs.tabs.len(), "tab closed");
            removed
        };
        removed.controller.close();
        true
    }

    /// Detach a docked tab into its own window. If it was active, the nearest
    /// docked tab takes its place.
    pub fn float(&self, id: SessionId) -> bool {
        let mut tabs = self.tabs.lock();
        let Some(index) = tabs.index_of(id) else {
            return false;
        };
        if tabs.tabs[index].placement == Placement::Floating {
            return false;
        }
        tabs.tabs[index].placement = Placement::Floating;
        tabs.emit(TabEvent::PlacementChanged {
            id,
            placement: Placement::Floating,
        });
        if tabs.active == Some(id) {
            let next = tabs.nearest_docked(index);
            tabs.set_active(next);
        }
        true
    }

    /// Return a floating tab to the strip and make it active.
    pub fn dock(&self, id: SessionId) -> bool {
        let mut tabs = self.tabs.lock();
        let Some(index) = tabs.index_of(id) else {
            return false;
        };
        if tabs.tabs[index].placement == Placement::Docked {
            return false;
        }
        tabs.tabs[index].placement = Placement::Docked;
        tabs.emit(TabEvent::PlacementChanged {
            id,
            placement: Placement::Docked,
        });
        tabs.set_active(Some(id));
        true
    }

    /// Put a docked tab in the visible slot.
    pub fn activate(&self, id: SessionId) -> bool {
        let mut tabs = self.tabs.lock();
        let docked = tabs
            .index_of(id)
            .is_some_and(|i| tabs.tabs[i].placement == Placement::Docked);
        if docked {
            tabs.set_active(Some(id));
        }
        docked
    }

    pub fn rename(&self, id: SessionId, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_TAB_NAME_LEN {
            return false;
        }
        let mut tabs = self.tabs.lock();
        let Some(index) = tabs.index_of(id) else {
            return false;
        };
        tabs.tabs[index].name = name.to_string();
        tabs.emit(TabEvent::Renamed {
            id,
            name: name.to_string(),
        });
        true
    }

    /// Floating tabs are always visible; docked tabs only while active.
    pub fn is_visible(&self, id: SessionId) -> bool {
        let tabs = self.tabs.lock();
        match tabs.index_of(id).map(|i| tabs.tabs[i].placement) {
            Some(Placement::Floating) => true,
            Some(Placement::Docked) => tabs.active == Some(id),
            None => false,
        }
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        let tabs = self.tabs.lock();
        tabs.tabs.iter().map(|t| tabs.info(t)).collect()
    }

    pub fn tab(&self, id: SessionId) -> Option<TabInfo> {
        let tabs = self.tabs.lock();
        tabs.index_of(id).map(|i| tabs.info(&tabs.tabs[i]))
    }

    pub fn len(&self) -> usize {
        self.tabs.lock().tabs.len()
    }

    /// Never true: a manager always holds at least one tab.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> Option<SessionId> {
        self.tabs.lock().active
    }

    pub fn controller(&self, id: SessionId) -> Option<Arc<SessionController>> {
        let tabs = self.tabs.lock();
        tabs.index_of(id).map(|i| tabs.tabs[i].controller.clone())
    }

    /// Start connecting a tab's session without waiting.
    pub fn begin_connect(&self, id: SessionId) -> Option<Generation> {
        self.controller(id).map(|c| c.begin_connect())
    }

    /// Connect a tab's session and wait for the attempt to settle.
    pub async fn connect(&self, id: SessionId) -> Option<ConnectionStatus> {
        let controller = self.controller(id)?;
        Some(controller.connect().await)
    }

    pub fn send(&self, id: SessionId, data: &[u8]) -> bool {
        self.controller(id).is_some_and(|c| c.send(data))
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> bool {
        self.controller(id).map(|c| c.resize(cols, rows)).is_some()
    }

    pub fn attach_sink(&self, id: SessionId, sink: Arc<dyn OutputSink>) -> bool {
        self.controller(id).map(|c| c.attach_sink(sink)).is_some()
    }

    pub fn disconnect(&self, id: SessionId) -> bool {
        self.controller(id).map(|c| c.close()).is_some()
    }

    /// Start recording a tab's session. `None` if there is no such tab.
    pub fn start_recording(&self, id: SessionId) -> Option<Result<RecordingId, RecordingStateError>> {
        let controller = self.controller(id)?;
        Some(self.recorder.start(&controller, &self.defaults.machine_label))
    }

    /// Stop and seal a tab's recording. `None` if there is no such tab.
    pub fn stop_recording(&self, id: SessionId) -> Option<Result<RecordingSession, RecordingStateError>> {
        let controller = self.controller(id)?;
        Some(self.recorder.stop(&controller))
    }
}

/// Mirrors a session's status into its tab. Holds the tab table weakly so
/// sessions never keep the manager alive.
fn status_callback(tabs: Weak<Mutex<Tabs>>) -> StatusCallback {
    Arc::new(move |id: SessionId, status: ConnectionStatus| {
        let Some(shared) = tabs.upgrade() else { return };
        let mut tabs = shared.lock();
        let Some(index) = tabs.index_of(id) else { return };
        if tabs.tabs[index].status != status {
            tabs.tabs[index].status = status;
            tabs.emit(TabEvent::StatusChanged { id, status });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::MemoryStore;
    use crate::transport::{LoopbackAcceptor, LoopbackConnector};

    fn manager() -> (TabManager, LoopbackAcceptor) {
        let (connector, acceptor) = LoopbackConnector::new();
        let mut defaults = SessionDefaults::new("loopback://web-01");
        defaults.machine_label = "web-01".into();
        let recorder = Recorder::new(Arc::new(MemoryStore::new()));
        (TabManager::new(Arc::new(connector), defaults, recorder), acceptor)
    }

    fn ids(m: &TabManager) -> Vec<u64> {
        m.tabs().iter().map(|t| t.id.0).collect()
    }

    #[tokio::test]
    async fn starts_with_one_active_tab() {
        let (m, _acceptor) = manager();
        let tabs = m.tabs();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].id, SessionId(1));
        assert_eq!(tabs[0].name, "Terminal 1");
        assert_eq!(tabs[0].status, ConnectionStatus::Disconnected);
        assert_eq!(tabs[0].placement, Placement::Docked);
        assert!(tabs[0].active);
        assert_eq!(m.active(), Some(SessionId(1)));
        assert!(m.is_visible(SessionId(1)));
    }

    #[tokio::test]
    async fn last_tab_cannot_be_closed() {
        let (m, _acceptor) = manager();
        assert!(!m.close_tab(SessionId(1)));
        assert_eq!(ids(&m), vec![1]);

        // Floating does not change that.
        assert!(m.float(SessionId(1)));
        assert!(!m.close_tab(SessionId(1)));
        assert_eq!(m.len(), 1);
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let (m, _acceptor) = manager();
        let two = m.add_tab();
        assert!(m.close_tab(two));
        assert_eq!(m.add_tab(), SessionId(3));
    }

    #[tokio::test]
    async fn closing_down_to_one_always_succeeds() {
        for n in 1..=6u64 {
            let (m, _acceptor) = manager();
            for _ in 1..n {
                m.add_tab();
            }
            for id in (2..=n).rev() {
                assert!(m.close_tab(SessionId(id)));
            }
            assert_eq!(ids(&m), vec![1]);
            assert!(!m.close_tab(SessionId(1)));
        }
    }

    #[tokio::test]
    async fn closing_active_prefers_preceding_docked_tab() {
        let (m, _acceptor) = manager();
        let two = m.add_tab();
        let three = m.add_tab();
        m.activate(two);

        assert!(m.close_tab(two));
        assert_eq!(m.active(), Some(SessionId(1)));

        // With nothing docked before it, the following tab wins.
        m.activate(SessionId(1));
        assert!(m.close_tab(SessionId(1)));
        assert_eq!(m.active(), Some(three));
    }

    #[tokio::test]
    async fn closing_active_skips_floating_neighbours() {
        let (m, _acceptor) = manager();
        let two = m.add_tab();
        let three = m.add_tab();
        m.float(two);
        assert!(m.close_tab(three));
        assert_eq!(m.active(), Some(SessionId(1)));
    }

    #[tokio::test]
    async fn no_active_tab_when_nothing_is_docked() {
        let (m, _acceptor) = manager();
        let two = m.add_tab();
        assert!(m.float(SessionId(1)));
        assert!(m.close_tab(two));
        assert_eq!(m.active(), None);
        assert!(m.is_visible(SessionId(1)));
    }

    #[tokio::test]
    async fn float_and_dock_move_visibility() {
        let (m, _acceptor) = manager();
        let two = m.add_tab();
        assert!(!m.is_visible(SessionId(1)));

        assert!(m.float(two));
        assert!(!m.float(two));
        assert_eq!(m.active(), Some(SessionId(1)));
        assert!(m.is_visible(two));
        assert!(m.is_visible(SessionId(1)));
        assert!(!m.activate(two), "floating tabs are not activatable");

        assert!(m.dock(two));
        assert!(!m.dock(two));
        assert_eq!(m.active(), Some(two));
        assert!(!m.is_visible(SessionId(1)));
    }

    #[tokio::test]
    async fn rename_validates() {
        let (m, _acceptor) = manager();
        let id = SessionId(1);
        assert!(m.rename(id, "  prod db  "));
        assert_eq!(m.tab(id).unwrap().name, "prod db");

        assert!(!m.rename(id, ""));
        assert!(!m.rename(id, "   "));
        assert!(!m.rename(id, &"x".repeat(MAX_TAB_NAME_LEN + 1)));
        assert!(m.rename(id, &"é".repeat(MAX_TAB_NAME_LEN)));
        assert_eq!(m.tab(id).unwrap().name.chars().count(), MAX_TAB_NAME_LEN);
        assert!(!m.rename(SessionId(42), "ghost"));
    }

    #[tokio::test]
    async fn operations_on_missing_tabs_are_refused() {
        let (m, _acceptor) = manager();
        let ghost = SessionId(99);
        assert!(!m.close_tab(ghost));
        assert!(!m.float(ghost));
        assert!(!m.dock(ghost));
        assert!(!m.activate(ghost));
        assert!(!m.is_visible(ghost));
        assert!(!m.send(ghost, b"x"));
        assert!(!m.resize(ghost, 80, 24));
        assert!(!m.disconnect(ghost));
        assert!(m.tab(ghost).is_none());
        assert!(m.controller(ghost).is_none());
        assert!(m.connect(ghost).await.is_none());
        assert!(m.start_recording(ghost).is_none());
        assert!(m.stop_recording(ghost).is_none());
    }

    #[tokio::test]
    async fn events_follow_changes() {
        let (m, mut acceptor) = manager();
        let mut events = m.subscribe_events();

        let two = m.add_tab();
        m.rename(two, "logs");
        let (status, _peer) = tokio::join!(m.connect(two), async {
            acceptor.accept().await.unwrap().accept()
        });
        assert_eq!(status, Some(ConnectionStatus::Connected));
        m.close_tab(two);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                TabEvent::Added(two),
                TabEvent::Activated(Some(two)),
                TabEvent::Renamed {
                    id: two,
                    name: "logs".into()
                },
                TabEvent::StatusChanged {
                    id: two,
                    status: ConnectionStatus::Connecting
                },
                TabEvent::StatusChanged {
                    id: two,
                    status: ConnectionStatus::Connected
                },
                TabEvent::Closed(two),
                TabEvent::Activated(Some(SessionId(1))),
            ]
        );
    }
}
