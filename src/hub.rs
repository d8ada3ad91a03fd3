//! ==============================================================================
//! hub.rs - the single owner of sensor state
//! ==============================================================================
//!
//! purpose:
//!     one task owns the Synchronizer and the EventChannel. everything that
//!     mutates sensor state funnels into its select loop, one message at a
//!     time:
//!     - snapshot load results (spawned fetches report back with their ticket)
//!     - channel events (forwarded from the channel's handlers)
//!     - ui commands (selection, map clicks, manual reload, shutdown)
//!     - the optional periodic re-sync tick
//!
//! ```text
//!     readers never touch the synchronizer. they get a HubView through a
//!     watch channel: an Arc snapshot plus selection and status.
//! ```
//!
//! relationships:
//!     - owns: sync.rs (Synchronizer), channel/ (EventChannel)
//!     - uses: loader.rs (SnapshotSource), projector.rs (map clicks)
//!     - used by: server.rs (through HubHandle), main.rs
//!
//! layout:
//!
//! ```text
//!     ┌──────────────┐  (ticket, result)  ┌──────────────────────────────┐
//!     │ load task(s) │ ─────────────────> │                              │
//!     └──────────────┘                    │          hub task            │
//!     ┌──────────────┐   ChannelEvent     │   ┌──────────────────────┐   │
//!     │ EventChannel │ ─────────────────> │   │     Synchronizer     │   │
//!     └──────────────┘                    │   └──────────────────────┘   │
//!     ┌──────────────┐   Command+reply    │                              │
//!     │  HubHandle   │ ─────────────────> │                              │
//!     └──────┬───────┘                    └──────────────┬───────────────┘
//!            │            watch<HubView>                 │
//!            └<──────────────────────────────────────────┘
//! ```
//!
//! gap recovery:
//!     the push channel has no replay. after it comes back from a drop (or
//!     from failed connects) a fresh snapshot is loaded and merged.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};

use crate::channel::{
    ChannelEvent, ChannelOptions, ConnectionState, EventChannel, EventKind, PollingTransport,
    ReconnectPolicy, StreamingTransport, Transport, TransportKind,
};
use crate::config::{ChannelConfig, HubConfig, SyncConfig};
use crate::domain::{SensorCollection, SensorId, SensorRecord};
use crate::error::{FetchFailure, HubError, TransportError};
use crate::loader::SnapshotSource;
use crate::projector::{resolve_interaction, CameraInstruction, MapInteraction};
use crate::sync::{LoadOutcome, LoadTicket, Snapshot, SyncState, Synchronizer};

const COMMAND_QUEUE: usize = 64;

/// what readers see. replaced as a whole on every change.
#[derive(Debug, Clone, Default)]
pub struct HubView {
    pub sensors: Snapshot,
    /// bumped on every collection change
    pub revision: u64,
    pub selection: Option<SensorId>,
    pub sync_state: SyncState,
    pub loading: bool,
    pub pending_deltas: usize,
    pub connection: ConnectionState,
    /// transient banner: last load failure, else last channel problem
    pub last_error: Option<String>,
}

impl HubView {
    pub fn selected_record(&self) -> Option<&SensorRecord> {
        self.selection.as_ref().and_then(|id| self.sensors.get(id))
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub resync_on_reconnect: bool,
    pub resync_interval: Option<Duration>,
    pub max_pending_deltas: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for HubSettings {
    fn from(c: &SyncConfig) -> Self {
        Self {
            resync_on_reconnect: c.resync_on_reconnect,
            resync_interval: c
                .resync_interval_seconds
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            max_pending_deltas: c.max_pending_deltas,
        }
    }
}

enum Command {
    SetSelection {
        id: Option<SensorId>,
        reply: oneshot::Sender<Option<SensorRecord>>,
    },
    MapClick {
        interaction: MapInteraction,
        reply: oneshot::Sender<CameraInstruction>,
    },
    Reload {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

type LoadResult = (LoadTicket, Result<SensorCollection, FetchFailure>);

// ==============================================================================
// handle
// ==============================================================================

/// cheap to clone; every ui surface gets one
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<HubView>,
}

impl HubHandle {
    pub fn view(&self) -> HubView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HubView> {
        self.view.clone()
    }

    /// focus a sensor (or clear with `None`). returns the focused record if
    /// the id is currently known.
    pub async fn set_selection(&self, id: Option<SensorId>) -> Result<Option<SensorRecord>, HubError> {
        self.request(|reply| Command::SetSelection { id, reply }).await
    }

    pub async fn map_click(&self, interaction: MapInteraction) -> Result<CameraInstruction, HubError> {
        self.request(|reply| Command::MapClick { interaction, reply }).await
    }

    /// start a snapshot re-load. returns once it is started, not merged.
    pub async fn reload(&self) -> Result<(), HubError> {
        self.request(|reply| Command::Reload { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| HubError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

// ==============================================================================
// hub
// ==============================================================================

pub struct Hub {
    sync: Synchronizer,
    channel: EventChannel,
    channel_url: String,
    source: Arc<dyn SnapshotSource>,
    settings: HubSettings,
    /// the channel went down since the last connect
    dropped: bool,
    load_error: Option<String>,
    channel_error: Option<String>,
}

impl Hub {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        options: ChannelOptions,
        channel_url: impl Into<String>,
        settings: HubSettings,
    ) -> Self {
        Self {
            sync: Synchronizer::with_journal_capacity(settings.max_pending_deltas),
            channel: EventChannel::new(options),
            channel_url: channel_url.into(),
            source,
            settings,
            dropped: false,
            load_error: None,
            channel_error: None,
        }
    }

    /// wire the configured transports and policies around `source`
    pub fn from_config(config: &HubConfig, source: Arc<dyn SnapshotSource>) -> Result<Self, HubError> {
        let transports = build_transports(&config.channel, config.api.timeout())?;
        let options = ChannelOptions::new(transports)
            .with_reconnect(ReconnectPolicy::from(&config.channel.reconnect));
        Ok(Self::new(
            source,
            options,
            config.channel.url.clone(),
            HubSettings::from(&config.sync),
        ))
    }

    /// start the owning task. must be called inside a tokio runtime.
    pub fn spawn(self) -> (HubHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (view_tx, view_rx) = watch::channel(HubView::default());
        let task = tokio::spawn(self.run(command_rx, Arc::new(view_tx)));
        (
            HubHandle {
                commands: command_tx,
                view: view_rx,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, view: Arc<watch::Sender<HubView>>) {
        let (load_tx, mut loads) = mpsc::unbounded_channel::<LoadResult>();
        let (event_tx, mut events) = mpsc::unbounded_channel::<ChannelEvent>();

        for kind in [
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::ConnectError,
            EventKind::SensorUpdated,
        ] {
            let tx = event_tx.clone();
            self.channel.on(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        drop(event_tx);

        let sensors = view.clone();
        self.sync.subscribe(move |snapshot| {
            sensors.send_modify(|v| {
                v.sensors = snapshot.clone();
                v.revision += 1;
            });
        });

        let mut connection = self.channel.state_changes();
        self.channel.connect(self.channel_url.clone());
        self.start_load(&load_tx, "startup");
        self.publish(&view);

        let mut resync = self
            .settings
            .resync_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        tracing::info!(channel = %self.channel_url, "sync hub running");

        loop {
            tokio::select! {
                Some((ticket, result)) = loads.recv() => self.finish_load(ticket, result),
                Some(event) = events.recv() => self.on_channel_event(event, &load_tx),
                Ok(()) = connection.changed() => {
                    connection.borrow_and_update();
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command, &load_tx),
                },
                _ = next_tick(&mut resync) => self.start_load(&load_tx, "periodic re-sync"),
            }
            self.publish(&view);
        }

        self.sync.shutdown();
        self.channel.disconnect().await;
        self.publish(&view);
        tracing::info!("sync hub stopped");
    }

    fn start_load(&mut self, loads: &mpsc::UnboundedSender<LoadResult>, reason: &'static str) {
        let ticket = self.sync.begin_load();
        let source = self.source.clone();
        let loads = loads.clone();
        tracing::info!(reason, "loading sensor snapshot");
        tokio::spawn(async move {
            let result = source.load_all().await;
            let _ = loads.send((ticket, result));
        });
    }

    fn finish_load(&mut self, ticket: LoadTicket, result: Result<SensorCollection, FetchFailure>) {
        match self.sync.complete_load(ticket, result) {
            Ok(LoadOutcome::Applied { .. }) => self.load_error = None,
            Ok(LoadOutcome::Discarded) => {}
            Err(e) => self.load_error = Some(format!("Failed to load sensors: {e}")),
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent, loads: &mpsc::UnboundedSender<LoadResult>) {
        match event {
            ChannelEvent::Connect => {
                if self.dropped && self.settings.resync_on_reconnect {
                    self.start_load(loads, "reconnect");
                }
                self.dropped = false;
                self.channel_error = None;
            }
            ChannelEvent::Disconnect(reason) => {
                self.dropped = true;
                self.channel_error = Some(format!("Connection lost: {reason}"));
            }
            ChannelEvent::ConnectError(e) => {
                self.dropped = true;
                self.channel_error = Some(e.to_string());
            }
            ChannelEvent::SensorUpdated(delta) => {
                let id = delta.id().clone();
                let outcome = self.sync.apply_delta(delta);
                tracing::trace!(%id, ?outcome, "sensor delta");
            }
        }
    }

    fn on_command(&mut self, command: Command, loads: &mpsc::UnboundedSender<LoadResult>) {
        match command {
            Command::SetSelection { id, reply } => {
                self.sync.set_selection(id);
                let _ = reply.send(self.sync.selected_record().cloned());
            }
            Command::MapClick { interaction, reply } => {
                let _ = reply.send(resolve_interaction(&mut self.sync, interaction));
            }
            Command::Reload { reply } => {
                self.start_load(loads, "manual reload");
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    /// push everything but the collection (the synchronizer listener does that)
    fn publish(&self, view: &watch::Sender<HubView>) {
        let selection = self.sync.selection().cloned();
        let sync_state = self.sync.state();
        let loading = self.sync.is_loading();
        let pending_deltas = self.sync.pending_deltas();
        let connection = self.channel.state();
        let last_error = self.load_error.clone().or_else(|| self.channel_error.clone());

        view.send_if_modified(|v| {
            let changed = v.selection != selection
                || v.sync_state != sync_state
                || v.loading != loading
                || v.pending_deltas != pending_deltas
                || v.connection != connection
                || v.last_error != last_error;
            if changed {
                v.selection = selection;
                v.sync_state = sync_state;
                v.loading = loading;
                v.pending_deltas = pending_deltas;
                v.connection = connection;
                v.last_error = last_error;
            }
            changed
        });
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn build_transports(
    channel: &ChannelConfig,
    timeout: Duration,
) -> Result<Vec<Arc<dyn Transport>>, TransportError> {
    channel
        .transports
        .iter()
        .map(|kind| -> Result<Arc<dyn Transport>, TransportError> {
            Ok(match kind {
                TransportKind::Streaming => Arc::new(StreamingTransport::new(timeout)?),
                TransportKind::Polling => Arc::new(PollingTransport::new(
                    timeout,
                    Duration::from_millis(channel.poll_interval_ms),
                )?),
            })
        })
        .collect()
}

/// mocks shared by the hub and server tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::channel::{MessageStream, WireMessage};
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) type Feed = mpsc::UnboundedSender<Result<WireMessage, TransportError>>;
    pub(crate) type FeedRx = mpsc::UnboundedReceiver<Result<WireMessage, TransportError>>;

    pub(crate) struct TestSource {
        pub(crate) loads: AtomicUsize,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        scripted: Mutex<VecDeque<Result<SensorCollection, FetchFailure>>>,
        fallback: SensorCollection,
    }

    impl TestSource {
        pub(crate) fn with(records: Vec<SensorRecord>) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                gate: Mutex::new(None),
                scripted: Mutex::new(VecDeque::new()),
                fallback: records.into(),
            }
        }

        pub(crate) fn gated(mut self, gate: oneshot::Receiver<()>) -> Self {
            self.gate = Mutex::new(Some(gate));
            self
        }

        pub(crate) fn scripted(mut self, results: Vec<Result<SensorCollection, FetchFailure>>) -> Self {
            self.scripted = Mutex::new(results.into());
            self
        }
    }

    #[async_trait]
    impl SnapshotSource for TestSource {
        async fn load_all(&self) -> Result<SensorCollection, FetchFailure> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let next = self.scripted.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    /// accepts one session per feed, refuses once they run out
    struct FeedTransport {
        sessions: Mutex<VecDeque<FeedRx>>,
    }

    #[async_trait]
    impl Transport for FeedTransport {
        fn name(&self) -> &'static str {
            "feed"
        }

        async fn open(&self, _url: &str) -> Result<MessageStream, TransportError> {
            let session = self.sessions.lock().unwrap().pop_front();
            match session {
                Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|m| (m, rx))
                })
                .boxed()),
                None => Err(TransportError::Connection("connection refused".into())),
            }
        }
    }

    pub(crate) fn feeds(n: usize) -> (Arc<dyn Transport>, Vec<Feed>) {
        let mut senders = Vec::new();
        let mut sessions = VecDeque::new();
        for _ in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            sessions.push_back(rx);
        }
        let transport: Arc<dyn Transport> = Arc::new(FeedTransport {
            sessions: Mutex::new(sessions),
        });
        (transport, senders)
    }

    pub(crate) fn start(source: Arc<TestSource>, transport: Arc<dyn Transport>) -> (HubHandle, JoinHandle<()>) {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: None,
        };
        let options = ChannelOptions::new(vec![transport]).with_reconnect(policy);
        Hub::new(source, options, "http://push.test", HubSettings::default()).spawn()
    }

    pub(crate) async fn wait(handle: &HubHandle, f: impl FnMut(&HubView) -> bool) -> HubView {
        let mut rx = handle.watch();
        let view = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
            .await
            .expect("timed out waiting for hub view")
            .expect("hub dropped its view")
            .clone();
        view
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{feeds, start, wait, TestSource};
    use super::*;
    use crate::channel::{WireMessage, SENSOR_UPDATED};
    use crate::domain::SensorStatus;
    use crate::geo::GeoPoint;
    use crate::projector::POINT_FOCUS_ZOOM;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn sensor(id: i64, status: SensorStatus) -> SensorRecord {
        SensorRecord::new(id, status).at(41.0, 29.0)
    }

    fn update(id: i64, status: &str) -> Result<WireMessage, TransportError> {
        Ok(WireMessage {
            event: SENSOR_UPDATED.into(),
            data: json!({ "id": id, "status": status, "latitude": 41.0, "longitude": 29.0 }),
        })
    }

    fn tombstone(id: i64) -> Result<WireMessage, TransportError> {
        Ok(WireMessage {
            event: SENSOR_UPDATED.into(),
            data: json!({ "id": id, "deleted": true }),
        })
    }

    #[tokio::test]
    async fn snapshot_then_deltas_reach_the_view() {
        let source = Arc::new(TestSource::with(vec![
            sensor(1, SensorStatus::Active),
            sensor(2, SensorStatus::Pending),
        ]));
        let (transport, feeds) = feeds(1);
        let (hub, _task) = start(source, transport);

        let view = wait(&hub, |v| {
            v.sync_state == SyncState::Ready && v.connection == ConnectionState::Connected
        })
        .await;
        assert_eq!(view.sensors.len(), 2);
        assert!(!view.loading);

        feeds[0].send(update(3, "warning")).unwrap();
        let view = wait(&hub, |v| v.sensors.len() == 3).await;
        assert_eq!(
            view.sensors.get(&SensorId::Num(3)).unwrap().status,
            SensorStatus::Warning
        );

        feeds[0].send(tombstone(1)).unwrap();
        let view = wait(&hub, |v| v.sensors.len() == 2).await;
        assert!(!view.sensors.contains(&SensorId::Num(1)));
    }

    #[tokio::test]
    async fn deltas_before_snapshot_are_replayed() {
        let (release, gate) = oneshot::channel();
        let source = Arc::new(TestSource::with(vec![sensor(1, SensorStatus::Active)]).gated(gate));
        let (transport, feeds) = feeds(1);
        let (hub, _task) = start(source, transport);

        wait(&hub, |v| v.connection == ConnectionState::Connected).await;
        feeds[0].send(update(1, "warning")).unwrap();
        let view = wait(&hub, |v| v.pending_deltas == 1).await;
        assert_eq!(view.sync_state, SyncState::Loading);
        assert!(view.sensors.is_empty());

        release.send(()).unwrap();
        let view = wait(&hub, |v| v.sync_state == SyncState::Ready).await;
        assert_eq!(view.pending_deltas, 0);
        assert_eq!(
            view.sensors.get(&SensorId::Num(1)).unwrap().status,
            SensorStatus::Warning
        );
    }

    #[tokio::test]
    async fn reconnect_triggers_resync() {
        let source = Arc::new(TestSource::with(vec![sensor(1, SensorStatus::Active)]));
        let (transport, mut feeds) = feeds(2);
        let (hub, _task) = start(source.clone(), transport);

        wait(&hub, |v| {
            v.sync_state == SyncState::Ready && v.connection == ConnectionState::Connected
        })
        .await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        // end the first session; the channel comes back on the second
        drop(feeds.remove(0));

        let view = wait(&hub, |v| v.revision >= 2 && !v.loading).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
        assert_eq!(view.connection, ConnectionState::Connected);
        assert_eq!(view.last_error, None);
    }

    #[tokio::test]
    async fn point_click_selects_until_the_sensor_is_deleted() {
        let source = Arc::new(TestSource::with(vec![
            sensor(1, SensorStatus::Active),
            sensor(2, SensorStatus::Active),
        ]));
        let (transport, feeds) = feeds(1);
        let (hub, _task) = start(source, transport);
        wait(&hub, |v| {
            v.sync_state == SyncState::Ready && v.connection == ConnectionState::Connected
        })
        .await;

        let camera = hub
            .map_click(MapInteraction::PointClick {
                id: SensorId::Num(2),
                center: GeoPoint::new(41.0, 29.0),
            })
            .await
            .unwrap();
        assert_eq!(camera.zoom, POINT_FOCUS_ZOOM);

        let view = wait(&hub, |v| v.selection.is_some()).await;
        assert_eq!(view.selected_record().map(|r| r.id.clone()), Some(SensorId::Num(2)));

        feeds[0].send(tombstone(2)).unwrap();
        let view = wait(&hub, |v| v.selection.is_none()).await;
        assert_eq!(view.sensors.len(), 1);
    }

    #[tokio::test]
    async fn set_selection_returns_known_record() {
        let source = Arc::new(TestSource::with(vec![sensor(7, SensorStatus::Pending)]));
        let (transport, _feeds) = feeds(1);
        let (hub, _task) = start(source, transport);
        wait(&hub, |v| v.sync_state == SyncState::Ready).await;

        let found = hub.set_selection(Some(SensorId::Num(7))).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(SensorId::Num(7)));

        let missing = hub.set_selection(Some(SensorId::Num(8))).await.unwrap();
        assert_eq!(missing, None);

        assert_eq!(hub.set_selection(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_load_is_reported_and_reload_recovers() {
        let source = Arc::new(
            TestSource::with(vec![sensor(1, SensorStatus::Active)])
                .scripted(vec![Err(FetchFailure::Timeout)]),
        );
        let (transport, _feeds) = feeds(1);
        let (hub, _task) = start(source, transport);

        let view = wait(&hub, |v| v.last_error.is_some() && !v.loading).await;
        assert_eq!(view.sync_state, SyncState::Uninitialized);
        assert!(view.last_error.unwrap().contains("timed out"));

        hub.reload().await.unwrap();
        let view = wait(&hub, |v| v.sync_state == SyncState::Ready).await;
        assert_eq!(view.sensors.len(), 1);
        assert_eq!(view.last_error, None);
    }

    #[tokio::test]
    async fn shutdown_stops_hub_and_channel() {
        let source = Arc::new(TestSource::with(vec![]));
        let (transport, _feeds) = feeds(1);
        let (hub, task) = start(source, transport);
        wait(&hub, |v| v.connection == ConnectionState::Connected).await;

        hub.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("hub did not stop")
            .unwrap();

        assert_eq!(hub.view().connection, ConnectionState::Disconnected);
        assert_eq!(hub.reload().await, Err(HubError::Closed));
    }

    #[test]
    fn zero_resync_interval_means_off() {
        let settings = HubSettings::from(&SyncConfig {
            resync_interval_seconds: Some(0),
            ..SyncConfig::default()
        });
        assert_eq!(settings.resync_interval, None);
        assert!(settings.resync_on_reconnect);
    }
}
