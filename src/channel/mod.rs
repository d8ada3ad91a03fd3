//! ==============================================================================
//! channel/ - auto-reconnecting push channel to the telemetry service
//! ==============================================================================
//!
//! purpose:
//!     keeps one long-lived connection to the push service and turns what
//!     arrives into typed events for whoever subscribed.
//!
//! lifecycle:
//!
//! ```text
//!     disconnected ──connect()──> connecting ──open ok──> connected
//!          ^                          │   ^                   │
//!          │                   open failed│                   │ stream ended / errored
//!          │                          v   │ backoff           v
//!          └──────────────────── disconnected <───────────────┘
//!
//!     the driver task owns the reconnect loop; callers never re-enter
//!     `connecting` themselves. `disconnect()` is the only way out.
//! ```
//!
//! delivery:
//!     handlers run on the driver task, one at a time, in registration order.
//!     there are no acks and nothing is replayed: whatever is sent while the
//!     channel is down is lost.
//!
//! relationships:
//!     - uses: transport.rs (streaming / polling wire formats)
//!     - uses: domain.rs (payload -> DeltaEvent)
//!     - owned by: hub.rs
//!
//! ==============================================================================

pub mod transport;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::DeltaEvent;
use crate::error::TransportError;

pub use transport::{
    MessageStream, PollingTransport, SseParser, StreamingTransport, Transport, TransportKind,
    WireMessage,
};

/// event name carrying sensor upserts and tombstones
pub const SENSOR_UPDATED: &str = "sensor_updated";
/// older dashboards emit this name for the same payload
pub const LEGACY_SENSOR_UPDATED: &str = "sensorUpdate";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// names handlers subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    SensorUpdated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connect,
    /// reason the transport went away
    Disconnect(String),
    ConnectError(TransportError),
    SensorUpdated(DeltaEvent),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Disconnect(_) => EventKind::Disconnect,
            Self::ConnectError(_) => EventKind::ConnectError,
            Self::SensorUpdated(_) => EventKind::SensorUpdated,
        }
    }
}

// ==============================================================================
// options
// ==============================================================================

/// exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// 2^attempt * initial_delay, capped at max_delay
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.initial_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct ChannelOptions {
    /// tried in order on every (re)connect; first one that opens wins
    pub transports: Vec<Arc<dyn Transport>>,
    pub reconnect: ReconnectPolicy,
}

impl ChannelOptions {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            transports,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

// ==============================================================================
// handler registry
// ==============================================================================

pub type Handler = Box<dyn FnMut(&ChannelEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    closed: bool,
    next_id: u64,
    handlers: Vec<(HandlerId, EventKind, Handler)>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // a panicking handler must not wedge the channel
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// run matching handlers. the registry lock is held for the whole dispatch,
/// so once `disconnect()` has taken it and set `closed`, nothing else fires.
/// handlers therefore must not call `on`/`off` themselves.
fn dispatch(registry: &Mutex<Registry>, event: &ChannelEvent) {
    let mut reg = lock(registry);
    if reg.closed {
        return;
    }
    let kind = event.kind();
    for (_, k, handler) in reg.handlers.iter_mut() {
        if *k == kind {
            handler(event);
        }
    }
}

// ==============================================================================
// client
// ==============================================================================

/// explicitly owned push-channel client
pub struct EventChannel {
    options: ChannelOptions,
    registry: SharedRegistry,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl EventChannel {
    pub fn new(options: ChannelOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            registry: Arc::new(Mutex::new(Registry::default())),
            state_tx: Arc::new(state_tx),
            state_rx,
            cancel: CancellationToken::new(),
            driver: None,
        }
    }

    /// subscribe to one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: FnMut(&ChannelEvent) + Send + 'static,
    {
        let mut reg = lock(&self.registry);
        let id = HandlerId(reg.next_id);
        reg.next_id += 1;
        reg.handlers.push((id, kind, Box::new(handler)));
        id
    }

    /// returns false if no such subscription existed
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut reg = lock(&self.registry);
        let before = reg.handlers.len();
        reg.handlers.retain(|(h, k, _)| !(*h == id && *k == kind));
        reg.handlers.len() != before
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| !d.is_finished())
    }

    /// start the driver. must be called inside a tokio runtime.
    /// a second call while running is ignored.
    pub fn connect(&mut self, url: impl Into<String>) {
        if self.is_running() {
            tracing::debug!("push channel already running");
            return;
        }

        lock(&self.registry).closed = false;
        self.cancel = CancellationToken::new();

        let driver = Driver {
            url: url.into(),
            options: self.options.clone(),
            registry: self.registry.clone(),
            state: self.state_tx.clone(),
            cancel: self.cancel.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    /// scoped teardown: stops the driver, drops every handler and waits for
    /// the transport to be released. no handler runs after this returns.
    pub async fn disconnect(&mut self) {
        {
            let mut reg = lock(&self.registry);
            reg.closed = true;
            reg.handlers.clear();
        }
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::warn!(error = %e, "push channel driver ended abnormally");
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!("push channel disconnected");
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        let mut reg = lock(&self.registry);
        reg.closed = true;
        reg.handlers.clear();
        drop(reg);
        self.cancel.cancel();
    }
}

// ==============================================================================
// driver task
// ==============================================================================

struct Driver {
    url: String,
    options: ChannelOptions,
    registry: SharedRegistry,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self) {
        let policy = self.options.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.open_first() => opened,
            };

            match opened {
                Ok((transport, stream)) => {
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    tracing::info!(url = %self.url, transport, "push channel connected");
                    dispatch(&self.registry, &ChannelEvent::Connect);

                    let Some(reason) = self.pump(stream).await else {
                        break;
                    };
                    self.state.send_replace(ConnectionState::Disconnected);
                    tracing::warn!(url = %self.url, %reason, "push channel lost");
                    dispatch(&self.registry, &ChannelEvent::Disconnect(reason));
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    tracing::warn!(url = %self.url, error = %e, "push channel connect failed");
                    dispatch(&self.registry, &ChannelEvent::ConnectError(e));
                }
            }

            if !policy.enabled {
                tracing::info!("reconnection disabled, push channel stays down");
                break;
            }
            attempt += 1;
            if policy.max_attempts.is_some_and(|max| attempt > max) {
                tracing::error!(attempts = attempt - 1, "giving up on push channel");
                break;
            }

            let delay = policy.delay(attempt - 1);
            tracing::debug!(attempt, delay_ms = delay.as_millis(), "reconnecting push channel");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn open_first(&self) -> Result<(&'static str, MessageStream), TransportError> {
        let mut failures = Vec::new();
        for transport in &self.options.transports {
            match transport.open(&self.url).await {
                Ok(stream) => return Ok((transport.name(), stream)),
                Err(e) => {
                    tracing::debug!(transport = transport.name(), error = %e, "transport failed to open");
                    failures.push((transport.name(), e));
                }
            }
        }

        if failures.len() == 1 {
            return Err(failures.remove(0).1);
        }
        let tried: Vec<String> = failures
            .iter()
            .map(|(name, e)| format!("{name}: {e}"))
            .collect();
        Err(TransportError::Exhausted(tried.join("; ")))
    }

    /// forward messages until the connection drops. `None` means cancelled.
    async fn pump(&self, mut stream: MessageStream) -> Option<String> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(msg)) => {
                    if let Some(event) = decode(msg) {
                        dispatch(&self.registry, &event);
                    }
                }
                // one unreadable frame is not a lost connection
                Some(Err(TransportError::Frame(e))) => {
                    tracing::warn!(error = %e, "dropping malformed push frame");
                }
                Some(Err(e)) => return Some(format!("transport error: {e}")),
                None => return Some("transport close".to_string()),
            }
        }
    }
}

/// wire message -> typed event. unknown names and malformed payloads are
/// dropped here so nothing half-parsed reaches the synchronizer.
fn decode(msg: WireMessage) -> Option<ChannelEvent> {
    match msg.event.as_str() {
        SENSOR_UPDATED | LEGACY_SENSOR_UPDATED => match DeltaEvent::from_payload(msg.data) {
            Ok(delta) => Some(ChannelEvent::SensorUpdated(delta)),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed sensor update");
                None
            }
        },
        other => {
            tracing::debug!(event = other, "ignoring unknown push event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SensorId;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, oneshot};

    type Feed = mpsc::UnboundedSender<Result<WireMessage, TransportError>>;
    type FeedRx = mpsc::UnboundedReceiver<Result<WireMessage, TransportError>>;

    enum Session {
        Refuse,
        Accept(FeedRx),
        /// accept only after the gate fires
        Gated(oneshot::Receiver<()>, FeedRx),
    }

    struct MockTransport {
        sessions: Mutex<VecDeque<Session>>,
        opens: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn new(sessions: Vec<Session>) -> (Arc<dyn Transport>, Arc<AtomicUsize>) {
            let opens = Arc::new(AtomicUsize::new(0));
            let t: Arc<dyn Transport> = Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                opens: opens.clone(),
            });
            (t, opens)
        }
    }

    fn feed_stream(rx: FeedRx) -> MessageStream {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed()
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn open(&self, _url: &str) -> Result<MessageStream, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let session = self.sessions.lock().unwrap().pop_front();
            match session {
                Some(Session::Accept(rx)) => Ok(feed_stream(rx)),
                Some(Session::Gated(gate, rx)) => {
                    let _ = gate.await;
                    Ok(feed_stream(rx))
                }
                Some(Session::Refuse) | None => {
                    Err(TransportError::Connection("connection refused".into()))
                }
            }
        }
    }

    fn fast() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: None,
        }
    }

    fn channel_with(transports: Vec<Arc<dyn Transport>>, policy: ReconnectPolicy) -> EventChannel {
        EventChannel::new(ChannelOptions::new(transports).with_reconnect(policy))
    }

    /// subscribe to every kind and forward into an mpsc
    fn record_all(channel: &EventChannel) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in [
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::ConnectError,
            EventKind::SensorUpdated,
        ] {
            let tx = tx.clone();
            channel.on(kind, move |e| {
                let _ = tx.send(e.clone());
            });
        }
        rx
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

    #[test]
    fn backoff_doubles_and_caps() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(1000));
        assert_eq!(p.delay(1), Duration::from_millis(2000));
        assert_eq!(p.delay(2), Duration::from_millis(4000));
        assert_eq!(p.delay(3), Duration::from_millis(5000));
        assert_eq!(p.delay(40), Duration::from_millis(5000));
    }

    #[test]
    fn decode_accepts_legacy_event_name() {
        let event = decode(WireMessage {
            event: LEGACY_SENSOR_UPDATED.into(),
            data: json!({ "id": 9, "deleted": true }),
        });
        assert_eq!(
            event,
            Some(ChannelEvent::SensorUpdated(DeltaEvent::Delete(SensorId::Num(9))))
        );
    }

    #[test]
    fn decode_drops_unknown_and_malformed() {
        assert_eq!(decode(WireMessage { event: "chat".into(), data: json!({}) }), None);
        assert_eq!(
            decode(WireMessage { event: SENSOR_UPDATED.into(), data: json!({ "status": "active" }) }),
            None
        );
    }

    #[tokio::test]
    async fn reconnects_and_keeps_subscribers() {
        let (feed1, rx1): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (feed2, rx2): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (gate, gate_rx) = oneshot::channel();
        let (transport, _) = MockTransport::new(vec![
            Session::Accept(rx1),
            Session::Gated(gate_rx, rx2),
        ]);

        let mut channel = channel_with(vec![transport], fast());
        let mut events = record_all(&channel);
        let mut states = channel.state_changes();
        channel.connect("mock://push");

        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));
        feed1.send(update(1, "active")).unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::SensorUpdated(DeltaEvent::Upsert(_)))
        ));

        // transport drop
        drop(feed1);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Disconnect(_))));

        // back in connecting without anyone asking
        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();
        gate.send(()).unwrap();

        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));
        assert_eq!(channel.state(), ConnectionState::Connected);

        // same subscribers still receive
        feed2.send(tombstone(1)).unwrap();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::SensorUpdated(DeltaEvent::Delete(SensorId::Num(1))))
        );

        channel.disconnect().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_error_is_reported_then_retried() {
        let (_feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (transport, opens) = MockTransport::new(vec![Session::Refuse, Session::Accept(rx)]);

        let mut channel = channel_with(vec![transport], fast());
        let mut events = record_all(&channel);
        channel.connect("mock://push");

        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::ConnectError(TransportError::Connection(_)))
        ));
        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn falls_back_to_next_transport() {
        let (_feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (preferred, preferred_opens) = MockTransport::new(vec![Session::Refuse]);
        let (fallback, _) = MockTransport::new(vec![Session::Accept(rx)]);

        let mut channel = channel_with(vec![preferred, fallback], fast());
        let mut events = record_all(&channel);
        channel.connect("mock://push");

        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));
        assert_eq!(preferred_opens.load(Ordering::SeqCst), 1);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn no_handler_runs_after_disconnect() {
        let (feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (transport, _) = MockTransport::new(vec![Session::Accept(rx)]);

        let mut channel = channel_with(vec![transport], fast());
        let mut events = record_all(&channel);
        channel.connect("mock://push");
        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));

        channel.disconnect().await;
        let _ = feed.send(update(2, "warning"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        // every handler (and its sender) is gone, so the stream just closes
        assert_eq!(events.recv().await, None);
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn off_removes_only_that_handler() {
        let (feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (transport, _) = MockTransport::new(vec![Session::Accept(rx)]);
        let mut channel = channel_with(vec![transport], fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = channel.on(EventKind::SensorUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut events = record_all(&channel);

        assert!(channel.off(EventKind::SensorUpdated, id));
        assert!(!channel.off(EventKind::SensorUpdated, id));

        channel.connect("mock://push");
        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));
        feed.send(update(3, "pending")).unwrap();
        assert!(matches!(events.recv().await, Some(ChannelEvent::SensorUpdated(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_updates_do_not_reach_handlers() {
        let (feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (transport, _) = MockTransport::new(vec![Session::Accept(rx)]);
        let mut channel = channel_with(vec![transport], fast());
        let mut events = record_all(&channel);
        channel.connect("mock://push");
        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));

        feed.send(Ok(WireMessage {
            event: SENSOR_UPDATED.into(),
            data: json!({ "status": "warning" }),
        }))
        .unwrap();
        feed.send(update(4, "warning")).unwrap();

        match events.recv().await {
            Some(ChannelEvent::SensorUpdated(DeltaEvent::Upsert(r))) => {
                assert_eq!(r.id, SensorId::Num(4));
            }
            other => panic!("unexpected {other:?}"),
        }

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn bad_frame_keeps_the_session() {
        let (feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (transport, opens) = MockTransport::new(vec![Session::Accept(rx)]);
        let mut channel = channel_with(vec![transport], fast());
        let mut events = record_all(&channel);
        channel.connect("mock://push");
        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));

        let mut parser = SseParser::default();
        for frame in parser.push(b"event: sensor_updated\ndata: {not json\n\n") {
            feed.send(frame).unwrap();
        }
        feed.send(update(5, "warning")).unwrap();

        // next event is the good update, not a disconnect
        match events.recv().await {
            Some(ChannelEvent::SensorUpdated(DeltaEvent::Upsert(r))) => {
                assert_eq!(r.id, SensorId::Num(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(channel.state(), ConnectionState::Connected);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn disabled_reconnect_stays_down() {
        let (feed, rx): (Feed, FeedRx) = mpsc::unbounded_channel();
        let (transport, opens) = MockTransport::new(vec![Session::Accept(rx)]);
        let policy = ReconnectPolicy {
            enabled: false,
            ..fast()
        };
        let mut channel = channel_with(vec![transport], policy);
        let mut events = record_all(&channel);
        channel.connect("mock://push");
        assert_eq!(events.recv().await, Some(ChannelEvent::Connect));

        drop(feed);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Disconnect(_))));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        channel.disconnect().await;
    }
}
