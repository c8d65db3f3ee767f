//! Managed connection state machine.
//!
//! Each [`Connection`] owns one [`ConnectionRecord`] behind a single mutex.
//! Application calls, transport events and timer callbacks all take that
//! lock to transition, so transitions are serialized per connection.
//!
//! Async work (opening the transport, pumping its events, waiting out a
//! backoff delay, replaying subscriptions) runs in spawned tasks that hold a
//! `Weak` reference and the record's `epoch` at spawn time. A task whose
//! epoch no longer matches is stale and drops its result; this covers the
//! window between a timer firing and a concurrent cancel.
//!
//! Must be used from within a Tokio runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lifeline_core::metrics::{
    RECONNECT_ATTEMPTS_TOTAL, STATE_TRANSITIONS_TOTAL, SUBSCRIPTION_RESTORES_TOTAL,
};
use lifeline_core::{
    ConnectionError, ConnectionId, ConnectionState, FrameKind, JsonCodec, MessageCodec,
    ObserverId, StateChange, TransportError,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::observers::{Notification, Observers};
use crate::registry::SubscriptionRegistry;
use crate::scheduler::{Plan, ReconnectScheduler, Timer};
use crate::transport::{Transport, TransportEvent, TransportEvents, TransportHandle};

use ConnectionState::{Closed, Closing, Connecting, Failed, Open, Reconnecting};

type OpenResult = Result<(Arc<dyn TransportHandle>, TransportEvents), TransportError>;

/// Mutable per-connection state. Only touched with the record lock held.
struct ConnectionRecord {
    state: ConnectionState,
    reconnect_attempt: u32,
    subscriptions: SubscriptionRegistry,
    handle: Option<Arc<dyn TransportHandle>>,
    /// Bumped whenever the live transport or attempt is abandoned.
    epoch: u64,
    retry_timer: Option<Timer>,
    close_timer: Option<Timer>,
    pending: VecDeque<Notification>,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self {
            state: Closed,
            reconnect_attempt: 0,
            subscriptions: SubscriptionRegistry::new(),
            handle: None,
            epoch: 0,
            retry_timer: None,
            close_timer: None,
            pending: VecDeque::new(),
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.pending.push_back(notification);
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
    }
}

struct Inner {
    id: ConnectionId,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn MessageCodec>,
    scheduler: ReconnectScheduler,
    record: Mutex<ConnectionRecord>,
    observers: Mutex<Observers>,
    dispatching: AtomicBool,
}

/// A managed client connection.
///
/// Cheap to clone; clones share the same connection. Dropping the last clone
/// cancels pending timers and closes the live transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Connection`].
///
/// Observers that call back into their own connection should capture one of
/// these rather than a [`Connection`] clone. A clone stored in an observer
/// keeps the connection alive, so dropping the last outside clone would never
/// close the transport.
#[derive(Clone, Debug)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    /// The connection, if any strong clone is still alive.
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a closed connection using the JSON control codec.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_codec(config, transport, Arc::new(JsonCodec))
    }

    /// Create a closed connection with a custom codec.
    pub fn with_codec(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let scheduler = ReconnectScheduler::new(&config.reconnect);
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::new(),
                config,
                transport,
                codec,
                scheduler,
                record: Mutex::new(ConnectionRecord::new()),
                observers: Mutex::new(Observers::default()),
                dispatching: AtomicBool::new(false),
            }),
        }
    }

    /// Connection identifier used in logs.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Non-owning handle for use inside observers.
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Configuration snapshot.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.record.lock().state
    }

    /// Retries performed in the current loss episode.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.record.lock().reconnect_attempt
    }

    /// Tracked channels, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.record.lock().subscriptions.snapshot()
    }

    /// Restoration passes started since creation.
    pub fn restore_count(&self) -> u64 {
        self.inner.record.lock().subscriptions.restores()
    }

    /// Whether a backoff timer is waiting to fire.
    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .record
            .lock()
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_cancelled() && !timer.is_finished())
    }

    /// Start connecting. Returns immediately.
    ///
    /// No-op while `connecting` or `open`. From `closed` or `failed` a new
    /// loss episode starts; from `reconnecting` the pending retry is replaced
    /// by an immediate attempt.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the connection without reconnecting. Returns immediately.
    ///
    /// From `open` the transport is asked to close and `closed` follows once
    /// it confirms (or the close timeout elapses). From `connecting` or
    /// `reconnecting` the attempt or pending retry is cancelled and the
    /// connection closes at once.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Send an application frame. Fails fast unless `open`.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), ConnectionError> {
        let record = self.inner.record.lock();
        let handle = match (record.state, record.handle.as_ref()) {
            (Open, Some(handle)) => handle,
            (state, _) => return Err(ConnectionError::NotConnected { state }),
        };
        handle.send(payload.into()).map_err(ConnectionError::from)
    }

    /// Track `channel`, requesting it right away if `open`.
    ///
    /// Returns `false` if the channel was already tracked.
    pub fn subscribe(&self, channel: &str) -> bool {
        let inner = &self.inner;
        let mut record = inner.record.lock();
        if !record.subscriptions.insert(channel) {
            return false;
        }
        match (record.state, record.handle.as_ref()) {
            (Open, Some(handle)) => match handle.send(inner.codec.encode_subscribe(channel)) {
                Ok(()) => record.subscriptions.mark_sent(channel),
                Err(err) => {
                    warn!(connection_id = %inner.id, channel, error = %err, "subscribe request failed, will retry after reconnect");
                }
            },
            (state, _) => {
                debug!(connection_id = %inner.id, channel, %state, "subscribe deferred until open");
            }
        }
        true
    }

    /// Stop tracking `channel`, telling the peer if `open`.
    ///
    /// Returns `false` if the channel was not tracked.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        let inner = &self.inner;
        let mut record = inner.record.lock();
        if !record.subscriptions.remove(channel) {
            return false;
        }
        if let (Open, Some(handle)) = (record.state, record.handle.as_ref()) {
            if let Err(err) = handle.send(inner.codec.encode_unsubscribe(channel)) {
                warn!(connection_id = %inner.id, channel, error = %err, "unsubscribe request failed");
            }
        }
        true
    }

    /// Observe every transition as `(old, new)`, in order.
    ///
    /// Observers are owned by the connection. One that needs to call back
    /// into it should capture [`downgrade`](Self::downgrade), not a clone.
    pub fn on_state_change<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.observers.lock().add_state(Arc::new(observer))
    }

    /// Observe inbound application frames.
    pub fn on_message<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.observers.lock().add_message(Arc::new(observer))
    }

    /// Observe classified closes and failures.
    pub fn on_error<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.inner.observers.lock().add_error(Arc::new(observer))
    }

    /// Detach an observer. Returns `false` if `id` is unknown.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.lock().remove(id)
    }
}

impl Inner {
    fn connect(self: &Arc<Self>) {
        let mut record = self.record.lock();
        match record.state {
            Connecting | Open => {
                debug!(connection_id = %self.id, state = %record.state, "connect ignored");
                return;
            }
            Closed | Failed => record.reconnect_attempt = 0,
            Reconnecting => record.cancel_retry(),
            Closing => {
                record.close_timer = None;
                if let Some(handle) = record.handle.take() {
                    handle.close();
                }
            }
        }
        info!(connection_id = %self.id, endpoint = %self.config.endpoint, "connecting");
        self.begin_attempt(&mut record);
        drop(record);
        self.dispatch();
    }

    fn disconnect(self: &Arc<Self>) {
        let mut record = self.record.lock();
        match record.state {
            Open => {
                self.transition(&mut record, Closing);
                if let Some(handle) = record.handle.as_ref() {
                    handle.close();
                }
                let epoch = record.epoch;
                let weak = Arc::downgrade(self);
                record.close_timer = Some(Timer::start(self.config.close_timeout, move || {
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.close_timed_out(epoch);
                        }
                    }
                }));
                info!(connection_id = %self.id, "closing");
            }
            Connecting | Reconnecting => {
                record.cancel_retry();
                record.epoch += 1;
                self.transition(&mut record, Closing);
                self.transition(&mut record, Closed);
                record.notify(Notification::Error(ConnectionError::GracefulClose));
                info!(connection_id = %self.id, "connection attempt abandoned");
            }
            state => {
                debug!(connection_id = %self.id, %state, "disconnect ignored");
                return;
            }
        }
        drop(record);
        self.dispatch();
    }

    fn transition(&self, record: &mut ConnectionRecord, next: ConnectionState) {
        let old = record.state;
        if !old.can_transition_to(next) {
            warn!(connection_id = %self.id, %old, new = %next, "unexpected transition");
        }
        record.state = next;
        record.notify(Notification::State(StateChange::new(old, next)));
        debug!(
            connection_id = %self.id,
            %old,
            new = %next,
            attempt = record.reconnect_attempt,
            "state transition"
        );
        metrics::counter!(STATE_TRANSITIONS_TOTAL, "from" => old.as_str(), "to" => next.as_str())
            .increment(1);
    }

    fn begin_attempt(self: &Arc<Self>, record: &mut ConnectionRecord) {
        record.epoch += 1;
        let epoch = record.epoch;
        self.transition(record, Connecting);

        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        let endpoint = self.config.endpoint.clone();
        drop(tokio::spawn(async move {
            let result = transport.open(&endpoint).await;
            match weak.upgrade() {
                Some(inner) => inner.finish_open(epoch, result),
                None => {
                    if let Ok((handle, _)) = result {
                        handle.close();
                    }
                }
            }
        }));
    }

    fn finish_open(self: &Arc<Self>, epoch: u64, result: OpenResult) {
        let mut record = self.record.lock();
        if record.epoch != epoch || record.state != Connecting {
            drop(record);
            if let Ok((handle, _)) = result {
                debug!(connection_id = %self.id, "discarding transport from abandoned attempt");
                handle.close();
            }
            return;
        }
        match result {
            Ok((handle, events)) => self.opened(&mut record, epoch, handle, events),
            Err(err) => self.open_failed(&mut record, err),
        }
        drop(record);
        self.dispatch();
    }

    fn opened(
        self: &Arc<Self>,
        record: &mut ConnectionRecord,
        epoch: u64,
        handle: Arc<dyn TransportHandle>,
        events: TransportEvents,
    ) {
        let prior_attempt = record.reconnect_attempt;
        record.reconnect_attempt = 0;
        record.handle = Some(handle);
        record.subscriptions.reset_sent();
        self.transition(record, Open);
        info!(connection_id = %self.id, endpoint = %self.config.endpoint, prior_attempt, "connection open");

        self.spawn_event_pump(epoch, events);

        let channels = record.subscriptions.snapshot();
        if prior_attempt > 0 {
            record.subscriptions.record_restore();
            metrics::counter!(SUBSCRIPTION_RESTORES_TOTAL).increment(1);
            info!(connection_id = %self.id, channels = channels.len(), "restoring subscriptions");
            self.spawn_replay(epoch, channels);
        } else if !channels.is_empty() {
            debug!(connection_id = %self.id, channels = channels.len(), "sending deferred subscriptions");
            self.spawn_replay(epoch, channels);
        }
    }

    fn open_failed(self: &Arc<Self>, record: &mut ConnectionRecord, err: TransportError) {
        warn!(
            connection_id = %self.id,
            endpoint = %self.config.endpoint,
            attempt = record.reconnect_attempt,
            error = %err,
            "connect failed"
        );
        record.notify(Notification::Error(ConnectionError::ConnectFailure(err)));
        if self.scheduler.enabled() && self.scheduler.has_attempts_left(record.reconnect_attempt) {
            self.transition(record, Reconnecting);
            self.schedule_retry(record);
        } else {
            self.transition(record, Failed);
            if self.scheduler.enabled() {
                let attempts = record.reconnect_attempt;
                self.gave_up(record, attempts);
            }
        }
    }

    /// Called on `reconnecting` entry.
    fn schedule_retry(self: &Arc<Self>, record: &mut ConnectionRecord) {
        match self.scheduler.plan(record.reconnect_attempt) {
            Plan::GiveUp { attempts } => {
                self.transition(record, Failed);
                self.gave_up(record, attempts);
            }
            Plan::Retry { attempt, delay } => {
                let epoch = record.epoch;
                let weak = Arc::downgrade(self);
                record.retry_timer = Some(Timer::start(delay, move || async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.retry_fired(epoch);
                    }
                }));
                record.reconnect_attempt = attempt + 1;
                metrics::counter!(RECONNECT_ATTEMPTS_TOTAL).increment(1);
                info!(
                    connection_id = %self.id,
                    attempt,
                    delay_ms = millis(delay),
                    "reconnect scheduled"
                );
            }
        }
    }

    fn gave_up(&self, record: &mut ConnectionRecord, attempts: u32) {
        warn!(connection_id = %self.id, attempts, "reconnect attempts exhausted");
        record.notify(Notification::Error(ConnectionError::MaxAttemptsExceeded { attempts }));
    }

    fn retry_fired(self: &Arc<Self>, epoch: u64) {
        let mut record = self.record.lock();
        if record.epoch != epoch || record.state != Reconnecting {
            trace!(connection_id = %self.id, "stale retry timer");
            return;
        }
        record.retry_timer = None;
        self.begin_attempt(&mut record);
        drop(record);
        self.dispatch();
    }

    fn close_timed_out(&self, epoch: u64) {
        let mut record = self.record.lock();
        if record.epoch != epoch || record.state != Closing {
            return;
        }
        record.close_timer = None;
        record.epoch += 1;
        let handle = record.handle.take();
        warn!(
            connection_id = %self.id,
            timeout_ms = millis(self.config.close_timeout),
            "close not confirmed in time, forcing closed"
        );
        self.transition(&mut record, Closed);
        record.notify(Notification::Error(ConnectionError::GracefulClose));
        drop(record);
        drop(handle);
        self.dispatch();
    }

    fn spawn_event_pump(self: &Arc<Self>, epoch: u64, mut events: TransportEvents) {
        let weak: Weak<Self> = Arc::downgrade(self);
        drop(tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let current = match event {
                    Some(TransportEvent::Opened) => true,
                    Some(TransportEvent::Message(frame)) => inner.frame_received(epoch, frame),
                    Some(TransportEvent::Closed(code)) => {
                        inner.transport_closed(epoch, code, None);
                        false
                    }
                    Some(TransportEvent::Error(err)) => {
                        inner.transport_closed(epoch, None, Some(err));
                        false
                    }
                    None => {
                        inner.transport_closed(epoch, None, None);
                        false
                    }
                };
                if !current {
                    return;
                }
            }
        }));
    }

    /// Returns `false` once the pump's epoch is stale.
    fn frame_received(&self, epoch: u64, frame: Vec<u8>) -> bool {
        let mut record = self.record.lock();
        if record.epoch != epoch {
            return false;
        }
        match self.codec.classify(&frame) {
            FrameKind::Probe if self.config.heartbeat.auto_respond => {
                if let Some(handle) = record.handle.as_ref() {
                    if let Err(err) = handle.send(self.codec.encode_probe_ack()) {
                        debug!(connection_id = %self.id, error = %err, "probe ack not sent");
                    }
                }
            }
            FrameKind::ProbeAck => {
                trace!(connection_id = %self.id, "probe ack ignored");
            }
            FrameKind::Probe | FrameKind::Data => {
                record.notify(Notification::Message(frame));
            }
        }
        drop(record);
        self.dispatch();
        true
    }

    fn transport_closed(
        self: &Arc<Self>,
        epoch: u64,
        code: Option<u16>,
        error: Option<TransportError>,
    ) {
        let mut record = self.record.lock();
        if record.epoch != epoch {
            return;
        }
        let handle = match record.state {
            Closing => {
                record.close_timer = None;
                record.epoch += 1;
                let handle = record.handle.take();
                self.transition(&mut record, Closed);
                record.notify(Notification::Error(ConnectionError::GracefulClose));
                info!(connection_id = %self.id, ?code, "connection closed");
                handle
            }
            Open => {
                record.epoch += 1;
                let handle = record.handle.take();
                if let Some(err) = error {
                    warn!(connection_id = %self.id, error = %err, "transport error");
                    record.notify(Notification::Error(ConnectionError::Transport(err)));
                }
                warn!(connection_id = %self.id, ?code, "connection lost");
                record.notify(Notification::Error(ConnectionError::UnexpectedClose { code }));
                if self.scheduler.enabled() {
                    self.transition(&mut record, Reconnecting);
                    self.schedule_retry(&mut record);
                } else {
                    self.transition(&mut record, Closed);
                }
                handle
            }
            state => {
                trace!(connection_id = %self.id, %state, "close event ignored");
                return;
            }
        };
        drop(record);
        if let Some(handle) = handle {
            handle.close();
        }
        self.dispatch();
    }

    fn spawn_replay(self: &Arc<Self>, epoch: u64, channels: Vec<String>) {
        let weak = Arc::downgrade(self);
        let pacing = self.config.restore_pacing;
        drop(tokio::spawn(async move {
            for (index, channel) in channels.iter().enumerate() {
                if index > 0 && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.replay_one(epoch, channel) {
                    return;
                }
            }
        }));
    }

    /// Send one subscribe request of a replay pass. Returns `false` to stop
    /// the pass; channels not yet sent stay tracked for the next reconnect.
    fn replay_one(&self, epoch: u64, channel: &str) -> bool {
        let mut record = self.record.lock();
        if record.epoch != epoch || record.state != Open {
            return false;
        }
        if !record.subscriptions.contains(channel) || record.subscriptions.was_sent(channel) {
            return true;
        }
        let Some(handle) = record.handle.clone() else {
            return false;
        };
        match handle.send(self.codec.encode_subscribe(channel)) {
            Ok(()) => {
                record.subscriptions.mark_sent(channel);
                trace!(connection_id = %self.id, channel, "subscription sent");
                true
            }
            Err(source) => {
                warn!(
                    connection_id = %self.id,
                    channel,
                    error = %source,
                    "failed to restore subscription, retrying on next reconnect"
                );
                record.notify(Notification::Error(ConnectionError::RestoreSendFailure {
                    channel: channel.to_owned(),
                    source,
                }));
                drop(record);
                self.dispatch();
                false
            }
        }
    }

    /// Deliver queued notifications with no lock held.
    fn dispatch(&self) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // the active drainer picks up whatever was queued
                return;
            }
            let guard = DispatchGuard(&self.dispatching);
            loop {
                let next = self.record.lock().pending.pop_front();
                let Some(notification) = next else {
                    break;
                };
                let targets = self.observers.lock().targets(&notification);
                targets.deliver(&notification);
            }
            drop(guard);
            if self.record.lock().pending.is_empty() {
                return;
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let record = self.record.get_mut();
        record.retry_timer = None;
        record.close_timer = None;
        if let Some(handle) = record.handle.take() {
            handle.close();
        }
    }
}

/// Clears the dispatching flag even if an observer panics.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use assert_matches::assert_matches;
    use lifeline_settings::ReconnectPolicy;

    type Log<T> = Arc<Mutex<Vec<T>>>;

    fn config(reconnect: ReconnectPolicy) -> ClientConfig {
        ClientConfig::default()
            .with_endpoint("ws://mock/ws")
            .with_reconnect(reconnect)
            .with_restore_pacing(Duration::ZERO)
    }

    fn steady_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter_ratio: 0.0,
            ..ReconnectPolicy::default()
        }
    }

    fn setup(reconnect: ReconnectPolicy) -> (Connection, MockTransport, Log<(ConnectionState, ConnectionState)>) {
        let transport = MockTransport::new();
        let conn = Connection::new(config(reconnect), Arc::new(transport.clone()));
        let changes: Log<_> = Arc::default();
        let sink = changes.clone();
        let _ = conn.on_state_change(move |old, new| sink.lock().push((old, new)));
        (conn, transport, changes)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_open() {
        let (conn, transport, changes) = setup(steady_policy());
        conn.connect();
        settle().await;

        assert_eq!(conn.state(), Open);
        assert_eq!(conn.reconnect_attempt(), 0);
        assert_eq!(transport.endpoints(), vec!["ws://mock/ws"]);
        assert_eq!(*changes.lock(), vec![(Closed, Connecting), (Connecting, Open)]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_noop_while_connecting_or_open() {
        let (conn, transport, changes) = setup(steady_policy());
        transport.set_open_delay(Duration::from_millis(50));
        conn.connect();
        conn.connect();
        tokio::time::sleep(Duration::from_millis(60)).await;
        conn.connect();
        settle().await;

        assert_eq!(transport.open_count(), 1);
        assert_eq!(changes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_open() {
        let (conn, transport, _) = setup(steady_policy());
        assert_matches!(
            conn.send(b"early".to_vec()),
            Err(ConnectionError::NotConnected { state: Closed })
        );

        conn.connect();
        settle().await;
        conn.send(b"hello".to_vec()).unwrap();
        assert_eq!(transport.last_session().unwrap().sent(), vec![b"hello".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_surfaces_transport_failure() {
        let (conn, transport, _) = setup(steady_policy());
        conn.connect();
        settle().await;
        transport.last_session().unwrap().limit_sends(Some(0));
        assert_matches!(
            conn.send(b"x".to_vec()),
            Err(ConnectionError::Transport(TransportError::Send(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_disconnect_never_reconnects() {
        let (conn, transport, changes) = setup(steady_policy());
        conn.connect();
        settle().await;

        conn.disconnect();
        assert_eq!(conn.state(), Closing);
        settle().await;

        assert_eq!(conn.state(), Closed);
        assert!(!conn.has_pending_retry());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(
            *changes.lock(),
            vec![(Closed, Connecting), (Connecting, Open), (Open, Closing), (Closing, Closed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_without_reconnect_closes() {
        let (conn, transport, changes) = setup(ReconnectPolicy::disabled());
        conn.connect();
        settle().await;

        transport.last_session().unwrap().drop_connection(Some(1011));
        settle().await;

        assert_eq!(conn.state(), Closed);
        assert_eq!(changes.lock().last(), Some(&(Open, Closed)));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_enters_reconnecting() {
        let (conn, transport, _) = setup(steady_policy());
        let errors: Log<ConnectionError> = Arc::default();
        let sink = errors.clone();
        let _ = conn.on_error(move |err| sink.lock().push(err.clone()));
        conn.connect();
        settle().await;

        transport.last_session().unwrap().drop_connection(None);
        settle().await;

        assert_eq!(conn.state(), Reconnecting);
        assert_eq!(conn.reconnect_attempt(), 1);
        assert!(conn.has_pending_retry());
        assert_eq!(
            *errors.lock(),
            vec![ConnectionError::UnexpectedClose { code: None }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_counts_as_unexpected_close() {
        let (conn, transport, _) = setup(steady_policy());
        conn.connect();
        settle().await;

        transport
            .last_session()
            .unwrap()
            .emit(TransportEvent::Error(TransportError::Protocol("reset".into())));
        settle().await;

        assert_eq!(conn.state(), Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn close_timeout_forces_closed() {
        let (conn, transport, _) = setup(steady_policy());
        transport.hold_close(true);
        conn.connect();
        settle().await;

        conn.disconnect();
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(conn.state(), Closing);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.state(), Closed);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_abandons_attempt() {
        let (conn, transport, changes) = setup(steady_policy());
        transport.set_open_delay(Duration::from_millis(100));
        conn.connect();
        conn.disconnect();
        assert_eq!(conn.state(), Closed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.state(), Closed);
        assert!(transport.last_session().unwrap().is_closed());
        assert_eq!(
            *changes.lock(),
            vec![(Closed, Connecting), (Connecting, Closing), (Closing, Closed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_when_closed_is_noop() {
        let (conn, _, changes) = setup(steady_policy());
        conn.disconnect();
        assert_eq!(conn.state(), Closed);
        assert!(changes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probes_are_answered_not_surfaced() {
        let (conn, transport, _) = setup(steady_policy());
        let frames: Log<Vec<u8>> = Arc::default();
        let sink = frames.clone();
        let _ = conn.on_message(move |frame| sink.lock().push(frame.to_vec()));
        conn.connect();
        settle().await;

        let session = transport.last_session().unwrap();
        session.deliver(br#"{"type":"ping"}"#.to_vec());
        session.deliver(b"payload".to_vec());
        settle().await;

        assert_eq!(session.probe_acks(), 1);
        assert_eq!(*frames.lock(), vec![b"payload".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_surface_when_auto_respond_is_off() {
        let transport = MockTransport::new();
        let conn = Connection::new(
            config(steady_policy()).with_auto_respond(false),
            Arc::new(transport.clone()),
        );
        let frames: Log<Vec<u8>> = Arc::default();
        let sink = frames.clone();
        let _ = conn.on_message(move |frame| sink.lock().push(frame.to_vec()));
        conn.connect();
        settle().await;

        let session = transport.last_session().unwrap();
        session.deliver(br#"{"type":"ping"}"#.to_vec());
        settle().await;

        assert_eq!(session.probe_acks(), 0);
        assert_eq!(frames.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_may_reenter() {
        let (conn, _, changes) = setup(steady_policy());
        let handle = conn.downgrade();
        let _ = conn.on_state_change(move |_, new| {
            if let (Open, Some(conn)) = (new, handle.upgrade()) {
                conn.disconnect();
            }
        });
        conn.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(conn.state(), Closed);
        assert_eq!(
            *changes.lock(),
            vec![(Closed, Connecting), (Connecting, Open), (Open, Closing), (Closing, Closed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removed_observer_is_not_called() {
        let (conn, _, _) = setup(steady_policy());
        let calls: Log<ConnectionState> = Arc::default();
        let sink = calls.clone();
        let id = conn.on_state_change(move |_, new| sink.lock().push(new));
        assert!(conn.remove_observer(id));
        conn.connect();
        settle().await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_subscriptions_flush_on_first_open() {
        let (conn, transport, _) = setup(steady_policy());
        assert!(conn.subscribe("rooms.b"));
        assert!(conn.subscribe("rooms.a"));
        assert!(!conn.subscribe("rooms.a"));
        conn.connect();
        settle().await;

        let session = transport.last_session().unwrap();
        assert_eq!(session.subscribes(), vec!["rooms.a", "rooms.b"]);
        assert_eq!(conn.restore_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_open_sends_immediately() {
        let (conn, transport, _) = setup(steady_policy());
        conn.connect();
        settle().await;

        assert!(conn.subscribe("alerts"));
        assert!(conn.unsubscribe("alerts"));
        assert!(!conn.unsubscribe("alerts"));

        let session = transport.last_session().unwrap();
        assert_eq!(session.subscribes(), vec!["alerts"]);
        assert_eq!(session.unsubscribes(), vec!["alerts"]);
        assert!(conn.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_without_reconnect_fails() {
        let (conn, transport, changes) = setup(ReconnectPolicy::disabled());
        transport.fail_next(1);
        conn.connect();
        settle().await;

        assert_eq!(conn.state(), Failed);
        assert_eq!(changes.lock().last(), Some(&(Connecting, Failed)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_from_failed_starts_new_episode() {
        let (conn, transport, _) = setup(ReconnectPolicy::disabled());
        transport.fail_next(1);
        conn.connect();
        settle().await;
        assert_eq!(conn.state(), Failed);

        conn.connect();
        settle().await;
        assert_eq!(conn.state(), Open);
        assert_eq!(conn.reconnect_attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_reconnecting_retries_now() {
        let (conn, transport, _) = setup(steady_policy());
        conn.connect();
        settle().await;
        transport.last_session().unwrap().drop_connection(None);
        settle().await;
        assert_eq!(conn.state(), Reconnecting);

        conn.connect();
        assert!(!conn.has_pending_retry());
        settle().await;
        assert_eq!(conn.state(), Open);
        assert_eq!(transport.open_count(), 2);
        assert_eq!(conn.restore_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_during_paced_flush_is_sent_once() {
        let transport = MockTransport::new();
        let conn = Connection::new(
            config(steady_policy()).with_restore_pacing(Duration::from_millis(100)),
            Arc::new(transport.clone()),
        );
        let _ = conn.subscribe("a");
        let _ = conn.subscribe("b");
        conn.connect();
        settle().await;

        assert!(conn.unsubscribe("b"));
        assert!(conn.subscribe("b"));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let session = transport.last_session().unwrap();
        assert_eq!(session.subscribes(), vec!["a", "b"]);
        assert_eq!(session.unsubscribes(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_during_paced_restore_is_sent_once() {
        let transport = MockTransport::new();
        let conn = Connection::new(
            config(steady_policy()).with_restore_pacing(Duration::from_millis(100)),
            Arc::new(transport.clone()),
        );
        for channel in ["a", "b", "c"] {
            let _ = conn.subscribe(channel);
        }
        conn.connect();
        tokio::time::sleep(Duration::from_millis(300)).await;

        transport.last_session().unwrap().drop_connection(None);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(conn.state(), Open);
        assert!(conn.unsubscribe("c"));
        assert!(conn.subscribe("c"));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let session = transport.last_session().unwrap();
        let sent = session.subscribes();
        assert_eq!(sent.iter().filter(|c| *c == "c").count(), 1);
        assert_eq!(sent.len(), 3);
        assert_eq!(conn.restore_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_with_weak_handle_does_not_keep_connection_alive() {
        let (conn, transport, _) = setup(steady_policy());
        let handle = conn.downgrade();
        let _ = conn.on_state_change(move |_, _| {
            let _ = handle.upgrade().map(|conn| conn.state());
        });
        conn.connect();
        settle().await;
        let session = transport.last_session().unwrap();
        let weak = conn.downgrade();

        drop(conn);
        settle().await;
        assert!(weak.upgrade().is_none());
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_connection_closes_transport() {
        let (conn, transport, _) = setup(steady_policy());
        conn.connect();
        settle().await;
        let session = transport.last_session().unwrap();

        drop(conn);
        settle().await;
        assert!(session.is_closed());
    }
}
