//! Heartbeat liveness monitoring.
//!
//! One [`HeartbeatMonitor`] owns a [`HeartbeatRecord`] per tracked connection.
//! Every tick it walks a snapshot of the table: a connection that has been
//! silent for longer than the timeout is force-closed and dropped, every other
//! connection gets a probe. The two are exclusive within a tick.
//!
//! Each entry sits behind its own mutex. A tick holds that mutex only while it
//! probes or evicts that one entry, and [`untrack`](HeartbeatMonitor::untrack)
//! marks the entry removed under the same mutex, so once `untrack` returns no
//! further probe reaches the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lifeline_core::metrics::{CONNECTIONS_ACTIVE, HEARTBEAT_EVICTIONS_TOTAL, HEARTBEAT_PROBES_TOTAL};
use lifeline_core::{ConnectionId, JsonCodec, MessageCodec};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// The monitor's view of a connection.
pub trait Peer: Send + Sync {
    /// Queue a probe frame without blocking. Returns `false` if it could not be
    /// queued.
    fn send_probe(&self, frame: &[u8]) -> bool;

    /// Close the connection immediately, without a close handshake.
    fn force_close(&self);
}

/// Liveness bookkeeping for one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// Last acknowledgment, or the moment tracking started.
    pub last_pong_at: Instant,
    /// Most recent probe that was queued.
    pub ping_sent_at: Option<Instant>,
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections that were sent a probe.
    pub probed: usize,
    /// Connections that were evicted.
    pub evicted: Vec<ConnectionId>,
}

struct Entry {
    record: HeartbeatRecord,
    removed: bool,
    peer: Arc<dyn Peer>,
}

/// Probes tracked connections and evicts the silent ones.
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    codec: Arc<dyn MessageCodec>,
    entries: RwLock<HashMap<ConnectionId, Arc<Mutex<Entry>>>>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("tracked", &self.len())
            .finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    /// Monitor speaking the default JSON control frames.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self::with_codec(interval, timeout, Arc::new(JsonCodec))
    }

    /// Monitor encoding probes with `codec`.
    pub fn with_codec(interval: Duration, timeout: Duration, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            interval,
            timeout,
            codec,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Eviction timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start monitoring `peer` as of now.
    pub fn track(&self, id: ConnectionId, peer: Arc<dyn Peer>) {
        self.track_at(id, peer, Instant::now());
    }

    /// Start monitoring `peer`, treating `now` as its last acknowledgment.
    pub fn track_at(&self, id: ConnectionId, peer: Arc<dyn Peer>, now: Instant) {
        let entry = Arc::new(Mutex::new(Entry {
            record: HeartbeatRecord {
                last_pong_at: now,
                ping_sent_at: None,
            },
            removed: false,
            peer,
        }));
        let tracked = {
            let mut entries = self.entries.write();
            if let Some(previous) = entries.insert(id.clone(), entry) {
                previous.lock().removed = true;
            }
            entries.len()
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!(CONNECTIONS_ACTIVE).set(tracked as f64);
        debug!(connection_id = %id, tracked, "heartbeat tracking started");
    }

    /// Record a probe acknowledgment. Returns `false` for unknown connections.
    pub fn record_ack(&self, id: &ConnectionId) -> bool {
        self.record_ack_at(id, Instant::now())
    }

    /// Record a probe acknowledgment received at `now`.
    pub fn record_ack_at(&self, id: &ConnectionId, now: Instant) -> bool {
        let Some(entry) = self.entries.read().get(id).cloned() else {
            return false;
        };
        let mut entry = entry.lock();
        if entry.removed {
            return false;
        }
        entry.record.last_pong_at = now;
        trace!(connection_id = %id, "probe acknowledged");
        true
    }

    /// Stop monitoring `id`. Returns `false` if it was not tracked.
    pub fn untrack(&self, id: &ConnectionId) -> bool {
        let (removed, tracked) = {
            let mut entries = self.entries.write();
            let removed = entries.remove(id);
            (removed, entries.len())
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.lock().removed = true;
        #[allow(clippy::cast_precision_loss)]
        gauge!(CONNECTIONS_ACTIVE).set(tracked as f64);
        debug!(connection_id = %id, tracked, "heartbeat tracking stopped");
        true
    }

    /// Current record for `id`.
    pub fn snapshot(&self, id: &ConnectionId) -> Option<HeartbeatRecord> {
        let entry = self.entries.read().get(id).cloned()?;
        let entry = entry.lock();
        (!entry.removed).then_some(entry.record)
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run one tick as of now.
    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// Run one tick as of `now`.
    pub fn tick_at(&self, now: Instant) -> TickReport {
        let snapshot: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        let probe = self.codec.encode_probe();
        let mut report = TickReport::default();

        for (id, entry) in snapshot {
            let mut entry = entry.lock();
            if entry.removed {
                continue;
            }
            let silent = now.saturating_duration_since(entry.record.last_pong_at);
            if silent > self.timeout {
                entry.removed = true;
                entry.peer.force_close();
                warn!(
                    connection_id = %id,
                    silent_ms = silent.as_millis(),
                    "evicting unresponsive connection"
                );
                report.evicted.push(id);
            } else if entry.peer.send_probe(&probe) {
                entry.record.ping_sent_at = Some(now);
                report.probed += 1;
            } else {
                debug!(connection_id = %id, "probe not queued");
            }
        }

        if !report.evicted.is_empty() {
            let tracked = {
                let mut entries = self.entries.write();
                for id in &report.evicted {
                    let stale = entries.get(id).is_some_and(|e| e.lock().removed);
                    if stale {
                        let _ = entries.remove(id);
                    }
                }
                entries.len()
            };
            counter!(HEARTBEAT_EVICTIONS_TOTAL).increment(report.evicted.len() as u64);
            #[allow(clippy::cast_precision_loss)]
            gauge!(CONNECTIONS_ACTIVE).set(tracked as f64);
        }
        counter!(HEARTBEAT_PROBES_TOTAL).increment(report.probed as u64);
        report
    }

    /// Tick every `interval` until `cancel` fires.
    ///
    /// The first tick happens one full interval after the call.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let start = Instant::now() + monitor.interval;
            let mut ticker = tokio::time::interval_at(start, monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_ms = monitor.interval.as_millis(), "heartbeat monitor started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("heartbeat monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let report = monitor.tick();
                        trace!(probed = report.probed, evicted = report.evicted.len(), "heartbeat tick");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::websocket::connection::MonitoredConnection;
    use lifeline_core::FrameKind;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakePeer {
        probes: AtomicUsize,
        closed: AtomicBool,
        refuse: AtomicBool,
    }

    impl Peer for FakePeer {
        fn send_probe(&self, _frame: &[u8]) -> bool {
            if self.refuse.load(Ordering::SeqCst) {
                return false;
            }
            let _ = self.probes.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn force_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl FakePeer {
        fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(ms(2000), ms(5000))
    }

    #[test]
    fn track_seeds_last_pong() {
        let m = monitor();
        let id = ConnectionId::from("c1");
        let t0 = Instant::now();
        m.track_at(id.clone(), Arc::new(FakePeer::default()), t0);

        let record = m.snapshot(&id).unwrap();
        assert_eq!(record.last_pong_at, t0);
        assert_eq!(record.ping_sent_at, None);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn silent_connection_evicted_on_third_tick() {
        let m = monitor();
        let id = ConnectionId::from("silent");
        let peer = Arc::new(FakePeer::default());
        let t0 = Instant::now();
        m.track_at(id.clone(), peer.clone(), t0);

        assert_eq!(m.tick_at(t0 + ms(2000)).probed, 1);
        assert_eq!(m.tick_at(t0 + ms(4000)).probed, 1);
        let report = m.tick_at(t0 + ms(6000));

        assert_eq!(report.probed, 0);
        assert_eq!(report.evicted, vec![id.clone()]);
        assert_eq!(peer.probes(), 2);
        assert!(peer.is_closed());
        assert!(!m.contains(&id));
    }

    #[test]
    fn acknowledging_connection_survives_ten_ticks() {
        let m = monitor();
        let id = ConnectionId::from("chatty");
        let peer = Arc::new(FakePeer::default());
        let t0 = Instant::now();
        m.track_at(id.clone(), peer.clone(), t0);

        for n in 1..=10 {
            let now = t0 + ms(2000 * n);
            let report = m.tick_at(now);
            assert!(report.evicted.is_empty(), "tick {n}");
            assert!(m.record_ack_at(&id, now + ms(50)));
        }
        assert_eq!(peer.probes(), 10);
        assert!(!peer.is_closed());
    }

    #[test]
    fn silence_equal_to_timeout_is_not_evicted() {
        let m = monitor();
        let id = ConnectionId::from("edge");
        let t0 = Instant::now();
        m.track_at(id.clone(), Arc::new(FakePeer::default()), t0);

        let report = m.tick_at(t0 + ms(5000));
        assert!(report.evicted.is_empty());
        assert_eq!(report.probed, 1);
    }

    #[test]
    fn probe_time_recorded_only_when_queued() {
        let m = monitor();
        let id = ConnectionId::from("full");
        let peer = Arc::new(FakePeer::default());
        peer.refuse.store(true, Ordering::SeqCst);
        let t0 = Instant::now();
        m.track_at(id.clone(), peer.clone(), t0);

        assert_eq!(m.tick_at(t0 + ms(2000)).probed, 0);
        assert_eq!(m.snapshot(&id).unwrap().ping_sent_at, None);

        peer.refuse.store(false, Ordering::SeqCst);
        let _ = m.tick_at(t0 + ms(4000));
        assert_eq!(m.snapshot(&id).unwrap().ping_sent_at, Some(t0 + ms(4000)));
    }

    #[test]
    fn untracked_connection_is_never_probed() {
        let m = monitor();
        let id = ConnectionId::from("gone");
        let peer = Arc::new(FakePeer::default());
        let t0 = Instant::now();
        m.track_at(id.clone(), peer.clone(), t0);

        assert!(m.untrack(&id));
        assert!(!m.untrack(&id));
        let report = m.tick_at(t0 + ms(2000));

        assert_eq!(report, TickReport::default());
        assert_eq!(peer.probes(), 0);
        assert!(!m.record_ack(&id));
        assert!(m.snapshot(&id).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn retracking_an_id_replaces_the_old_peer() {
        let m = monitor();
        let id = ConnectionId::from("dup");
        let old = Arc::new(FakePeer::default());
        let new = Arc::new(FakePeer::default());
        let t0 = Instant::now();
        m.track_at(id.clone(), old.clone(), t0);
        m.track_at(id.clone(), new.clone(), t0);

        let _ = m.tick_at(t0 + ms(2000));
        assert_eq!(old.probes(), 0);
        assert_eq!(new.probes(), 1);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn probes_use_codec_ping() {
        let m = monitor();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Arc::new(MonitoredConnection::new(ConnectionId::from("c"), tx));
        let t0 = Instant::now();
        m.track_at(conn.id().clone(), conn, t0);

        let _ = m.tick_at(t0 + ms(2000));
        let frame = rx.try_recv().unwrap();
        assert_eq!(JsonCodec.classify(&frame), FrameKind::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_evicts_silent_connection_after_third_tick() {
        let m = Arc::new(monitor());
        let id = ConnectionId::from("silent");
        let peer = Arc::new(FakePeer::default());
        m.track(id.clone(), peer.clone());
        let cancel = CancellationToken::new();
        let task = m.spawn(cancel.clone());

        tokio::time::sleep(ms(5900)).await;
        assert_eq!(peer.probes(), 2);
        assert!(m.contains(&id));

        tokio::time::sleep(ms(200)).await;
        assert!(peer.is_closed());
        assert!(!m.contains(&id));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_keeps_responsive_connection() {
        let m = Arc::new(monitor());
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(MonitoredConnection::new(ConnectionId::from("echo"), tx));
        let id = conn.id().clone();
        m.track(id.clone(), conn.clone());

        let responder = {
            let m = m.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut answered = 0;
                while let Some(frame) = rx.recv().await {
                    if JsonCodec.classify(&frame) == FrameKind::Probe {
                        let _ = m.record_ack(&id);
                        answered += 1;
                    }
                }
                answered
            })
        };

        let cancel = CancellationToken::new();
        let task = m.spawn(cancel.clone());
        tokio::time::sleep(ms(2000 * 10 + 100)).await;

        assert!(m.contains(&id));
        assert!(!conn.is_evicted());
        cancel.cancel();
        task.await.unwrap();

        assert!(m.untrack(&id));
        drop(conn);
        assert_eq!(responder.await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_monitor_stops_ticking() {
        let m = Arc::new(monitor());
        let peer = Arc::new(FakePeer::default());
        m.track(ConnectionId::from("c"), peer.clone());
        let cancel = CancellationToken::new();
        let task = m.spawn(cancel.clone());

        tokio::time::sleep(ms(2100)).await;
        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(ms(60_000)).await;

        assert_eq!(peer.probes(), 1);
        assert!(!peer.is_closed());
    }
}
