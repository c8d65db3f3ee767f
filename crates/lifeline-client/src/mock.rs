//! Scripted in-memory transport.
//!
//! [`MockTransport`] records every open attempt and hands out
//! [`MockSession`]s whose sent frames can be inspected and whose event stream
//! can be driven by the test. Open results come from a script; once it runs
//! out every open succeeds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lifeline_core::TransportError;
use lifeline_core::codec::{ControlMessage, decode_control};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportEvent, TransportEvents, TransportHandle};

/// Scripted result of one open attempt.
#[derive(Clone, Debug)]
pub enum OpenOutcome {
    /// Open succeeds.
    Accept,
    /// Open fails with the given error.
    Reject(TransportError),
}

#[derive(Default)]
struct MockState {
    script: VecDeque<OpenOutcome>,
    reject_all: bool,
    open_delay: Duration,
    hold_close: bool,
    send_budget: Option<usize>,
    endpoints: Vec<String>,
    sessions: Vec<Arc<MockSession>>,
}

/// In-memory [`Transport`] for tests.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Transport that accepts every open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next unscripted open.
    pub fn push_outcome(&self, outcome: OpenOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Queue `count` failing opens.
    pub fn fail_next(&self, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state
                .script
                .push_back(OpenOutcome::Reject(TransportError::Open("refused".into())));
        }
    }

    /// Reject every open until turned off again.
    pub fn reject_all(&self, reject: bool) {
        self.state.lock().reject_all = reject;
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// When set, `close()` on new sessions does not report `Closed` on its own.
    pub fn hold_close(&self, hold: bool) {
        self.state.lock().hold_close = hold;
    }

    /// Successful sends allowed on each new session. `None` lifts the limit.
    pub fn limit_session_sends(&self, count: Option<usize>) {
        self.state.lock().send_budget = count;
    }

    /// Number of open attempts, successful or not.
    pub fn open_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Endpoints passed to each open attempt.
    pub fn endpoints(&self) -> Vec<String> {
        self.state.lock().endpoints.clone()
    }

    /// Sessions handed out so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.state.lock().sessions.clone()
    }

    /// Most recent session.
    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.state.lock().sessions.last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn TransportHandle>, TransportEvents), TransportError> {
        let (delay, outcome) = {
            let mut state = self.state.lock();
            state.endpoints.push(endpoint.to_owned());
            let outcome = if state.reject_all {
                OpenOutcome::Reject(TransportError::Open("refused".into()))
            } else {
                state.script.pop_front().unwrap_or(OpenOutcome::Accept)
            };
            (state.open_delay, outcome)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            OpenOutcome::Reject(err) => Err(err),
            OpenOutcome::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut state = self.state.lock();
                let session = Arc::new(MockSession::new(tx, state.hold_close, state.send_budget));
                state.sessions.push(session.clone());
                drop(state);
                let handle: Arc<dyn TransportHandle> = session;
                Ok((handle, rx))
            }
        }
    }
}

/// One accepted mock connection.
pub struct MockSession {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    close_requests: AtomicUsize,
    hold_close: bool,
    send_budget: Mutex<Option<usize>>,
}

impl MockSession {
    fn new(
        events: mpsc::UnboundedSender<TransportEvent>,
        hold_close: bool,
        send_budget: Option<usize>,
    ) -> Self {
        Self {
            events,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_requests: AtomicUsize::new(0),
            hold_close,
            send_budget: Mutex::new(send_budget),
        }
    }

    /// Inject a transport event.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Inject an inbound frame.
    pub fn deliver(&self, frame: impl Into<Vec<u8>>) {
        self.emit(TransportEvent::Message(frame.into()));
    }

    /// Simulate the peer dropping the connection.
    pub fn drop_connection(&self, code: Option<u16>) {
        self.closed.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Closed(code));
    }

    /// Allow `count` more successful sends, then fail. `None` lifts the limit.
    pub fn limit_sends(&self, count: Option<usize>) {
        *self.send_budget.lock() = count;
    }

    /// Frames sent through this session.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Channels named in subscribe requests, in send order.
    pub fn subscribes(&self) -> Vec<String> {
        self.control_frames()
            .into_iter()
            .filter_map(|msg| match msg {
                ControlMessage::Subscribe { channel } => Some(channel),
                _ => None,
            })
            .collect()
    }

    /// Channels named in unsubscribe requests, in send order.
    pub fn unsubscribes(&self) -> Vec<String> {
        self.control_frames()
            .into_iter()
            .filter_map(|msg| match msg {
                ControlMessage::Unsubscribe { channel } => Some(channel),
                _ => None,
            })
            .collect()
    }

    /// Probe acknowledgments sent.
    pub fn probe_acks(&self) -> usize {
        self.control_frames()
            .iter()
            .filter(|msg| matches!(msg, ControlMessage::Pong))
            .count()
    }

    /// Whether `close()` was called or the peer dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `close()` calls.
    pub fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }

    fn control_frames(&self) -> Vec<ControlMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| decode_control(frame))
            .collect()
    }
}

impl TransportHandle for MockSession {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut budget = self.send_budget.lock();
        if let Some(remaining) = budget.as_mut() {
            if *remaining == 0 {
                return Err(TransportError::Send("send budget exhausted".into()));
            }
            *remaining -= 1;
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        let _ = self.close_requests.fetch_add(1, Ordering::SeqCst);
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        if !was_closed && !self.hold_close {
            self.emit(TransportEvent::Closed(Some(1000)));
        }
    }
}
