//! Reconnection scheduling.
//!
//! [`ReconnectScheduler`] decides whether another retry is allowed and how
//! long to wait; [`Timer`] waits out that delay as a cancellable task. A
//! cancelled timer never runs its callback.

use std::future::Future;
use std::time::Duration;

use lifeline_core::Backoff;
use lifeline_settings::ReconnectPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of consulting the scheduler on `reconnecting` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Wait `delay`, then try again. `attempt` is the zero-based retry index.
    Retry {
        /// Zero-based index of this retry within the episode.
        attempt: u32,
        /// Jittered wait before the retry.
        delay: Duration,
    },
    /// Retries are exhausted.
    GiveUp {
        /// Retries performed in the episode.
        attempts: u32,
    },
}

/// Backoff policy bound to an attempt limit.
#[derive(Clone, Debug)]
pub struct ReconnectScheduler {
    backoff: Backoff,
    max_attempts: u32,
    enabled: bool,
}

impl ReconnectScheduler {
    /// Scheduler for `policy`.
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            backoff: policy.backoff(),
            max_attempts: policy.max_attempts,
            enabled: policy.enabled,
        }
    }

    /// Whether unexpected losses should enter `reconnecting` at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a retry remains after `attempt` retries.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Plan the retry following `attempt` retries, drawing jitter from the RNG.
    pub fn plan(&self, attempt: u32) -> Plan {
        if !self.has_attempts_left(attempt) {
            return Plan::GiveUp { attempts: attempt };
        }
        Plan::Retry {
            attempt,
            delay: self.backoff.delay(attempt),
        }
    }

    /// Plan with an explicit jitter sample in `[0, 1]`.
    pub fn plan_with_random(&self, attempt: u32, random: f64) -> Plan {
        if !self.has_attempts_left(attempt) {
            return Plan::GiveUp { attempts: attempt };
        }
        Plan::Retry {
            attempt,
            delay: self.backoff.delay_with_random(attempt, random),
        }
    }

    /// Backoff parameters in use.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

/// A scheduled callback that can be cancelled before it fires.
#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Timer {
    /// Run `on_fire` after `delay` unless cancelled first.
    pub fn start<F, Fut>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {}
                () = tokio::time::sleep(delay) => on_fire().await,
            }
        });
        Self { token, task }
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the timer task has completed (fired or cancelled).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn retry_uses_pre_increment_attempt() {
        let scheduler = ReconnectScheduler::new(&policy(10));
        assert_eq!(
            scheduler.plan_with_random(0, 0.5),
            Plan::Retry {
                attempt: 0,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            scheduler.plan_with_random(3, 0.5),
            Plan::Retry {
                attempt: 3,
                delay: Duration::from_millis(8000)
            }
        );
    }

    #[test]
    fn gives_up_once_attempts_reach_limit() {
        let scheduler = ReconnectScheduler::new(&policy(3));
        assert!(matches!(scheduler.plan(2), Plan::Retry { .. }));
        assert_eq!(scheduler.plan(3), Plan::GiveUp { attempts: 3 });
        assert_eq!(scheduler.plan(7), Plan::GiveUp { attempts: 7 });
    }

    #[test]
    fn zero_attempts_never_retries() {
        let scheduler = ReconnectScheduler::new(&policy(0));
        assert_eq!(scheduler.plan(0), Plan::GiveUp { attempts: 0 });
    }

    #[test]
    fn planned_delay_stays_in_jitter_band() {
        let scheduler = ReconnectScheduler::new(&policy(10));
        for _ in 0..50 {
            let Plan::Retry { delay, .. } = scheduler.plan(0) else {
                panic!("expected retry");
            };
            assert!(delay >= Duration::from_millis(875), "{delay:?}");
            assert!(delay <= Duration::from_millis(1125), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = Timer::start(Duration::from_secs(2), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!timer.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = Timer::start(Duration::from_secs(1), move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        assert!(timer.is_cancelled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_timer_cancels_it() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        drop(Timer::start(Duration::from_secs(1), move || async move {
            flag.store(true, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
