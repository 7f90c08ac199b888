//! Timer facility.
//!
//! Retries and probes schedule work through a [`Clock`] instead of calling a
//! runtime timer directly. Three implementations exist:
//!
//! - [`TokioClock`]: a timer task on a tokio runtime
//! - [`ThreadClock`]: a dedicated OS thread per timer; keeps firing when the
//!   host process has no async runtime driving it (headless invocation)
//! - [`ManualClock`]: advanced explicitly; records every scheduled delay

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Work run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer. Cloneable; cancelling is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
    token: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the timer. Wakes async and blocking waiters.
    pub fn cancel(&self) {
        let mut cancelled = lock(&self.inner.cancelled);
        if !*cancelled {
            *cancelled = true;
            self.inner.condvar.notify_all();
            self.inner.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.cancelled)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Blocks for up to `timeout`. Returns true if cancelled in the meantime.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock(&self.inner.cancelled);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match self.inner.condvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Schedules one-shot callbacks.
pub trait Clock: Send + Sync {
    /// Runs `callback` once after `delay` unless the returned token is cancelled first.
    fn after(&self, delay: Duration, callback: TimerCallback) -> CancelToken;
}

/// Timer task on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioClock {
    handle: Handle,
}

impl TokioClock {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Clock for TokioClock {
    fn after(&self, delay: Duration, callback: TimerCallback) -> CancelToken {
        let token = CancelToken::new();
        let waiter = token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = waiter.cancelled() => {
                    trace!(?delay, "timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if !waiter.is_cancelled() {
                        callback();
                    }
                }
            }
        });
        token
    }
}

/// One OS thread per timer.
#[derive(Debug, Clone, Default)]
pub struct ThreadClock;

impl ThreadClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for ThreadClock {
    fn after(&self, delay: Duration, callback: TimerCallback) -> CancelToken {
        let token = CancelToken::new();
        let waiter = token.clone();
        std::thread::Builder::new()
            .name("fencelink-timer".into())
            .spawn(move || {
                if !waiter.wait_timeout(delay) {
                    callback();
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| tracing::error!(error = %e, "failed to spawn timer thread"));
        token
    }
}

struct PendingTimer {
    due: Duration,
    seq: u64,
    token: CancelToken,
    callback: TimerCallback,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<PendingTimer>,
    scheduled: Vec<Duration>,
}

/// Deterministic clock advanced by hand.
#[derive(Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since creation.
    pub fn now(&self) -> Duration {
        lock(&self.state).now
    }

    /// Every delay passed to [`Clock::after`], in call order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        lock(&self.state).scheduled.clone()
    }

    /// Timers neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.state)
            .pending
            .iter()
            .filter(|t| !t.token.is_cancelled())
            .count()
    }

    /// Moves time forward, firing due timers in order.
    ///
    /// Callbacks run without the clock's lock held, so they may schedule more
    /// timers; those fire within the same call if they fall due.
    pub fn advance(&self, by: Duration) {
        let target = lock(&self.state).now + by;
        loop {
            let next = {
                let mut state = lock(&self.state);
                state.pending.retain(|t| !t.token.is_cancelled());
                let index = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.seq))
                    .map(|(i, _)| i);
                match index {
                    Some(i) => {
                        let timer = state.pending.swap_remove(i);
                        state.now = timer.due;
                        Some(timer)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            match next {
                Some(timer) => (timer.callback)(),
                None => break,
            }
        }
    }
}

impl Clock for ManualClock {
    fn after(&self, delay: Duration, callback: TimerCallback) -> CancelToken {
        let token = CancelToken::new();
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.now + delay;
        state.scheduled.push(delay);
        state.pending.push(PendingTimer {
            due,
            seq,
            token: token.clone(),
            callback,
        });
        token
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
