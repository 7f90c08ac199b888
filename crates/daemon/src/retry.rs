//! Bounded per-job retry with escalating backoff.
//!
//! Each failing job gets a [`RetryState`]. Attempt `n` is scheduled after the
//! `n`-th entry of the backoff table; once every entry is used the state is
//! dropped and the user is notified. A success cancels whatever timer is
//! still pending for the job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{DeliveryError, FenceKind};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{CancelToken, Clock, TimerCallback};
use crate::notify::{Notification, Notifier};

/// Default delays of attempts 1, 2 and 3.
pub const DEFAULT_BACKOFF_SECS: [u64; 3] = [10, 30, 60];

/// What the exhaustion notification names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    pub fence_title: String,
    pub direction: FenceKind,
}

/// Outcome of [`RetryQueue::schedule_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    Exhausted,
    /// The queue was torn down; nothing was scheduled.
    Closed,
}

/// Retry bookkeeping for one job.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub timer: Option<CancelToken>,
}

pub struct RetryQueue {
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    backoff: Vec<Duration>,
    states: DashMap<Uuid, RetryState>,
    pending: watch::Sender<usize>,
    closed: AtomicBool,
}

impl RetryQueue {
    pub fn new(clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            clock,
            notifier,
            backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            states: DashMap::new(),
            pending,
            closed: AtomicBool::new(false),
        }
    }

    /// Replaces the backoff table. Its length is the retry bound.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn bound(&self) -> u32 {
        u32::try_from(self.backoff.len()).unwrap_or(u32::MAX)
    }

    /// Schedules `run` as the job's next attempt, or gives up if the bound is reached.
    pub fn schedule_retry(
        &self,
        job_id: Uuid,
        notice: &RetryNotice,
        run: TimerCallback,
    ) -> RetryDecision {
        if self.is_closed() {
            debug!(%job_id, "retry queue closed, not scheduling");
            return RetryDecision::Closed;
        }

        let decision = {
            let mut state = self.states.entry(job_id).or_default();
            if state.attempt >= self.bound() {
                if let Some(timer) = state.timer.take() {
                    timer.cancel();
                }
                None
            } else {
                state.attempt += 1;
                let attempt = state.attempt;
                let delay = self.backoff[(attempt - 1) as usize];
                if let Some(previous) = state.timer.take() {
                    previous.cancel();
                }
                state.timer = Some(self.clock.after(delay, run));
                Some(RetryDecision::Scheduled { attempt, delay })
            }
        };

        let decision = match decision {
            // cancel_all may have run between the check above and arming the timer
            Some(_) if self.is_closed() => {
                self.forget(job_id);
                return RetryDecision::Closed;
            }
            Some(scheduled) => {
                debug!(%job_id, ?scheduled, "retry scheduled");
                scheduled
            }
            None => {
                self.states.remove(&job_id);
                let err = DeliveryError::RetryExhausted {
                    job_id,
                    fence: notice.fence_title.clone(),
                    direction: notice.direction,
                };
                warn!(error = %err, "giving up on job");
                self.notifier.raise(Notification::action_failed(
                    &job_id.to_string(),
                    &notice.fence_title,
                    notice.direction,
                ));
                RetryDecision::Exhausted
            }
        };
        self.publish_len();
        decision
    }

    /// Cancels any pending timer and deletes the job's state.
    pub fn succeed(&self, job_id: Uuid) {
        self.forget(job_id);
    }

    /// Drops the job's state without notifying anyone.
    pub fn forget(&self, job_id: Uuid) {
        if let Some((_, state)) = self.states.remove(&job_id) {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
            debug!(%job_id, attempts = state.attempt, "retry state cleared");
        }
        self.publish_len();
    }

    /// Attempts scheduled so far for the job; 0 if it has no state.
    pub fn attempt(&self, job_id: Uuid) -> u32 {
        self.states.get(&job_id).map(|s| s.attempt).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Jobs with a timer that has not been cancelled.
    pub fn armed_timers(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.timer.as_ref().is_some_and(|t| !t.is_cancelled()))
            .count()
    }

    /// Cancels every timer, drops all state and refuses later retries.
    pub fn cancel_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<Uuid> = self.states.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, state)) = self.states.remove(&id) {
                if let Some(timer) = state.timer {
                    timer.cancel();
                }
            }
        }
        self.publish_len();
    }

    /// Resolves once no job has retry state.
    pub async fn wait_empty(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|len| *len == 0).await;
    }

    fn publish_len(&self) {
        self.pending.send_replace(self.states.len());
    }
}
