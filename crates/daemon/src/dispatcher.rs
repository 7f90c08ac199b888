//! Fence action dispatch.
//!
//! [`ActionDispatcher::handle_fence`] turns one trigger into concurrent jobs:
//!
//! ```text
//! trigger ─▶ window open? ─▶ actions? ─▶ token? ─▶ entitled? ─▶ expand
//!                                                                 │
//!          ┌──────────────┬──────────────┬────────────────────────┘
//!          ▼              ▼              ▼
//!        job 1          job 2   ...    job n      (join_all, isolated)
//!          │ transient failure
//!          ▼
//!      RetryQueue ──(backoff timer)──▶ same job again
//! ```
//!
//! Every job goes through the account's cloud session; local reachability is
//! only reported.

use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use futures_util::future::{join_all, BoxFuture};
use protocol::actions::{self, ActionJob};
use protocol::{ApiRequest, DeliveryError, Entitlement, FenceTrigger, JobKind, UserProfile};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::unix_now;
use crate::gate::TriggerHandler;
use crate::gateways::GatewayRegistry;
use crate::retry::{RetryDecision, RetryNotice, RetryQueue};
use crate::store::AccountStore;
use crate::transport::{SessionProvider, Transport};

/// Why a trigger produced no jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Outside the fence's active window.
    WindowClosed,
    /// Nothing configured for the trigger's direction.
    NoActions,
    /// The owner has no stored token.
    MissingToken,
    /// The owner's tier does not include fence actions.
    NotEntitled,
    /// The entitlement could not be determined.
    EntitlementUnknown(DeliveryError),
}

/// Final state of one job after its first execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    RetryScheduled { attempt: u32, delay: Duration },
    RetryExhausted,
    SessionInvalid(DeliveryError),
    Failed(DeliveryError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub outcome: JobOutcome,
}

/// Result of handling one trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchReport {
    Skipped(SkipReason),
    Dispatched {
        fence_id: String,
        jobs: Vec<JobReport>,
        /// Actions that could not be turned into jobs.
        rejected: Vec<(String, DeliveryError)>,
    },
}

impl DispatchReport {
    pub fn is_skipped(&self) -> bool {
        matches!(self, DispatchReport::Skipped(_))
    }

    pub fn jobs(&self) -> &[JobReport] {
        match self {
            DispatchReport::Dispatched { jobs, .. } => jobs,
            DispatchReport::Skipped(_) => &[],
        }
    }
}

/// Failures surfaced beyond the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    /// The account needs to sign in again.
    SessionInvalid { user_id: String, reason: String },
    /// A job gave up after its last retry.
    RetryExhausted { job_id: Uuid, fence_title: String },
    /// A job completed, possibly after retries.
    JobSucceeded { job_id: Uuid },
}

struct Inner {
    store: Arc<dyn AccountStore>,
    sessions: Arc<dyn SessionProvider>,
    registry: Arc<GatewayRegistry>,
    retries: Arc<RetryQueue>,
    events: broadcast::Sender<DeliveryEvent>,
}

/// Executes fence actions. Cheap to clone.
#[derive(Clone)]
pub struct ActionDispatcher {
    inner: Arc<Inner>,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<dyn AccountStore>,
        sessions: Arc<dyn SessionProvider>,
        registry: Arc<GatewayRegistry>,
        retries: Arc<RetryQueue>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                store,
                sessions,
                registry,
                retries,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn retries(&self) -> &Arc<RetryQueue> {
        &self.inner.retries
    }

    /// Handles a trigger at the current local time.
    pub async fn handle_fence(&self, trigger: &FenceTrigger) -> DispatchReport {
        let now = chrono::Local::now();
        self.handle_fence_at(trigger, now.hour() * 60 + now.minute())
            .await
    }

    /// Handles a trigger as if the local time were `minute_of_day`.
    pub async fn handle_fence_at(&self, trigger: &FenceTrigger, minute_of_day: u32) -> DispatchReport {
        let extras = &trigger.extras;
        let fence_id = trigger.identifier.as_str();

        if !extras.window.is_open_at(minute_of_day) {
            debug!(fence_id, minute_of_day, "fence outside its active window");
            return DispatchReport::Skipped(SkipReason::WindowClosed);
        }
        if trigger.actions().is_empty() {
            debug!(fence_id, kind = %trigger.kind, "no actions configured");
            return DispatchReport::Skipped(SkipReason::NoActions);
        }

        let user_id = extras.owner_id.as_str();
        if self.inner.store.get_account_token(user_id).is_none() {
            info!(fence_id, user_id, "no account token, skipping fence");
            return DispatchReport::Skipped(SkipReason::MissingToken);
        }

        let session = self.inner.sessions.session(user_id);
        match self.entitlement(user_id, session.as_ref()).await {
            Ok(entitlement) if entitlement.allows_actions(unix_now()) => {}
            Ok(_) => {
                info!(fence_id, user_id, "account not entitled to fence actions");
                return DispatchReport::Skipped(SkipReason::NotEntitled);
            }
            Err(e) => {
                warn!(fence_id, user_id, error = %e, "entitlement lookup failed");
                return DispatchReport::Skipped(SkipReason::EntitlementUnknown(e));
            }
        }

        self.log_local_control();

        let expanded = actions::expand(trigger);
        for (key, error) in &expanded.rejected {
            warn!(fence_id, action = %key, %error, "action rejected");
        }

        let notice = RetryNotice {
            fence_title: extras.title.clone(),
            direction: trigger.kind,
        };
        info!(
            fence_id,
            kind = %trigger.kind,
            jobs = expanded.jobs.len(),
            "dispatching fence actions"
        );
        let jobs = join_all(
            expanded
                .jobs
                .into_iter()
                .map(|job| self.run_job(Arc::new(job), Arc::clone(&session), notice.clone())),
        )
        .await;

        DispatchReport::Dispatched {
            fence_id: fence_id.to_string(),
            jobs,
            rejected: expanded.rejected,
        }
    }

    /// Cached premium entitlement, else the profile lookup.
    async fn entitlement(
        &self,
        user_id: &str,
        session: &dyn Transport,
    ) -> protocol::Result<Entitlement> {
        let now = unix_now();
        if let Some(cached) = self.inner.store.get_entitlement(user_id) {
            if cached.allows_actions(now) {
                return Ok(cached);
            }
        }

        let body = session.execute(&ApiRequest::get("/user/profile")).await?;
        let profile: UserProfile = serde_json::from_value(body)?;
        let entitlement = Entitlement::from_pro(profile.pro, now);
        if let Err(e) = self.inner.store.set_entitlement(user_id, entitlement) {
            warn!(user_id, error = %e, "failed to cache entitlement");
        }
        Ok(entitlement)
    }

    fn log_local_control(&self) {
        let now = unix_now();
        let gateways = self.inner.registry.snapshot();
        let local = gateways
            .iter()
            .filter(|g| g.supports_local_control(now))
            .count();
        debug!(
            gateways = gateways.len(),
            local, "gateways eligible for local control"
        );
    }

    /// Executes a job once and routes its failure.
    ///
    /// Transient failures re-arm this same function through the retry queue.
    fn run_job(
        &self,
        job: Arc<ActionJob>,
        session: Arc<dyn Transport>,
        notice: RetryNotice,
    ) -> BoxFuture<'static, JobReport> {
        let this = self.clone();
        Box::pin(async move {
            let job_id = job.job_id;
            let request = job.payload.request();
            let retries = &this.inner.retries;

            let outcome = match session.execute(&request).await {
                Ok(_) => {
                    let retried = retries.attempt(job_id);
                    retries.succeed(job_id);
                    info!(%job_id, kind = %job.kind(), retried, "action delivered");
                    this.emit(DeliveryEvent::JobSucceeded { job_id });
                    JobOutcome::Succeeded
                }
                Err(e) if e.is_transient() => {
                    debug!(%job_id, error = %e, "transient failure");
                    let failure = e.clone();
                    let runtime = tokio::runtime::Handle::current();
                    let again = {
                        let this = this.clone();
                        let job = Arc::clone(&job);
                        let session = Arc::clone(&session);
                        let notice = notice.clone();
                        Box::new(move || {
                            let attempt = this.run_job(job, session, notice);
                            runtime.spawn(async move {
                                let report = attempt.await;
                                debug!(job_id = %report.job_id, outcome = ?report.outcome, "retry finished");
                            });
                        })
                    };
                    match retries.schedule_retry(job_id, &notice, again) {
                        RetryDecision::Scheduled { attempt, delay } => {
                            JobOutcome::RetryScheduled { attempt, delay }
                        }
                        RetryDecision::Exhausted => {
                            this.emit(DeliveryEvent::RetryExhausted {
                                job_id,
                                fence_title: notice.fence_title.clone(),
                            });
                            JobOutcome::RetryExhausted
                        }
                        RetryDecision::Closed => {
                            info!(%job_id, "shutting down, dropping failed action");
                            JobOutcome::Failed(failure)
                        }
                    }
                }
                Err(e @ (DeliveryError::SessionInvalid(_) | DeliveryError::MissingToken { .. })) => {
                    retries.forget(job_id);
                    warn!(%job_id, error = %e, "session invalid, re-authentication required");
                    this.emit(DeliveryEvent::SessionInvalid {
                        user_id: job.owner_user_id.clone(),
                        reason: e.to_string(),
                    });
                    JobOutcome::SessionInvalid(e)
                }
                Err(e) => {
                    retries.forget(job_id);
                    warn!(%job_id, kind = %job.kind(), error = %e, "action failed");
                    JobOutcome::Failed(e)
                }
            };

            JobReport {
                job_id,
                kind: job.kind(),
                outcome,
            }
        })
    }

    fn emit(&self, event: DeliveryEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl TriggerHandler for ActionDispatcher {
    fn handle(&self, trigger: FenceTrigger) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let report = self.handle_fence(&trigger).await;
            match &report {
                DispatchReport::Skipped(reason) => {
                    debug!(event_id = %trigger.event_id, ?reason, "trigger skipped")
                }
                DispatchReport::Dispatched { jobs, .. } => {
                    let delivered = jobs
                        .iter()
                        .filter(|j| j.outcome == JobOutcome::Succeeded)
                        .count();
                    info!(
                        event_id = %trigger.event_id,
                        fence_id = %trigger.identifier,
                        delivered,
                        total = jobs.len(),
                        "trigger handled"
                    );
                }
            }
        })
    }
}
