//! Headless trigger gate.
//!
//! When the OS wakes the process for a geofence event, persisted state may not
//! be loaded yet. The gate holds the trigger until the store reports it is
//! rehydrated, and makes sure every event id is processed at most once even
//! if the OS delivers it again.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use protocol::FenceTrigger;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::StoreReadiness;

/// Default number of processed event ids remembered.
pub const DEFAULT_PROCESSED_CAPACITY: usize = 256;

/// Consumes triggers the gate lets through.
pub trait TriggerHandler: Send + Sync {
    fn handle(&self, trigger: FenceTrigger) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Handed to the handler.
    Processed,
    /// The event id is pending or was already processed.
    Duplicate,
    /// The gate shut down or readiness went away before the store loaded.
    Abandoned,
}

struct GateState {
    pending: HashSet<Uuid>,
    processed: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl GateState {
    fn remember(&mut self, id: Uuid) {
        if self.processed.insert(id) {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
    }
}

pub struct HeadlessTriggerGate {
    readiness: Arc<dyn StoreReadiness>,
    handler: Arc<dyn TriggerHandler>,
    state: Mutex<GateState>,
    shutdown: CancellationToken,
}

impl HeadlessTriggerGate {
    pub fn new(readiness: Arc<dyn StoreReadiness>, handler: Arc<dyn TriggerHandler>) -> Self {
        Self {
            readiness,
            handler,
            state: Mutex::new(GateState {
                pending: HashSet::new(),
                processed: HashSet::new(),
                order: VecDeque::new(),
                capacity: DEFAULT_PROCESSED_CAPACITY,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_capacity(self, capacity: usize) -> Self {
        lock(&self.state).capacity = capacity.max(1);
        self
    }

    /// Processes the trigger once the store is ready, unless it is a duplicate.
    pub async fn on_trigger(&self, trigger: FenceTrigger) -> GateOutcome {
        let event_id = trigger.event_id;
        {
            let mut state = lock(&self.state);
            if state.pending.contains(&event_id) || state.processed.contains(&event_id) {
                debug!(%event_id, "duplicate trigger delivery");
                return GateOutcome::Duplicate;
            }
            state.pending.insert(event_id);
        }
        let mark = PendingMark {
            state: &self.state,
            event_id,
        };

        if !self.readiness.is_rehydrated() {
            info!(%event_id, "store not rehydrated, holding trigger");
            let mut ready = self.readiness.subscribe();
            let became_ready = tokio::select! {
                changed = ready.wait_for(|rehydrated| *rehydrated) => changed.is_ok(),
                _ = self.shutdown.cancelled() => false,
            };
            drop(ready);

            if !became_ready {
                debug!(%event_id, "trigger abandoned before store was ready");
                return GateOutcome::Abandoned;
            }
        }

        self.handler.handle(trigger).await;
        mark.complete();
        GateOutcome::Processed
    }

    /// Number of triggers waiting for the store or being processed.
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Releases every waiting trigger as abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Clears the pending mark of an event when its delivery ends, including when
/// the caller drops the future, so a later redelivery is not seen as a duplicate.
struct PendingMark<'a> {
    state: &'a Mutex<GateState>,
    event_id: Uuid,
}

impl PendingMark<'_> {
    fn complete(self) {
        lock(self.state).remember(self.event_id);
    }
}

impl Drop for PendingMark<'_> {
    fn drop(&mut self) {
        lock(self.state).pending.remove(&self.event_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
