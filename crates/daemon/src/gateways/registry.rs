//! Concurrent registry of gateway local state.

use dashmap::DashMap;
use protocol::GatewayLocalState;

/// Local state of every known gateway, keyed by gateway id.
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    gateways: DashMap<u64, GatewayLocalState>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a gateway's state.
    pub fn register(&self, state: GatewayLocalState) {
        self.gateways.insert(state.gateway_id, state);
    }

    pub fn remove(&self, gateway_id: u64) -> Option<GatewayLocalState> {
        self.gateways.remove(&gateway_id).map(|(_, state)| state)
    }

    /// Snapshot of one gateway.
    pub fn get(&self, gateway_id: u64) -> Option<GatewayLocalState> {
        self.gateways.get(&gateway_id).map(|entry| entry.clone())
    }

    /// Applies `f` to a gateway in place. Returns false if it is unknown.
    pub fn update(&self, gateway_id: u64, f: impl FnOnce(&mut GatewayLocalState)) -> bool {
        match self.gateways.get_mut(&gateway_id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Records a discovered address for the gateway with `uuid`.
    pub fn set_address_by_uuid(&self, uuid: &str, address: &str) -> Option<u64> {
        self.gateways
            .iter_mut()
            .find(|entry| entry.uuid.as_deref() == Some(uuid))
            .map(|mut entry| {
                entry.address = Some(address.to_string());
                entry.gateway_id
            })
    }

    /// Registered gateway ids, ascending.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.gateways.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<GatewayLocalState> {
        let mut all: Vec<GatewayLocalState> =
            self.gateways.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|g| g.gateway_id);
        all
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}
