use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::forwarder::destination::{DestinationEntry, LinkDestination, XgressDestination};
use crate::inspect::ForwarderDebug;
use crate::util::clock::MonotonicClock;
use crate::xgress::message::Address;

/// Forwarding state of a single circuit on this router
#[derive(Debug)]
pub struct ForwardTable {
    /// empty for circuits without a known owner
    ctrl_id: String,
    last_active: AtomicI64,
    forwards: DashMap<Address, Address>,
}

impl ForwardTable {
    pub fn new(ctrl_id: &str, now_millis: i64) -> ForwardTable {
        ForwardTable {
            ctrl_id: ctrl_id.to_string(),
            last_active: AtomicI64::new(now_millis),
            forwards: DashMap::new(),
        }
    }

    pub fn ctrl_id(&self) -> &str {
        &self.ctrl_id
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Acquire)
    }

    pub fn mark_active(&self, now_millis: i64) {
        self.last_active.store(now_millis, Ordering::Release);
    }

    pub fn set_forward_address(&self, src: Address, dst: Address) {
        self.forwards.insert(src, dst);
    }

    pub fn forward_address(&self, src: &Address) -> Option<Address> {
        self.forwards.get(src)
            .map(|e| e.value().clone())
    }

    /// source -> destination, sorted by source
    pub fn forwards(&self) -> BTreeMap<String, String> {
        self.forwards.iter()
            .map(|e| (e.key().to_string(), e.value().to_string()))
            .collect()
    }
}

/// The forwarder's tables. Every part of the data plane that needs them gets a shared reference
///  at construction time.
pub struct ForwarderState {
    clock: MonotonicClock,
    circuits: DashMap<String, Arc<ForwardTable>>,
    destinations: DashMap<Address, DestinationEntry>,
    /// circuit id -> addresses of the endpoints registered for the circuit
    circuit_addresses: DashMap<String, FxHashSet<Address>>,
}

impl ForwarderState {
    pub fn new(clock: MonotonicClock) -> ForwarderState {
        ForwarderState {
            clock,
            circuits: DashMap::new(),
            destinations: DashMap::new(),
            circuit_addresses: DashMap::new(),
        }
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    pub fn forward_table(&self, circuit_id: &str, mark_active: bool) -> Option<Arc<ForwardTable>> {
        let table = self.circuits.get(circuit_id)?.value().clone();
        if mark_active {
            table.mark_active(self.clock.now_millis());
        }
        Some(table)
    }

    /// Installs a table that was built up before being made visible. If a table was installed for
    ///  the circuit in the meantime, the forwards are merged into that one.
    pub fn install_forward_table(&self, circuit_id: &str, table: Arc<ForwardTable>) {
        match self.circuits.entry(circuit_id.to_string()) {
            Entry::Occupied(e) => {
                for forward in table.forwards.iter() {
                    e.get().set_forward_address(forward.key().clone(), forward.value().clone());
                }
            }
            Entry::Vacant(e) => {
                e.insert(table);
            }
        }
    }

    pub fn has_circuit(&self, circuit_id: &str) -> bool {
        self.circuits.contains_key(circuit_id)
    }

    pub fn remove_forward_table(&self, circuit_id: &str) -> Option<Arc<ForwardTable>> {
        self.circuits.remove(circuit_id)
            .map(|(_, table)| table)
    }

    pub fn circuits(&self) -> Vec<(String, Arc<ForwardTable>)> {
        self.circuits.iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn destination(&self, address: &Address) -> Option<DestinationEntry> {
        self.destinations.get(address)
            .map(|e| e.value().clone())
    }

    pub fn has_destination(&self, address: &Address) -> bool {
        self.destinations.contains_key(address)
    }

    pub fn register_destination(&self, circuit_id: &str, address: Address, destination: Arc<dyn XgressDestination>) {
        trace!(circuit_id, %address, "registering destination");
        // NB: the index entry stays locked until the destination is visible, so that a concurrent
        //  unregister either sees both or neither
        let mut addresses = self.circuit_addresses.entry(circuit_id.to_string())
            .or_default();
        addresses.insert(address.clone());
        self.destinations.insert(address, DestinationEntry::Xgress(destination));
    }

    /// Removes all endpoints registered for a circuit, notifying each of them asynchronously
    pub fn unregister_destinations(&self, circuit_id: &str) {
        let Some((_, addresses)) = self.circuit_addresses.remove(circuit_id) else {
            return;
        };

        for address in &addresses {
            if let Some((_, entry)) = self.destinations.remove(address) {
                debug!(circuit_id, %address, "unregistered {}", entry.describe());
                if let DestinationEntry::Xgress(xgress) = entry {
                    tokio::spawn(async move { xgress.unrouted() });
                }
            }
        }
    }

    pub fn xgress_for_circuit(&self, circuit_id: &str) -> Option<Arc<dyn XgressDestination>> {
        let addresses = self.circuit_addresses.get(circuit_id)?.value().clone();
        addresses.iter()
            .filter_map(|address| self.destination(address))
            .find_map(|entry| entry.as_xgress().cloned())
    }

    pub fn register_link(&self, link: Arc<dyn LinkDestination>) {
        let address = Address::new(link.id());
        debug!(%address, "registering link");
        self.destinations.insert(address, DestinationEntry::Link(link));
    }

    /// Only removes the entry if it still refers to this very link, not to a newer link with the
    ///  same id
    pub fn unregister_link(&self, link: &Arc<dyn LinkDestination>) -> bool {
        let address = Address::new(link.id());
        let removed = self.destinations.remove_if(&address, |_, entry| entry.is_link(link)).is_some();
        if removed {
            debug!(%address, "unregistered link");
        }
        removed
    }

    pub fn debug(&self) -> ForwarderDebug {
        ForwarderDebug {
            circuits: self.circuits.iter()
                .map(|e| (e.key().clone(), e.value().forwards()))
                .collect(),
            destinations: self.destinations.iter()
                .map(|e| (e.key().to_string(), e.value().describe()))
                .collect(),
        }
    }
}
