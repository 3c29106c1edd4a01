use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::ctrl::controllers::NetworkControllers;
use crate::ctrl::messages::{Fault, FaultSubject};
use crate::util::close_notify::CloseNotify;

/// Collects forwarding faults and reports them to the owning controllers in batches
pub struct Faulter {
    ctrls: Arc<NetworkControllers>,
    interval: Duration,
    /// circuit id -> ctrl id
    pending: DashMap<String, String>,
}

impl Faulter {
    pub fn new(ctrls: Arc<NetworkControllers>, interval: Duration) -> Faulter {
        Faulter {
            ctrls,
            interval,
            pending: DashMap::new(),
        }
    }

    /// Starts periodic reporting, unless the interval is zero
    pub fn spawn(self: &Arc<Self>, close_notify: CloseNotify) {
        if self.interval.is_zero() {
            debug!("fault reporting is disabled");
            return;
        }
        tokio::spawn(self.clone().run(close_notify));
    }

    async fn run(self: Arc<Self>, mut close_notify: CloseNotify) {
        let mut ticks = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = ticks.tick() => self.send_pending_faults().await,
                _ = close_notify.closed() => {
                    debug!("faulter shut down");
                    return;
                }
            }
        }
    }

    pub fn report(&self, circuit_id: &str, ctrl_id: &str) {
        if self.interval.is_zero() {
            return;
        }
        self.pending.insert(circuit_id.to_string(), ctrl_id.to_string());
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn send_pending_faults(&self) {
        let mut by_ctrl: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for e in self.pending.iter() {
            by_ctrl.entry(e.value().clone())
                .or_default()
                .push(e.key().clone());
        }
        // cleared before sending: a circuit that is still broken is reported again on its next
        //  failure
        for (ctrl_id, circuit_ids) in &by_ctrl {
            for circuit_id in circuit_ids {
                self.pending.remove_if(circuit_id, |_, c| c == ctrl_id);
            }
        }

        for (ctrl_id, mut circuit_ids) in by_ctrl {
            circuit_ids.sort();
            let id = circuit_ids.join(" ");

            if ctrl_id.is_empty() {
                debug!("broadcasting faults for circuits without owner: {}", id);
                self.ctrls.broadcast_fault(&Fault { subject: FaultSubject::UnknownOwnerForwardFault, id }).await;
                continue;
            }

            match self.ctrls.get(&ctrl_id) {
                Some(channel) => {
                    debug!("reporting forward faults to controller {}: {}", ctrl_id, id);
                    if let Err(e) = channel.send_fault(Fault { subject: FaultSubject::ForwardFault, id }).await {
                        error!("unable to report forward faults to controller {}: {}", ctrl_id, e);
                    }
                }
                None => warn!("controller {} is not connected, dropping forward faults for {}", ctrl_id, id),
            }
        }
    }

    /// Reported immediately rather than batched
    pub async fn notify_invalid_link(&self, link_id: &str) {
        debug!("reporting invalid link {}", link_id);
        self.ctrls.broadcast_fault(&Fault { subject: FaultSubject::LinkFault, id: link_id.to_string() }).await;
    }
}
