use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::ctrl::controllers::NetworkControllers;
use crate::ctrl::messages::CircuitConfirmation;
use crate::forwarder::state::ForwarderState;
use crate::util::close_notify::CloseNotify;

/// Finds circuits without recent traffic and asks their controllers whether they should still
///  exist. Removal is up to the controller.
pub struct Scanner {
    ctrls: Arc<NetworkControllers>,
    state: Arc<ForwarderState>,
    interval: Duration,
    timeout: Duration,
}

impl Scanner {
    pub fn new(ctrls: Arc<NetworkControllers>, state: Arc<ForwarderState>, interval: Duration, timeout: Duration) -> Scanner {
        Scanner { ctrls, state, interval, timeout }
    }

    /// Starts periodic scans, unless the interval is zero
    pub fn spawn(self: &Arc<Self>, close_notify: CloseNotify) {
        if self.interval.is_zero() {
            debug!("idle circuit scanner is disabled");
            return;
        }
        tokio::spawn(self.clone().run(close_notify));
    }

    async fn run(self: Arc<Self>, mut close_notify: CloseNotify) {
        let mut ticks = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = ticks.tick() => self.scan().await,
                _ = close_notify.closed() => {
                    debug!("scanner shut down");
                    return;
                }
            }
        }
    }

    pub async fn scan(&self) {
        let now = self.state.clock().now_millis();
        let timeout_ms = self.timeout.as_millis() as i64;

        let mut idle_by_ctrl: FxHashMap<String, CircuitConfirmation> = FxHashMap::default();
        let circuits = self.state.circuits();
        for (circuit_id, table) in &circuits {
            let idle_time = now - table.last_active();
            if idle_time > timeout_ms {
                let confirmation = idle_by_ctrl.entry(table.ctrl_id().to_string()).or_default();
                confirmation.circuit_ids.push(circuit_id.clone());
                confirmation.idle_times.insert(circuit_id.clone(), idle_time);
            }
        }
        debug!("scanned {} circuits, {} controllers with idle circuits", circuits.len(), idle_by_ctrl.len());

        for (ctrl_id, mut confirmation) in idle_by_ctrl {
            confirmation.circuit_ids.sort();
            match self.ctrls.get(&ctrl_id) {
                Some(channel) => {
                    debug!("asking controller {} to confirm {} idle circuits", ctrl_id, confirmation.circuit_ids.len());
                    if let Err(e) = channel.send_circuit_confirmation(confirmation).await {
                        error!("unable to send circuit confirmation to controller {}: {}", ctrl_id, e);
                    }
                }
                None => warn!("controller '{}' is not connected, can not confirm idle circuits {:?}", ctrl_id, confirmation.circuit_ids),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{wait_until, TrackingControlChannel};
    use crate::forwarder::state::ForwardTable;
    use crate::util::clock::MonotonicClock;
    use crate::util::close_notify::Closer;

    fn fixture(interval: Duration) -> (Arc<Scanner>, Arc<ForwarderState>, Arc<TrackingControlChannel>, Arc<TrackingControlChannel>) {
        let ctrls = Arc::new(NetworkControllers::new());
        let c1 = TrackingControlChannel::new("c1");
        let c2 = TrackingControlChannel::new("c2");
        ctrls.add(c1.clone());
        ctrls.add(c2.clone());
        let state = Arc::new(ForwarderState::new(MonotonicClock::new()));
        let scanner = Arc::new(Scanner::new(ctrls, state.clone(), interval, Duration::from_secs(60)));
        (scanner, state, c1, c2)
    }

    fn install(state: &ForwarderState, circuit_id: &str, ctrl_id: &str) {
        state.install_forward_table(circuit_id, Arc::new(ForwardTable::new(ctrl_id, state.clock().now_millis())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_circuits_grouped_by_controller() {
        let (scanner, state, c1, c2) = fixture(Duration::from_secs(60));
        install(&state, "s1", "c1");
        install(&state, "s2", "c1");
        install(&state, "s3", "c2");
        install(&state, "active", "c1");

        time::advance(Duration::from_secs(50)).await;
        state.forward_table("active", true);
        time::advance(Duration::from_secs(20)).await;

        scanner.scan().await;

        let confirmations = c1.confirmations();
        assert_eq!(confirmations.len(), 1);
        assert_eq!(confirmations[0].circuit_ids, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(confirmations[0].idle_times.get("s1"), Some(&70_000));
        assert_eq!(c2.confirmations()[0].circuit_ids, vec!["s3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_sent_without_idle_circuits() {
        let (scanner, state, c1, c2) = fixture(Duration::from_secs(60));
        install(&state, "s1", "c1");
        time::advance(Duration::from_secs(30)).await;

        scanner.scan().await;
        assert!(c1.confirmations().is_empty());
        assert!(c2.confirmations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_scan() {
        let closer = Closer::new();
        let (scanner, state, c1, _) = fixture(Duration::from_secs(60));
        install(&state, "s1", "c1");
        scanner.spawn(closer.notify());

        time::sleep(Duration::from_secs(61)).await;
        assert!(c1.confirmations().is_empty());

        time::sleep(Duration::from_secs(60)).await;
        wait_until(|| c1.confirmations().len() == 1).await;
    }
}
