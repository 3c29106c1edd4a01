use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::select;
use tokio::time;
use tracing::{debug, trace};

use crate::config::ForwarderConfig;
use crate::ctrl::messages::{DestType, Route};
use crate::forwarder::destination::{DestinationEntry, LinkDestination, PayloadType, XgressDestination};
use crate::forwarder::faulter::Faulter;
use crate::forwarder::state::{ForwardTable, ForwarderState};
use crate::inspect::{CircuitInspectDetail, ForwarderDebug};
use crate::util::close_notify::CloseNotify;
use crate::xgress::data_plane::DataPlane;
use crate::xgress::message::{Acknowledgement, Address, Control, Payload};

/// Routes payloads, acknowledgements and controls between local endpoints and links, based on
///  the forward tables installed by the control plane.
///
/// The forwarder has no task of its own: everything runs on the calling task, concurrently from
///  any number of callers.
pub struct Forwarder {
    state: Arc<ForwarderState>,
    faulter: Arc<Faulter>,
    config: ForwarderConfig,
    router_id: String,
    close_notify: CloseNotify,
}

impl Forwarder {
    pub fn new(
        state: Arc<ForwarderState>,
        faulter: Arc<Faulter>,
        config: ForwarderConfig,
        router_id: &str,
        close_notify: CloseNotify,
    ) -> Forwarder {
        Forwarder {
            state,
            faulter,
            config,
            router_id: router_id.to_string(),
            close_notify,
        }
    }

    pub fn state(&self) -> &Arc<ForwarderState> {
        &self.state
    }

    pub fn register_destination(&self, circuit_id: &str, address: Address, destination: Arc<dyn XgressDestination>) {
        self.state.register_destination(circuit_id, address, destination);
    }

    pub fn unregister_destinations(&self, circuit_id: &str) {
        self.state.unregister_destinations(circuit_id);
    }

    pub fn register_link(&self, link: Arc<dyn LinkDestination>) {
        self.state.register_link(link);
    }

    pub fn unregister_link(&self, link: &Arc<dyn LinkDestination>) {
        self.state.unregister_link(link);
    }

    pub fn has_destination(&self, address: &Address) -> bool {
        self.state.has_destination(address)
    }

    pub async fn route(&self, ctrl_id: &str, route: &Route) -> anyhow::Result<()> {
        let circuit_id = &route.circuit_id;
        let existing = self.state.forward_table(circuit_id, true);
        let table = match &existing {
            Some(table) => table.clone(),
            None => Arc::new(ForwardTable::new(ctrl_id, self.state.clock().now_millis())),
        };

        for forward in &route.forwards {
            if forward.dst_type != DestType::Ingress && !self.state.has_destination(&forward.dst_address) {
                match forward.dst_type {
                    DestType::Link => {
                        self.faulter.notify_invalid_link(forward.dst_address.as_str()).await;
                        bail!("invalid link destination {} for circuit {}", forward.dst_address, circuit_id);
                    }
                    DestType::End => {
                        bail!("invalid egress destination {} for circuit {}", forward.dst_address, circuit_id);
                    }
                    _ => {}
                }
            }
            debug!(circuit_id, src = %forward.src_address, dst = %forward.dst_address, "installing forward");
            table.set_forward_address(forward.src_address.clone(), forward.dst_address.clone());
        }

        if existing.is_none() {
            self.state.install_forward_table(circuit_id, table);
        }
        Ok(())
    }

    /// With `now`, the circuit is removed before this returns. Otherwise a watcher removes it once
    ///  its local endpoint has not received anything from a link for a full check interval, so
    ///  that data in flight is not lost.
    pub fn unroute(self: &Arc<Self>, circuit_id: &str, now: bool) {
        if now {
            self.remove_circuit(circuit_id);
        }
        else {
            debug!(circuit_id, "scheduling deferred unroute");
            tokio::spawn(self.clone().unroute_when_idle(circuit_id.to_string()));
        }
    }

    fn remove_circuit(&self, circuit_id: &str) {
        if self.state.remove_forward_table(circuit_id).is_some() {
            debug!(circuit_id, "removed forward table");
        }
        self.state.unregister_destinations(circuit_id);
    }

    async fn unroute_when_idle(self: Arc<Self>, circuit_id: String) {
        let interval = self.config.xgress_close_check_interval;
        let interval_ms = interval.as_millis() as i64;
        let mut close_notify = self.close_notify.clone();

        loop {
            select! {
                _ = time::sleep(interval) => {}
                _ = close_notify.closed() => return,
            }

            match self.state.xgress_for_circuit(&circuit_id) {
                Some(xgress) => {
                    let idle = self.state.clock().now_millis() - xgress.time_of_last_rx_from_link();
                    if idle >= interval_ms {
                        debug!(circuit_id, "no data received for {} ms, removing circuit", idle);
                        self.remove_circuit(&circuit_id);
                        return;
                    }
                    trace!(circuit_id, "data received {} ms ago, not removing circuit yet", idle);
                }
                None => {
                    self.remove_circuit(&circuit_id);
                    return;
                }
            }
        }
    }

    fn resolve(&self, circuit_id: &str, src_addr: &Address, mark_active: bool, what: &str) -> anyhow::Result<(Address, DestinationEntry)> {
        let table = self.state.forward_table(circuit_id, mark_active)
            .ok_or_else(|| anyhow!("cannot forward {}, no forward table for circuit={} src={}", what, circuit_id, src_addr))?;
        let dst_addr = table.forward_address(src_addr)
            .ok_or_else(|| anyhow!("cannot forward {}, no forward address for circuit={} src={}", what, circuit_id, src_addr))?;
        let destination = self.state.destination(&dst_addr)
            .ok_or_else(|| anyhow!("cannot forward {}, no destination for circuit={} src={} dst={}", what, circuit_id, src_addr, dst_addr))?;
        Ok((dst_addr, destination))
    }

    /// A zero timeout means 'do not wait', which is how payloads from local endpoints are sent
    pub async fn forward_payload(&self, src_addr: &Address, payload: Payload, timeout: Duration) -> anyhow::Result<()> {
        let payload_type = if timeout.is_zero() { PayloadType::Normal } else { PayloadType::Forwarded };
        let (dst_addr, destination) = self.resolve(&payload.circuit_id, src_addr, true, "payload")?;
        trace!(circuit_id = %payload.circuit_id, src = %src_addr, dst = %dst_addr, sequence = payload.sequence, "forwarding payload");
        destination.send_payload(payload, timeout, payload_type).await
    }

    /// Retransmissions do not count as circuit activity
    pub async fn retransmit_payload(&self, src_addr: &Address, payload: Payload) -> anyhow::Result<()> {
        let (dst_addr, destination) = self.resolve(&payload.circuit_id, src_addr, false, "payload")?;
        trace!(circuit_id = %payload.circuit_id, src = %src_addr, dst = %dst_addr, sequence = payload.sequence, "retransmitting payload");
        destination.send_payload(payload, Duration::ZERO, PayloadType::Retransmit).await
    }

    pub async fn forward_acknowledgement(&self, src_addr: &Address, ack: Acknowledgement) -> anyhow::Result<()> {
        let (dst_addr, destination) = self.resolve(&ack.circuit_id, src_addr, true, "acknowledgement")?;
        trace!(circuit_id = %ack.circuit_id, src = %src_addr, dst = %dst_addr, "forwarding acknowledgement");
        destination.send_acknowledgement(ack).await
    }

    /// Trace routes lose a hop on every router; the router where none are left answers instead of
    ///  passing it on. If a trace route can not be passed on, an error response is sent back.
    pub async fn forward_control(&self, src_addr: &Address, mut control: Control) -> anyhow::Result<()> {
        if control.is_trace_route() && control.decrement_and_get_hop() == 0 {
            let response = control.create_trace_response("forwarder", &self.router_id);
            return self.send_control_back(src_addr, response).await;
        }

        let error_response = control.is_trace_route()
            .then(|| control.create_trace_response("forwarder", &self.router_id));

        let result = match self.resolve(&control.circuit_id, src_addr, true, "control") {
            Ok((_, destination)) => destination.send_control(control).await,
            Err(e) => Err(e),
        };

        if let (Err(e), Some(mut response)) = (&result, error_response) {
            response.set_error(&e.to_string());
            if let Err(e) = self.send_control_back(src_addr, response).await {
                debug!(src = %src_addr, "unable to return trace route error: {}", e);
            }
        }
        result
    }

    async fn send_control_back(&self, src_addr: &Address, control: Control) -> anyhow::Result<()> {
        let destination = self.state.destination(src_addr)
            .ok_or_else(|| anyhow!("cannot return control, no destination for circuit={} dst={}", control.circuit_id, src_addr))?;
        destination.send_control(control).await
    }

    pub fn report_forwarding_fault(&self, circuit_id: &str, ctrl_id: &str) {
        self.faulter.report(circuit_id, ctrl_id);
    }

    pub async fn inspect_circuit(&self, circuit_id: &str) -> Option<CircuitInspectDetail> {
        let table = self.state.forward_table(circuit_id, false)?;
        let mut detail = CircuitInspectDetail::new(circuit_id);
        detail.forwards = table.forwards();

        let addresses = detail.forwards.iter()
            .flat_map(|(src, dst)| [src.clone(), dst.clone()])
            .collect::<BTreeSet<_>>();
        for address in addresses {
            if let Some(destination) = self.state.destination(&Address::new(address)) {
                destination.inspect_circuit(&mut detail).await;
            }
        }
        Some(detail)
    }

    pub fn debug(&self) -> ForwarderDebug {
        self.state.debug()
    }
}

#[async_trait]
impl DataPlane for Forwarder {
    async fn forward_payload(&self, src_addr: &Address, payload: Payload, timeout: Duration) -> anyhow::Result<()> {
        Forwarder::forward_payload(self, src_addr, payload, timeout).await
    }

    async fn retransmit_payload(&self, src_addr: &Address, payload: Payload) -> anyhow::Result<()> {
        Forwarder::retransmit_payload(self, src_addr, payload).await
    }

    async fn forward_acknowledgement(&self, src_addr: &Address, ack: Acknowledgement) -> anyhow::Result<()> {
        Forwarder::forward_acknowledgement(self, src_addr, ack).await
    }

    async fn forward_control(&self, src_addr: &Address, control: Control) -> anyhow::Result<()> {
        Forwarder::forward_control(self, src_addr, control).await
    }

    fn report_forwarding_fault(&self, circuit_id: &str, ctrl_id: &str) {
        Forwarder::report_forwarding_fault(self, circuit_id, ctrl_id);
    }
}
