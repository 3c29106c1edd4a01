use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::xgress::message::{Acknowledgement, Address, Control, Payload};

/// The routing services local endpoints, links and the delivery pipelines call into. Implemented
///  by the forwarder; a trait so that endpoints can be tested in isolation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataPlane: Send + Sync + 'static {
    async fn forward_payload(&self, src_addr: &Address, payload: Payload, timeout: Duration) -> anyhow::Result<()>;
    async fn retransmit_payload(&self, src_addr: &Address, payload: Payload) -> anyhow::Result<()>;
    async fn forward_acknowledgement(&self, src_addr: &Address, ack: Acknowledgement) -> anyhow::Result<()>;
    async fn forward_control(&self, src_addr: &Address, control: Control) -> anyhow::Result<()>;

    /// record a forwarding fault for a circuit, to be reported to the owning controller. An empty
    ///  `ctrl_id` means the owner is unknown.
    fn report_forwarding_fault(&self, circuit_id: &str, ctrl_id: &str);
}
