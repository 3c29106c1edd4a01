use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::inspect::CircuitInspectDetail;
use crate::xgress::message::{Acknowledgement, Control, Payload};

/// Tells a link why a payload is being sent, which determines the counter that is incremented
///  if the link sheds it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadType {
    /// from a local endpoint
    Normal,
    /// received on a link and passed on, with a timeout
    Forwarded,
    Retransmit,
}

/// Anything payloads, acknowledgements and controls can be sent to
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    async fn send_payload(&self, payload: Payload, timeout: Duration, payload_type: PayloadType) -> anyhow::Result<()>;
    async fn send_acknowledgement(&self, ack: Acknowledgement) -> anyhow::Result<()>;
    async fn send_control(&self, control: Control) -> anyhow::Result<()>;
    async fn inspect_circuit(&self, detail: &mut CircuitInspectDetail);
}

/// A local endpoint of a circuit
pub trait XgressDestination: Destination {
    /// the circuit was removed from the forwarder; the endpoint should wind down
    fn unrouted(&self);
    fn start(&self);
    fn is_terminator(&self) -> bool;
    fn label(&self) -> String;
    fn time_of_last_rx_from_link(&self) -> i64;
}

pub trait LinkDestination: Destination {
    fn id(&self) -> &str;
}

/// The closed set of destination kinds the forwarder distinguishes
#[derive(Clone)]
pub enum DestinationEntry {
    Link(Arc<dyn LinkDestination>),
    Xgress(Arc<dyn XgressDestination>),
}

impl DestinationEntry {
    pub async fn send_payload(&self, payload: Payload, timeout: Duration, payload_type: PayloadType) -> anyhow::Result<()> {
        match self {
            DestinationEntry::Link(l) => l.send_payload(payload, timeout, payload_type).await,
            DestinationEntry::Xgress(x) => x.send_payload(payload, timeout, payload_type).await,
        }
    }

    pub async fn send_acknowledgement(&self, ack: Acknowledgement) -> anyhow::Result<()> {
        match self {
            DestinationEntry::Link(l) => l.send_acknowledgement(ack).await,
            DestinationEntry::Xgress(x) => x.send_acknowledgement(ack).await,
        }
    }

    pub async fn send_control(&self, control: Control) -> anyhow::Result<()> {
        match self {
            DestinationEntry::Link(l) => l.send_control(control).await,
            DestinationEntry::Xgress(x) => x.send_control(control).await,
        }
    }

    pub async fn inspect_circuit(&self, detail: &mut CircuitInspectDetail) {
        match self {
            DestinationEntry::Link(l) => l.inspect_circuit(detail).await,
            DestinationEntry::Xgress(x) => x.inspect_circuit(detail).await,
        }
    }

    pub fn as_xgress(&self) -> Option<&Arc<dyn XgressDestination>> {
        match self {
            DestinationEntry::Xgress(x) => Some(x),
            DestinationEntry::Link(_) => None,
        }
    }

    pub fn is_link(&self, link: &Arc<dyn LinkDestination>) -> bool {
        match self {
            DestinationEntry::Link(l) => std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(link)),
            DestinationEntry::Xgress(_) => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DestinationEntry::Link(l) => format!("link {}", l.id()),
            DestinationEntry::Xgress(x) => format!("xgress {}", x.label()),
        }
    }
}
