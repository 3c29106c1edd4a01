use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::xgress::message::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestType {
    Link,
    /// the egress endpoint, created by the same call chain as the route
    End,
    Start,
    /// the ingress endpoint, which may not be established yet when the route arrives
    Ingress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forward {
    pub src_address: Address,
    pub dst_address: Address,
    pub dst_type: DestType,
}
impl Forward {
    pub fn new(src_address: impl Into<Address>, dst_address: impl Into<Address>, dst_type: DestType) -> Forward {
        Forward {
            src_address: src_address.into(),
            dst_address: dst_address.into(),
            dst_type,
        }
    }
}

/// Instructions for dialing the terminating service. The forwarder does not look at these, they
///  are passed through to whatever creates egress endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Egress {
    pub binding: String,
    pub address: String,
    pub destination: String,
    pub peer_data: BTreeMap<u32, Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub circuit_id: String,
    pub forwards: Vec<Forward>,
    pub egress: Option<Egress>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unroute {
    pub circuit_id: String,
    /// remove immediately rather than waiting for traffic to stop
    pub now: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultSubject {
    LinkFault,
    ForwardFault,
    UnknownOwnerForwardFault,
}
impl Display for FaultSubject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultSubject::LinkFault => f.write_str("LinkFault"),
            FaultSubject::ForwardFault => f.write_str("ForwardFault"),
            FaultSubject::UnknownOwnerForwardFault => f.write_str("UnknownOwnerForwardFault"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub subject: FaultSubject,
    /// a link id, or space separated circuit ids
    pub id: String,
}

/// Asks a controller whether idle circuits should still exist
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CircuitConfirmation {
    pub circuit_ids: Vec<String>,
    /// circuit id -> idle millis
    pub idle_times: BTreeMap<String, i64>,
}
