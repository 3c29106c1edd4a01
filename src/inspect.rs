//! Diagnostic snapshots. These are informational only; no routing decision depends on them.

use std::collections::BTreeMap;

/// A snapshot taken either by the task owning the state ([Inspection::Safe]), or read from
///  shared counters without coordination when that task did not answer in time
///  ([Inspection::BestEffort]).
#[derive(Clone, Debug, PartialEq)]
pub enum Inspection<T> {
    Safe(T),
    BestEffort(T),
}
impl<T> Inspection<T> {
    pub fn detail(&self) -> &T {
        match self {
            Inspection::Safe(d) => d,
            Inspection::BestEffort(d) => d,
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Inspection::Safe(_))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecvBufferDetail {
    pub size: u32,
    pub last_size_sent: u32,
    pub sequence: i32,
    pub max_sequence: i32,
    pub next_payload_sequence: Option<i32>,
    pub buffered_payloads: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendBufferDetail {
    pub window_size: u32,
    pub link_send_buffer_size: u32,
    pub link_recv_buffer_size: u32,
    pub buffered_payloads: usize,
    pub received_ack_hwm: i32,
    pub retx_threshold: u32,
    pub last_rtt: u16,
    pub duplicate_acks: u64,
    pub retransmits: u64,
    pub blocked_by_local_window: bool,
    pub blocked_by_remote_window: bool,
    pub closed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct XgressDetail {
    pub address: String,
    pub originator: String,
    pub label: String,
    pub time_since_last_link_rx_ms: i64,
    pub send_buffer: Inspection<SendBufferDetail>,
    pub recv_buffer: Inspection<RecvBufferDetail>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkDetail {
    pub link_id: String,
    pub queued_frames: usize,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CircuitInspectDetail {
    pub circuit_id: String,
    /// source address -> destination address
    pub forwards: BTreeMap<String, String>,
    pub xgress_details: BTreeMap<String, XgressDetail>,
    pub link_details: BTreeMap<String, LinkDetail>,
}
impl CircuitInspectDetail {
    pub fn new(circuit_id: impl Into<String>) -> CircuitInspectDetail {
        CircuitInspectDetail {
            circuit_id: circuit_id.into(),
            ..Default::default()
        }
    }
}

/// Dump of all forwarding state of a router
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwarderDebug {
    /// circuit id -> (source -> destination)
    pub circuits: BTreeMap<String, BTreeMap<String, String>>,
    pub destinations: BTreeMap<String, String>,
}
