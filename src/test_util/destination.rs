use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::forwarder::destination::{Destination, LinkDestination, PayloadType, XgressDestination};
use crate::inspect::{CircuitInspectDetail, LinkDetail};
use crate::xgress::message::{Acknowledgement, Control, Payload};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Payload(Payload, PayloadType),
    Ack(Acknowledgement),
    Control(Control),
}

/// A destination that records everything sent to it. It can be registered both as a link and as
///  a local endpoint.
#[derive(Debug)]
pub struct TrackingDestination {
    id: String,
    sent: Mutex<Vec<Sent>>,
    failure: Mutex<Option<String>>,
    unrouted: AtomicUsize,
    last_rx: AtomicI64,
}

impl TrackingDestination {
    pub fn new(id: &str) -> Arc<TrackingDestination> {
        Arc::new(TrackingDestination {
            id: id.to_string(),
            sent: Default::default(),
            failure: Default::default(),
            unrouted: Default::default(),
            last_rx: Default::default(),
        })
    }

    /// returns everything sent so far, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn num_sent(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn payloads(&self) -> Vec<(Payload, PayloadType)> {
        self.sent.lock().iter()
            .filter_map(|s| match s {
                Sent::Payload(p, t) => Some((p.clone(), *t)),
                _ => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<Acknowledgement> {
        self.sent.lock().iter()
            .filter_map(|s| match s {
                Sent::Ack(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn controls(&self) -> Vec<Control> {
        self.sent.lock().iter()
            .filter_map(|s| match s {
                Sent::Control(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// subsequent sends fail with this message
    pub fn fail_sends(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn set_last_rx(&self, millis: i64) {
        self.last_rx.store(millis, Ordering::SeqCst);
    }

    pub fn num_unrouted(&self) -> usize {
        self.unrouted.load(Ordering::SeqCst)
    }

    fn record(&self, sent: Sent) -> anyhow::Result<()> {
        if let Some(message) = self.failure.lock().as_ref() {
            bail!("{}", message);
        }
        self.sent.lock().push(sent);
        Ok(())
    }
}

#[async_trait]
impl Destination for TrackingDestination {
    async fn send_payload(&self, payload: Payload, _timeout: Duration, payload_type: PayloadType) -> anyhow::Result<()> {
        self.record(Sent::Payload(payload, payload_type))
    }

    async fn send_acknowledgement(&self, ack: Acknowledgement) -> anyhow::Result<()> {
        self.record(Sent::Ack(ack))
    }

    async fn send_control(&self, control: Control) -> anyhow::Result<()> {
        self.record(Sent::Control(control))
    }

    async fn inspect_circuit(&self, detail: &mut CircuitInspectDetail) {
        detail.link_details.insert(self.id.clone(), LinkDetail {
            link_id: self.id.clone(),
            queued_frames: self.num_sent(),
            queue_capacity: 0,
        });
    }
}

impl XgressDestination for TrackingDestination {
    fn unrouted(&self) {
        self.unrouted.fetch_add(1, Ordering::SeqCst);
    }

    fn start(&self) {}

    fn is_terminator(&self) -> bool {
        false
    }

    fn label(&self) -> String {
        format!("tracking {}", self.id)
    }

    fn time_of_last_rx_from_link(&self) -> i64 {
        self.last_rx.load(Ordering::SeqCst)
    }
}

impl LinkDestination for TrackingDestination {
    fn id(&self) -> &str {
        &self.id
    }
}
