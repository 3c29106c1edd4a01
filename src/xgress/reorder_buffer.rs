use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::inspect::RecvBufferDetail;
use crate::metrics::DataPlaneMetrics;
use crate::xgress::message::Payload;

/// Counters of a [ReorderBuffer] that are readable without holding the buffer itself, e.g. for
///  best-effort inspection
#[derive(Debug)]
pub struct ReorderStats {
    sequence: AtomicI32,
    max_sequence: AtomicI32,
    size: AtomicU32,
    last_size_sent: AtomicU32,
    buffered_payloads: AtomicUsize,
}
impl ReorderStats {
    /// sequence of the last payload that was removed for delivery
    pub fn sequence(&self) -> i32 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn max_sequence(&self) -> i32 {
        self.max_sequence.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn last_size_sent(&self) -> u32 {
        self.last_size_sent.load(Ordering::Acquire)
    }

    pub fn mark_size_sent(&self, size: u32) {
        self.last_size_sent.store(size, Ordering::Release);
    }

    pub fn best_effort_detail(&self) -> RecvBufferDetail {
        RecvBufferDetail {
            size: self.size(),
            last_size_sent: self.last_size_sent(),
            sequence: self.sequence(),
            max_sequence: self.max_sequence(),
            next_payload_sequence: None,
            buffered_payloads: self.buffered_payloads.load(Ordering::Acquire),
        }
    }
}

/// Receive side buffer that turns payloads arriving in any order into a gap-free ascending
///  sequence. Sequences start at 0.
///
/// NB: size accounting covers payload data only, not headers
pub struct ReorderBuffer {
    tree: BTreeMap<i32, Payload>,
    stats: Arc<ReorderStats>,
    metrics: Arc<DataPlaneMetrics>,
}

impl ReorderBuffer {
    pub fn new(metrics: Arc<DataPlaneMetrics>) -> ReorderBuffer {
        ReorderBuffer {
            tree: BTreeMap::new(),
            stats: Arc::new(ReorderStats {
                sequence: AtomicI32::new(-1),
                max_sequence: AtomicI32::new(-1),
                size: AtomicU32::new(0),
                last_size_sent: AtomicU32::new(0),
                buffered_payloads: AtomicUsize::new(0),
            }),
            metrics,
        }
    }

    pub fn stats(&self) -> Arc<ReorderStats> {
        self.stats.clone()
    }

    pub fn size(&self) -> u32 {
        self.stats.size()
    }

    /// Returns `true` if the payload was accepted or was a duplicate (both of which should be
    ///  acknowledged), `false` if it was dropped for lack of space.
    ///
    /// A full buffer still accepts payloads with sequences at or below the highest sequence seen
    ///  so far: they fill gaps, and without them the buffer could never drain.
    pub fn receive_unordered(&mut self, payload: Payload, max_size: u32) -> bool {
        let sequence = payload.sequence;
        if sequence <= self.stats.sequence() {
            trace!(circuit_id = %payload.circuit_id, sequence, "payload was already delivered");
            self.metrics.duplicate_payloads.inc();
            return true;
        }

        if self.stats.size() > max_size && sequence > self.stats.max_sequence() {
            debug!(circuit_id = %payload.circuit_id, sequence, size = self.stats.size(), "receive buffer full, dropping payload");
            self.metrics.dropped_payloads.inc();
            return false;
        }

        let payload_size = payload.size();
        match self.tree.entry(sequence) {
            Entry::Occupied(_) => {
                trace!(circuit_id = %payload.circuit_id, sequence, "payload is already buffered");
                self.metrics.duplicate_payloads.inc();
            }
            Entry::Vacant(e) => {
                e.insert(payload);
                self.stats.size.fetch_add(payload_size, Ordering::AcqRel);
                self.stats.buffered_payloads.store(self.tree.len(), Ordering::Release);
                if sequence > self.stats.max_sequence() {
                    self.stats.max_sequence.store(sequence, Ordering::Release);
                }
            }
        }
        true
    }

    /// The lowest buffered payload, if it is the next one to deliver
    pub fn peek_head(&self) -> Option<&Payload> {
        let next = self.stats.sequence().checked_add(1)?;
        self.tree.first_key_value()
            .filter(|(&sequence, _)| sequence == next)
            .map(|(_, payload)| payload)
    }

    pub fn remove(&mut self, sequence: i32) -> Option<Payload> {
        let payload = self.tree.remove(&sequence)?;
        self.stats.sequence.store(sequence, Ordering::Release);
        self.stats.size.fetch_sub(payload.size(), Ordering::AcqRel);
        self.stats.buffered_payloads.store(self.tree.len(), Ordering::Release);
        Some(payload)
    }

    pub fn inspect(&self) -> RecvBufferDetail {
        RecvBufferDetail {
            next_payload_sequence: self.tree.keys().next().copied(),
            buffered_payloads: self.tree.len(),
            ..self.stats.best_effort_detail()
        }
    }
}
