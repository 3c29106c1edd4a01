use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::metrics::DataPlaneMetrics;
use crate::util::close_notify::CloseNotify;
use crate::util::unblocking_queue::{QueueSink, UnblockingQueue};
use crate::xgress::data_plane::DataPlane;
use crate::xgress::message::{Acknowledgement, Address};

struct AckEntry {
    address: Address,
    ack: Acknowledgement,
}

/// Sends acknowledgements in the order they become due, without making the acknowledging
///  endpoint wait for the data plane
pub struct Acker {
    queue: UnblockingQueue<AckEntry>,
}

impl Acker {
    pub fn new(data_plane: Arc<dyn DataPlane>, metrics: Arc<DataPlaneMetrics>, queue_size: usize, close_notify: CloseNotify) -> Acker {
        let depth = metrics.ack_queue_size.clone();
        let sender = AckSender { data_plane, metrics };
        Acker {
            queue: UnblockingQueue::spawn("ack", VecDeque::new(), sender, depth, queue_size, close_notify),
        }
    }

    pub async fn ack(&self, ack: Acknowledgement, address: Address) {
        if let Err(e) = self.queue.push(AckEntry { address, ack }).await {
            debug!("dropping acknowledgement: {}", e);
        }
    }
}

struct AckSender {
    data_plane: Arc<dyn DataPlane>,
    metrics: Arc<DataPlaneMetrics>,
}

#[async_trait]
impl QueueSink<AckEntry> for AckSender {
    async fn deliver(&self, entry: AckEntry) {
        let circuit_id = entry.ack.circuit_id.clone();
        // acks are not retried: a lost ack costs a retransmission of its payloads
        match self.data_plane.forward_acknowledgement(&entry.address, entry.ack).await {
            Ok(()) => {
                trace!(circuit_id, src = %entry.address, "sent acknowledgement");
                self.metrics.acks_sent.inc();
            }
            Err(e) => {
                debug!(circuit_id, src = %entry.address, "unable to send acknowledgement: {}", e);
                self.metrics.ack_failures.inc();
            }
        }
    }
}
