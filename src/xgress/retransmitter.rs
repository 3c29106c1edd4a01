use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, trace};

use crate::metrics::DataPlaneMetrics;
use crate::util::clock::MonotonicClock;
use crate::util::close_notify::CloseNotify;
use crate::util::unblocking_queue::{QueueSink, UnblockingQueue};
use crate::xgress::data_plane::DataPlane;
use crate::xgress::retransmit_queue::RetransmitQueue;
use crate::xgress::tx_payload::TxPayload;

/// Resends payloads whose acknowledgement is overdue, in the order they were queued. Shared by
///  all endpoints of a router.
pub struct Retransmitter {
    queue: UnblockingQueue<Arc<TxPayload>>,
}

impl Retransmitter {
    pub fn new(
        data_plane: Arc<dyn DataPlane>,
        metrics: Arc<DataPlaneMetrics>,
        clock: MonotonicClock,
        queue_size: usize,
        close_notify: CloseNotify,
    ) -> Retransmitter {
        let depth = metrics.retransmitter_queue_size.clone();
        let sender = RetransmitSender { data_plane, metrics, clock };
        Retransmitter {
            queue: UnblockingQueue::spawn("retransmit", RetransmitQueue::new(), sender, depth, queue_size, close_notify),
        }
    }

    /// Callers are expected to have called [TxPayload::mark_queued] successfully
    pub async fn queue(&self, tx: Arc<TxPayload>) {
        if let Err(e) = self.queue.push(tx.clone()).await {
            debug!("not retransmitting payload {}: {}", tx.sequence(), e);
            tx.dequeued();
        }
    }
}

struct RetransmitSender {
    data_plane: Arc<dyn DataPlane>,
    metrics: Arc<DataPlaneMetrics>,
    clock: MonotonicClock,
}

#[async_trait]
impl QueueSink<Arc<TxPayload>> for RetransmitSender {
    async fn deliver(&self, tx: Arc<TxPayload>) {
        if tx.is_acked() {
            trace!(circuit_id = %tx.payload.circuit_id, sequence = tx.sequence(), "acknowledged before retransmission");
            return;
        }

        let origin = tx.origin().clone();
        let mut payload = tx.payload.clone();
        payload.rtt = 0;

        match self.data_plane.retransmit_payload(&origin.address, payload).await {
            Ok(()) => {
                tx.mark_sent(self.clock.now_millis());
                self.metrics.retransmissions.inc();
            }
            Err(e) if origin.is_closed() => {
                trace!(circuit_id = %origin.circuit_id, src = %origin.address, "retransmission for closed endpoint failed: {}", e);
            }
            Err(e) => {
                error!(circuit_id = %origin.circuit_id, src = %origin.address, "retransmission failed: {}", e);
                self.metrics.retransmission_failures.inc();
                self.data_plane.report_forwarding_fault(&origin.circuit_id, &origin.ctrl_id);
            }
        }
        tx.dequeued();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::wait_until;
    use crate::util::close_notify::Closer;
    use crate::xgress::data_plane::MockDataPlane;
    use crate::xgress::message::{Address, Originator, Payload};
    use crate::xgress::tx_payload::SendOrigin;
    use anyhow::anyhow;
    use bytes::Bytes;
    use rstest::rstest;

    fn tx(origin: &Arc<SendOrigin>, sequence: i32) -> Arc<TxPayload> {
        let mut payload = Payload::new("c", Originator::Initiator, sequence, Bytes::from_static(b"data"));
        payload.rtt = 1234;
        let tx = Arc::new(TxPayload::new(payload, origin.clone()));
        assert!(tx.mark_queued());
        tx
    }

    #[tokio::test]
    async fn test_acked_payload_is_not_retransmitted() {
        let closer = Closer::new();
        let metrics = Arc::new(DataPlaneMetrics::default());
        let origin = Arc::new(SendOrigin::new(Address::new("x"), "c", "ctrl"));

        let mut data_plane = MockDataPlane::new();
        data_plane.expect_retransmit_payload()
            .withf(|src, payload| src.as_str() == "x" && payload.sequence == 1 && payload.rtt == 0)
            .times(1)
            .returning(|_, _| Ok(()));

        let retransmitter = Retransmitter::new(Arc::new(data_plane), metrics.clone(), MonotonicClock::new(), 4, closer.notify());

        let acked = tx(&origin, 0);
        let unacked = tx(&origin, 1);
        acked.mark_acked();
        retransmitter.queue(acked.clone()).await;
        retransmitter.queue(unacked.clone()).await;

        wait_until(|| metrics.retransmissions.get() == 1).await;
        assert!(acked.is_acked());
        // still eligible for another round until acknowledged
        assert!(unacked.is_retransmittable());
        assert_ne!(unacked.age(), i64::MAX);
    }

    #[rstest]
    #[case::open_endpoint(false, 1)]
    #[case::closed_endpoint(true, 0)]
    #[tokio::test]
    async fn test_failure(#[case] closed: bool, #[case] expected_faults: usize) {
        let closer = Closer::new();
        let metrics = Arc::new(DataPlaneMetrics::default());
        let origin = Arc::new(SendOrigin::new(Address::new("x"), "c", "ctrl"));
        if closed {
            origin.mark_closed();
        }

        let mut data_plane = MockDataPlane::new();
        data_plane.expect_retransmit_payload()
            .returning(|_, _| Err(anyhow!("no destination")));
        data_plane.expect_report_forwarding_fault()
            .withf(|circuit_id, ctrl_id| circuit_id == "c" && ctrl_id == "ctrl")
            .times(expected_faults)
            .return_const(());

        let retransmitter = Retransmitter::new(Arc::new(data_plane), metrics.clone(), MonotonicClock::new(), 4, closer.notify());
        let entry = tx(&origin, 0);
        retransmitter.queue(entry.clone()).await;

        wait_until(|| entry.is_retransmittable()).await;
        assert_eq!(metrics.retransmissions.get(), 0);
        assert_eq!(metrics.retransmission_failures.get(), expected_faults as u64);
    }
}
