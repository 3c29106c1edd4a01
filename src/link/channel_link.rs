use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, trace, warn};

use crate::forwarder::destination::{Destination, LinkDestination, PayloadType};
use crate::inspect::{CircuitInspectDetail, LinkDetail};
use crate::metrics::DataPlaneMetrics;
use crate::util::close_notify::CloseNotify;
use crate::xgress::data_plane::DataPlane;
use crate::xgress::message::{is_send_timeout, Acknowledgement, Address, Control, LinkFrame, Payload, SendTimeout};

/// A link to another router, sending encoded [LinkFrame]s through a bounded channel
pub struct ChannelLink {
    id: String,
    frames: mpsc::Sender<Bytes>,
    metrics: Arc<DataPlaneMetrics>,
}

impl ChannelLink {
    pub fn new(id: &str, frames: mpsc::Sender<Bytes>, metrics: Arc<DataPlaneMetrics>) -> ChannelLink {
        ChannelLink {
            id: id.to_string(),
            frames,
            metrics,
        }
    }

    fn count_dropped(&self, payload_type: PayloadType) {
        match payload_type {
            PayloadType::Normal => self.metrics.link_dropped_xg_payloads.inc(),
            PayloadType::Forwarded => self.metrics.link_dropped_fwd_payloads.inc(),
            PayloadType::Retransmit => self.metrics.link_dropped_rtx_payloads.inc(),
        };
    }
}

#[async_trait]
impl Destination for ChannelLink {
    /// With a zero timeout, a payload that does not fit into the queue is dropped rather than
    ///  waited for. Retransmission takes care of it.
    async fn send_payload(&self, payload: Payload, timeout: Duration, payload_type: PayloadType) -> anyhow::Result<()> {
        let sequence = payload.sequence;
        let frame = LinkFrame::Payload(payload).to_bytes();

        if timeout.is_zero() {
            match self.frames.try_send(frame) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    trace!(link_id = %self.id, sequence, ?payload_type, "link queue is full, dropping payload");
                    self.count_dropped(payload_type);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => bail!("link {} is closed", self.id),
            }
        }
        else {
            match self.frames.send_timeout(frame, timeout).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(SendTimeout.into()),
                Err(SendTimeoutError::Closed(_)) => bail!("link {} is closed", self.id),
            }
        }
    }

    async fn send_acknowledgement(&self, ack: Acknowledgement) -> anyhow::Result<()> {
        match self.frames.try_send(LinkFrame::Ack(ack).to_bytes()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => bail!("link {} queue is full, dropping acknowledgement", self.id),
            Err(TrySendError::Closed(_)) => bail!("link {} is closed", self.id),
        }
    }

    async fn send_control(&self, control: Control) -> anyhow::Result<()> {
        self.frames.send(LinkFrame::Control(control).to_bytes()).await
            .map_err(|_| anyhow!("link {} is closed", self.id))
    }

    async fn inspect_circuit(&self, detail: &mut CircuitInspectDetail) {
        let queue_capacity = self.frames.max_capacity();
        detail.link_details.insert(self.id.clone(), LinkDetail {
            link_id: self.id.clone(),
            queued_frames: queue_capacity - self.frames.capacity(),
            queue_capacity,
        });
    }
}

impl LinkDestination for ChannelLink {
    fn id(&self) -> &str {
        &self.id
    }
}

/// The two directions of one router's end of a link
pub struct LinkEnd {
    pub id: String,
    pub outbound: mpsc::Sender<Bytes>,
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Connects two routers back to back
pub fn channel_link_pair(id: &str, capacity: usize) -> (LinkEnd, LinkEnd) {
    let (a_to_b, b_from_a) = mpsc::channel(capacity);
    let (b_to_a, a_from_b) = mpsc::channel(capacity);
    (
        LinkEnd { id: id.to_string(), outbound: a_to_b, inbound: a_from_b },
        LinkEnd { id: id.to_string(), outbound: b_to_a, inbound: b_from_a },
    )
}

/// Passes everything arriving on a link to the data plane, with the link as source address.
///  Returns when the link is closed by the other side or on shutdown.
pub async fn run_link_receiver(
    link_id: Address,
    mut inbound: mpsc::Receiver<Bytes>,
    data_plane: Arc<dyn DataPlane>,
    payload_forward_timeout: Duration,
    mut close_notify: CloseNotify,
) {
    loop {
        let raw = select! {
            raw = inbound.recv() => match raw {
                Some(raw) => raw,
                None => {
                    debug!(%link_id, "link closed by peer");
                    return;
                }
            },
            _ = close_notify.closed() => return,
        };

        let frame = match LinkFrame::deser(&mut raw.as_ref()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%link_id, "received invalid frame, ignoring: {}", e);
                continue;
            }
        };

        match frame {
            LinkFrame::Payload(payload) => {
                let circuit_id = payload.circuit_id.clone();
                if let Err(e) = data_plane.forward_payload(&link_id, payload, payload_forward_timeout).await {
                    if is_send_timeout(&e) {
                        trace!(%link_id, circuit_id, "timeout forwarding payload");
                    }
                    else {
                        debug!(%link_id, circuit_id, "unable to forward payload: {}", e);
                        data_plane.report_forwarding_fault(&circuit_id, "");
                    }
                }
            }
            LinkFrame::Ack(ack) => {
                if let Err(e) = data_plane.forward_acknowledgement(&link_id, ack).await {
                    debug!(%link_id, "unable to forward acknowledgement: {}", e);
                }
            }
            LinkFrame::Control(control) => {
                if let Err(e) = data_plane.forward_control(&link_id, control).await {
                    debug!(%link_id, "unable to forward control: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::close_notify::Closer;
    use crate::xgress::data_plane::MockDataPlane;
    use crate::xgress::message::Originator;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload(sequence: i32) -> Payload {
        Payload::new("c", Originator::Initiator, sequence, Bytes::from_static(b"abc"))
    }

    #[rstest]
    #[case::normal(PayloadType::Normal)]
    #[case::forwarded(PayloadType::Forwarded)]
    #[case::retransmit(PayloadType::Retransmit)]
    #[tokio::test]
    async fn test_full_queue_sheds_payloads(#[case] payload_type: PayloadType) {
        let metrics = Arc::new(DataPlaneMetrics::default());
        let (end_a, mut end_b) = channel_link_pair("l1", 1);
        let link = ChannelLink::new("l1", end_a.outbound, metrics.clone());

        link.send_payload(payload(0), Duration::ZERO, payload_type).await.unwrap();
        link.send_payload(payload(1), Duration::ZERO, payload_type).await.unwrap();

        let dropped = [
            metrics.link_dropped_xg_payloads.get(),
            metrics.link_dropped_fwd_payloads.get(),
            metrics.link_dropped_rtx_payloads.get(),
        ];
        assert_eq!(dropped.iter().sum::<u64>(), 1);
        let expected_idx = match payload_type {
            PayloadType::Normal => 0,
            PayloadType::Forwarded => 1,
            PayloadType::Retransmit => 2,
        };
        assert_eq!(dropped[expected_idx], 1);

        let raw = end_b.inbound.recv().await.unwrap();
        assert_eq!(LinkFrame::deser(&mut raw.as_ref()).unwrap(), LinkFrame::Payload(payload(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_timeout() {
        let (end_a, _end_b) = channel_link_pair("l1", 1);
        let link = ChannelLink::new("l1", end_a.outbound, Default::default());

        link.send_payload(payload(0), Duration::from_millis(10), PayloadType::Forwarded).await.unwrap();
        let err = link.send_payload(payload(1), Duration::from_millis(10), PayloadType::Forwarded).await.unwrap_err();
        assert!(is_send_timeout(&err));

        assert!(link.send_acknowledgement(Acknowledgement::new("c", Originator::Terminator)).await.is_err());

        let mut detail = CircuitInspectDetail::new("c");
        link.inspect_circuit(&mut detail).await;
        assert_eq!(detail.link_details.get("l1"), Some(&LinkDetail { link_id: "l1".to_string(), queued_frames: 1, queue_capacity: 1 }));
    }

    #[tokio::test]
    async fn test_closed_link() {
        let (end_a, end_b) = channel_link_pair("l1", 4);
        drop(end_b);
        let link = ChannelLink::new("l1", end_a.outbound, Default::default());

        assert!(link.send_payload(payload(0), Duration::ZERO, PayloadType::Normal).await.is_err());
        assert!(link.send_payload(payload(0), Duration::from_millis(10), PayloadType::Normal).await.is_err());
        assert!(link.send_control(Control::new_trace_route("c", 1, 0, 0)).await.is_err());
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Forwarded,
        Timeout,
        Failed,
    }

    #[rstest]
    #[case::forwarded(Outcome::Forwarded, 0)]
    #[case::timeout(Outcome::Timeout, 0)]
    #[case::failed(Outcome::Failed, 1)]
    #[tokio::test]
    async fn test_receiver_forwards_with_link_as_source(#[case] outcome: Outcome, #[case] expected_faults: usize) {
        let closer = Closer::new();
        let forwarded = Arc::new(AtomicUsize::new(0));

        let mut data_plane = MockDataPlane::new();
        let counter = forwarded.clone();
        data_plane.expect_forward_payload()
            .withf(|src, payload, timeout| src.as_str() == "l1" && payload.sequence == 7 && *timeout == Duration::from_millis(500))
            .times(1)
            .returning(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                match outcome {
                    Outcome::Forwarded => Ok(()),
                    Outcome::Timeout => Err(SendTimeout.into()),
                    Outcome::Failed => Err(anyhow!("no forward table")),
                }
            });
        data_plane.expect_forward_acknowledgement()
            .withf(|src, ack| src.as_str() == "l1" && ack.sequences == vec![7])
            .times(1)
            .returning(|_, _| Ok(()));
        data_plane.expect_report_forwarding_fault()
            .withf(|circuit_id, ctrl_id| circuit_id == "c" && ctrl_id.is_empty())
            .times(expected_faults)
            .return_const(());

        let (end_a, end_b) = channel_link_pair("l1", 4);
        let receiver = tokio::spawn(run_link_receiver(Address::new("l1"), end_a.inbound, Arc::new(data_plane), Duration::from_millis(500), closer.notify()));

        let mut ack = Acknowledgement::new("c", Originator::Terminator);
        ack.sequences.push(7);
        end_b.outbound.send(Bytes::from_static(b"\x09garbage")).await.unwrap();
        end_b.outbound.send(LinkFrame::Payload(payload(7)).to_bytes()).await.unwrap();
        end_b.outbound.send(LinkFrame::Ack(ack).to_bytes()).await.unwrap();
        drop(end_b);

        receiver.await.unwrap();
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_receiver_stops_on_shutdown() {
        let closer = Closer::new();
        let (end_a, _end_b) = channel_link_pair("l1", 4);
        let receiver = tokio::spawn(run_link_receiver(Address::new("l1"), end_a.inbound, Arc::new(MockDataPlane::new()), Duration::ZERO, closer.notify()));

        closer.close();
        receiver.await.unwrap();
    }
}
