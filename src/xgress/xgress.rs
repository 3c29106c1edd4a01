use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::XgressOptions;
use crate::forwarder::destination::{Destination, PayloadType, XgressDestination};
use crate::inspect::{CircuitInspectDetail, Inspection, RecvBufferDetail, XgressDetail};
use crate::metrics::DataPlaneMetrics;
use crate::util::clock::MonotonicClock;
use crate::util::close_notify::{CloseNotify, Closer};
use crate::xgress::acker::Acker;
use crate::xgress::data_plane::DataPlane;
use crate::xgress::link_send_buffer::LinkSendBuffer;
use crate::xgress::message::{is_send_timeout, Acknowledgement, Address, Control, Originator, Payload, SendTimeout, PAYLOAD_FLAG_CIRCUIT_END};
use crate::xgress::payload_ingester::{IngestTarget, PayloadIngester};
use crate::xgress::reorder_buffer::{ReorderBuffer, ReorderStats};
use crate::xgress::retransmitter::Retransmitter;
use crate::xgress::tx_payload::SendOrigin;

/// The local peer of an endpoint, e.g. a client or service connection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// `None` when the peer has no more data
    async fn read_payload(&self) -> anyhow::Result<Option<Bytes>>;
    async fn write_payload(&self, data: Bytes) -> anyhow::Result<()>;
    fn close(&self);
    fn label(&self) -> String;
}

/// Collaborators shared by all endpoints of a router
pub struct XgressEnv {
    pub router_id: String,
    pub options: XgressOptions,
    pub data_plane: Arc<dyn DataPlane>,
    pub acker: Arc<Acker>,
    pub retransmitter: Arc<Retransmitter>,
    pub payload_ingester: Arc<PayloadIngester>,
    pub metrics: Arc<DataPlaneMetrics>,
    pub clock: MonotonicClock,
    pub inspect_timeout: Duration,
    /// router shutdown
    pub shutdown: CloseNotify,
}

/// The local endpoint of a circuit: moves data between a [Connection] and the data plane,
///  sequencing, buffering and acknowledging it along the way.
pub struct Xgress {
    origin: Arc<SendOrigin>,
    originator: Originator,
    peer: Arc<dyn Connection>,
    env: Arc<XgressEnv>,
    self_ref: Weak<Xgress>,

    /// NB: only the payload ingester's task locks this
    rx_buffer: Mutex<ReorderBuffer>,
    rx_stats: Arc<ReorderStats>,
    tx_queue: mpsc::Sender<Payload>,
    tx_queue_rx: Mutex<Option<mpsc::Receiver<Payload>>>,

    send_buffer: LinkSendBuffer,
    next_sequence: AtomicI32,
    time_of_last_rx_from_link: AtomicI64,
    started: AtomicBool,
    closer: Closer,
}

impl Xgress {
    pub fn new(
        circuit_id: &str,
        ctrl_id: &str,
        address: Address,
        originator: Originator,
        peer: Arc<dyn Connection>,
        env: Arc<XgressEnv>,
    ) -> Arc<Xgress> {
        let origin = Arc::new(SendOrigin::new(address, circuit_id, ctrl_id));
        let closer = Closer::new();
        let rx_buffer = ReorderBuffer::new(env.metrics.clone());
        let rx_stats = rx_buffer.stats();
        let (tx_queue, tx_queue_rx) = mpsc::channel(env.options.tx_queue_size);
        let send_buffer = LinkSendBuffer::new(
            origin.clone(),
            &env.options,
            env.retransmitter.clone(),
            env.metrics.clone(),
            env.clock,
            closer.notify(),
        );
        let now = env.clock.now_millis();

        Arc::new_cyclic(|self_ref| Xgress {
            origin,
            originator,
            peer,
            env,
            self_ref: self_ref.clone(),
            rx_buffer: Mutex::new(rx_buffer),
            rx_stats,
            tx_queue,
            tx_queue_rx: Mutex::new(Some(tx_queue_rx)),
            send_buffer,
            next_sequence: AtomicI32::new(0),
            time_of_last_rx_from_link: AtomicI64::new(now),
            started: AtomicBool::new(false),
            closer,
        })
    }

    pub fn address(&self) -> &Address {
        &self.origin.address
    }

    pub fn circuit_id(&self) -> &str {
        &self.origin.circuit_id
    }

    pub fn originator(&self) -> Originator {
        self.originator
    }

    pub fn is_closed(&self) -> bool {
        self.origin.is_closed()
    }

    pub fn close(&self) {
        if self.origin.mark_closed() {
            debug!(circuit_id = self.circuit_id(), address = %self.address(), "closing xgress");
            self.closer.close();
            self.peer.close();
        }
    }

    async fn rx_loop(self: Arc<Self>) {
        let mut close_notify = self.closer.notify();
        loop {
            let read = select! {
                read = self.peer.read_payload() => read,
                _ = close_notify.closed() => break,
            };
            match read {
                Ok(Some(data)) => {
                    if !self.send_data(data, 0).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(circuit_id = self.circuit_id(), "peer has no more data, sending end of circuit");
                    self.send_data(Bytes::new(), PAYLOAD_FLAG_CIRCUIT_END).await;
                    break;
                }
                Err(e) => {
                    warn!(circuit_id = self.circuit_id(), "error reading from {}: {}", self.peer.label(), e);
                    self.send_data(Bytes::new(), PAYLOAD_FLAG_CIRCUIT_END).await;
                    break;
                }
            }
        }
        trace!(circuit_id = self.circuit_id(), "rx loop finished");
    }

    /// returns `false` if the endpoint can not send anymore
    async fn send_data(&self, data: Bytes, flags: u32) -> bool {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let mut payload = Payload::new(self.circuit_id(), self.originator, sequence, data);
        payload.flags |= flags;
        payload.rtt = self.env.clock.now_millis() as u16;

        let tx = match self.send_buffer.buffer_payload(payload.clone()).await {
            Ok(tx) => tx,
            Err(e) => {
                debug!(circuit_id = self.circuit_id(), "not sending payload {}: {}", sequence, e);
                return false;
            }
        };

        let result = self.env.data_plane.forward_payload(self.address(), payload, Duration::ZERO).await;
        tx.mark_sent(self.env.clock.now_millis());

        match result {
            Ok(()) => {}
            Err(e) if is_send_timeout(&e) => {
                trace!(circuit_id = self.circuit_id(), "timeout forwarding payload {}, leaving it to retransmission", sequence);
            }
            Err(e) => {
                warn!(circuit_id = self.circuit_id(), "failure to forward payload {}: {}", sequence, e);
                self.env.data_plane.report_forwarding_fault(self.circuit_id(), &self.origin.ctrl_id);
            }
        }
        true
    }

    async fn tx_loop(self: Arc<Self>, mut tx_queue: mpsc::Receiver<Payload>) {
        let mut close_notify = self.closer.notify();
        let mut shutdown = self.env.shutdown.clone();
        loop {
            let payload = select! {
                payload = tx_queue.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = close_notify.closed() => break,
                _ = shutdown.closed() => {
                    self.close();
                    break;
                }
            };

            if !payload.data.is_empty() {
                if let Err(e) = self.peer.write_payload(payload.data.clone()).await {
                    debug!(circuit_id = self.circuit_id(), "error writing to {}: {}", self.peer.label(), e);
                    self.close();
                    break;
                }
            }

            if payload.is_circuit_end() {
                debug!(circuit_id = self.circuit_id(), "received end of circuit");
                self.close();
                break;
            }

            self.env.payload_ingester.request_send(self.clone()).await;
        }
        trace!(circuit_id = self.circuit_id(), "tx loop finished");
    }

    async fn send_empty_ack(&self, size: u32) {
        let mut ack = Acknowledgement::new(self.circuit_id(), self.originator);
        ack.recv_buffer_size = size;
        self.rx_stats.mark_size_sent(size);
        self.env.acker.ack(ack, self.address().clone()).await;
    }
}

#[async_trait]
impl IngestTarget for Xgress {
    async fn ingest_payload(&self, payload: Payload) {
        let sequence = payload.sequence;
        let rtt = payload.rtt;

        let (accepted, size) = {
            let mut rx_buffer = self.rx_buffer.lock();
            let accepted = rx_buffer.receive_unordered(payload, self.env.options.max_rx_buffer_size);
            (accepted, rx_buffer.size())
        };

        if accepted {
            let mut ack = Acknowledgement::new(self.circuit_id(), self.originator);
            ack.sequences.push(sequence);
            ack.recv_buffer_size = size;
            ack.rtt = rtt;
            self.rx_stats.mark_size_sent(size);
            self.env.acker.ack(ack, self.address().clone()).await;
        }

        self.queue_sends().await;
    }

    async fn queue_sends(&self) {
        let (drained, size) = {
            let mut rx_buffer = self.rx_buffer.lock();
            let mut drained = 0usize;
            while let Some(sequence) = rx_buffer.peek_head().map(|p| p.sequence) {
                let Ok(permit) = self.tx_queue.try_reserve() else {
                    break;
                };
                if let Some(payload) = rx_buffer.remove(sequence) {
                    permit.send(payload);
                    drained += 1;
                }
            }
            (drained, rx_buffer.size())
        };

        if drained > 0 {
            let last_size_sent = self.rx_stats.last_size_sent();
            if (size == 0 && last_size_sent > 0) || size < last_size_sent / 2 {
                self.send_empty_ack(size).await;
            }
        }
    }

    fn inspect_receive_buffer(&self) -> RecvBufferDetail {
        self.rx_buffer.lock().inspect()
    }
}

#[async_trait]
impl Destination for Xgress {
    /// With a non-zero timeout, waiting for the payload ingester is limited to that timeout
    async fn send_payload(&self, payload: Payload, timeout: Duration, _payload_type: PayloadType) -> anyhow::Result<()> {
        if self.is_closed() {
            trace!(circuit_id = self.circuit_id(), "xgress is closed, dropping payload {}", payload.sequence);
            return Ok(());
        }
        self.time_of_last_rx_from_link.store(self.env.clock.now_millis(), Ordering::Release);

        let Some(this) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let ingest = self.env.payload_ingester.ingest(this, payload);
        if timeout.is_zero() {
            return ingest.await;
        }
        match time::timeout(timeout, ingest).await {
            Ok(result) => result,
            Err(_) => Err(SendTimeout.into()),
        }
    }

    async fn send_acknowledgement(&self, ack: Acknowledgement) -> anyhow::Result<()> {
        self.send_buffer.receive_acknowledgement(ack).await;
        Ok(())
    }

    async fn send_control(&self, control: Control) -> anyhow::Result<()> {
        if control.is_trace_route() {
            let response = control.create_trace_response("xgress", &self.env.router_id);
            return self.env.data_plane.forward_control(self.address(), response).await;
        }
        debug!(circuit_id = self.circuit_id(), "ignoring control {:?}", control.control_type);
        Ok(())
    }

    async fn inspect_circuit(&self, detail: &mut CircuitInspectDetail) {
        let timeout = self.env.inspect_timeout;
        let recv_buffer = match self.self_ref.upgrade() {
            Some(this) => match self.env.payload_ingester.inspect(this, timeout).await {
                Some(d) => Inspection::Safe(d),
                None => Inspection::BestEffort(self.rx_stats.best_effort_detail()),
            },
            None => Inspection::BestEffort(self.rx_stats.best_effort_detail()),
        };
        let send_buffer = self.send_buffer.inspect(timeout).await;

        detail.xgress_details.insert(self.address().to_string(), XgressDetail {
            address: self.address().to_string(),
            originator: self.originator.to_string(),
            label: self.peer.label(),
            time_since_last_link_rx_ms: self.env.clock.now_millis() - self.time_of_last_rx_from_link(),
            send_buffer,
            recv_buffer,
        });
    }
}

impl XgressDestination for Xgress {
    fn unrouted(&self) {
        if self.is_closed() {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let max_close_wait = self.env.options.max_close_wait;
        let mut close_notify = self.closer.notify();
        tokio::spawn(async move {
            select! {
                _ = time::sleep(max_close_wait) => {
                    debug!(circuit_id = this.circuit_id(), "xgress was unrouted and did not close within {:?}, closing", max_close_wait);
                    this.close();
                }
                _ = close_notify.closed() => {}
            }
        });
    }

    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let Some(tx_queue_rx) = self.tx_queue_rx.lock().take() else {
            return;
        };
        debug!(circuit_id = self.circuit_id(), address = %self.address(), originator = %self.originator, "starting xgress");
        tokio::spawn(this.clone().rx_loop());
        tokio::spawn(this.tx_loop(tx_queue_rx));
    }

    fn is_terminator(&self) -> bool {
        self.originator == Originator::Terminator
    }

    fn label(&self) -> String {
        self.peer.label()
    }

    fn time_of_last_rx_from_link(&self) -> i64 {
        self.time_of_last_rx_from_link.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwarderConfig;
    use crate::ctrl::controllers::NetworkControllers;
    use crate::ctrl::messages::{DestType, Forward, Route};
    use crate::forwarder::faulter::Faulter;
    use crate::forwarder::forwarder::Forwarder;
    use crate::forwarder::state::ForwarderState;
    use crate::test_util::{channel_connection, wait_until, ChannelConnection, ConnectionPeer, TrackingDestination};
    use crate::xgress::data_plane::MockDataPlane;
    use crate::xgress::message::ControlType;
    use anyhow::anyhow;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;

    fn env(data_plane: Arc<dyn DataPlane>, options: XgressOptions, closer: &Closer) -> Arc<XgressEnv> {
        let payload_ingester = Arc::new(PayloadIngester::new(options.ingest_queue_size, closer.notify()));
        env_with_ingester(data_plane, options, closer, payload_ingester)
    }

    fn env_with_ingester(data_plane: Arc<dyn DataPlane>, options: XgressOptions, closer: &Closer, payload_ingester: Arc<PayloadIngester>) -> Arc<XgressEnv> {
        let metrics = Arc::new(DataPlaneMetrics::default());
        let clock = MonotonicClock::new();
        Arc::new(XgressEnv {
            router_id: "router-a".to_string(),
            data_plane: data_plane.clone(),
            acker: Arc::new(Acker::new(data_plane.clone(), metrics.clone(), options.ack_queue_size, closer.notify())),
            retransmitter: Arc::new(Retransmitter::new(data_plane, metrics.clone(), clock, options.retransmit_queue_size, closer.notify())),
            payload_ingester,
            options,
            metrics,
            clock,
            inspect_timeout: Duration::from_millis(100),
            shutdown: closer.notify(),
        })
    }

    /// an endpoint "x" routed over a tracking link "l1"
    struct Fixture {
        _closer: Closer,
        link: Arc<TrackingDestination>,
        xgress: Arc<Xgress>,
        connection: Arc<ChannelConnection>,
        peer: ConnectionPeer,
    }

    async fn routed_fixture() -> Fixture {
        let closer = Closer::new();
        let state = Arc::new(ForwarderState::new(MonotonicClock::new()));
        let faulter = Arc::new(Faulter::new(Arc::new(NetworkControllers::new()), Duration::from_secs(15)));
        let forwarder = Arc::new(Forwarder::new(state, faulter, ForwarderConfig::default(), "router-a", closer.notify()));

        let link = TrackingDestination::new("l1");
        forwarder.register_link(link.clone());

        let (connection, peer) = channel_connection("client");
        let xgress = Xgress::new("c1", "ctrl", Address::new("x"), Originator::Initiator, connection.clone(), env(forwarder.clone(), XgressOptions::default(), &closer));
        forwarder.register_destination("c1", Address::new("x"), xgress.clone());
        forwarder.route("ctrl", &Route {
            circuit_id: "c1".to_string(),
            forwards: vec![
                Forward::new("x", "l1", DestType::Link),
                Forward::new("l1", "x", DestType::Ingress),
            ],
            egress: None,
        }).await.unwrap();

        Fixture { _closer: closer, link, xgress, connection, peer }
    }

    fn payload(sequence: i32, data: &'static [u8]) -> Payload {
        let mut payload = Payload::new("c1", Originator::Terminator, sequence, Bytes::from_static(data));
        payload.rtt = 17;
        payload
    }

    #[tokio::test]
    async fn test_out_of_order_payloads_are_delivered_in_order() {
        let mut f = routed_fixture().await;
        f.xgress.start();

        f.xgress.send_payload(payload(1, b"b"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        wait_until(|| f.link.acks().len() == 1).await;
        let first = f.link.acks().remove(0);
        assert_eq!(first.sequences, vec![1]);
        assert_eq!(first.recv_buffer_size, payload(1, b"b").size());
        assert_eq!(first.rtt, 17);
        assert!(f.peer.from_xgress.try_recv().is_err());

        f.xgress.send_payload(payload(0, b"a"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        assert_eq!(f.peer.from_xgress.recv().await.unwrap().as_ref(), b"a");
        assert_eq!(f.peer.from_xgress.recv().await.unwrap().as_ref(), b"b");

        wait_until(|| f.link.acks().len() >= 2).await;
        assert_eq!(f.link.acks()[1].sequences, vec![0]);

        // once drained, the window is reopened with an empty ack
        wait_until(|| f.link.acks().iter().any(|a| a.sequences.is_empty() && a.recv_buffer_size == 0)).await;
    }

    #[tokio::test]
    async fn test_duplicate_payload_is_acked_again_but_delivered_once() {
        let mut f = routed_fixture().await;
        f.xgress.start();

        f.xgress.send_payload(payload(0, b"a"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        assert_eq!(f.peer.from_xgress.recv().await.unwrap().as_ref(), b"a");
        f.xgress.send_payload(payload(0, b"a"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        f.xgress.send_payload(payload(1, b"b"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        assert_eq!(f.peer.from_xgress.recv().await.unwrap().as_ref(), b"b");

        let acked_sequences = |link: &TrackingDestination| link.acks().into_iter()
            .flat_map(|a| a.sequences)
            .collect::<Vec<_>>();
        wait_until(|| acked_sequences(&f.link).len() == 3).await;
        assert_eq!(acked_sequences(&f.link), vec![0, 0, 1]);
        assert_eq!(f.xgress.env.metrics.duplicate_payloads.get(), 1);
        assert!(f.peer.from_xgress.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rx_forwards_data_and_end_of_circuit() {
        let mut f = routed_fixture().await;
        f.xgress.start();

        f.peer.write(b"hi").await;
        f.peer.end_of_data();

        wait_until(|| f.link.payloads().len() == 2).await;
        let payloads = f.link.payloads();
        assert_eq!(payloads[0].0.sequence, 0);
        assert_eq!(payloads[0].0.data.as_ref(), b"hi");
        assert_eq!(payloads[0].1, PayloadType::Normal);
        assert_eq!(payloads[0].0.originator(), Originator::Initiator);
        assert!(!payloads[0].0.is_circuit_end());
        assert_eq!(payloads[1].0.sequence, 1);
        assert!(payloads[1].0.is_circuit_end());

        // the endpoint stays open for data coming the other way
        assert!(!f.xgress.is_closed());
    }

    #[tokio::test]
    async fn test_tx_closes_on_end_of_circuit() {
        let mut f = routed_fixture().await;
        f.xgress.start();

        let mut end = payload(0, b"bye");
        end.flags |= PAYLOAD_FLAG_CIRCUIT_END;
        f.xgress.send_payload(end, Duration::ZERO, PayloadType::Forwarded).await.unwrap();

        assert_eq!(f.peer.from_xgress.recv().await.unwrap().as_ref(), b"bye");
        wait_until(|| f.connection.is_closed()).await;
        assert!(f.xgress.is_closed());

        f.xgress.send_payload(payload(1, b"late"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        assert!(f.peer.from_xgress.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trace_route_is_answered_by_endpoint() {
        let f = routed_fixture().await;

        f.xgress.send_control(Control::new_trace_route("c1", 3, 42, 7)).await.unwrap();

        let controls = f.link.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].control_type, ControlType::TraceRouteResponse);
        assert_eq!(controls[0].hop_type().as_deref(), Some("xgress"));
        assert_eq!(controls[0].hop_id().as_deref(), Some("router-a"));
    }

    #[rstest]
    #[case::failure(false, 1)]
    #[case::timeout(true, 0)]
    #[tokio::test]
    async fn test_forward_failure_reports_fault(#[case] is_timeout: bool, #[case] expected_faults: usize) {
        let closer = Closer::new();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(AtomicUsize::new(0));

        let mut data_plane = MockDataPlane::new();
        let counter = forwarded.clone();
        data_plane.expect_forward_payload()
            .withf(|src, payload, timeout| src.as_str() == "x" && payload.sequence == 0 && timeout.is_zero())
            .returning(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                if is_timeout {
                    Err(SendTimeout.into())
                }
                else {
                    Err(anyhow!("no destination"))
                }
            });
        data_plane.expect_retransmit_payload()
            .returning(|_, _| Ok(()));
        let counter = faults.clone();
        data_plane.expect_report_forwarding_fault()
            .withf(|circuit_id, ctrl_id| circuit_id == "c1" && ctrl_id == "ctrl")
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let (connection, peer) = channel_connection("client");
        let xgress = Xgress::new("c1", "ctrl", Address::new("x"), Originator::Initiator, connection, env(Arc::new(data_plane), XgressOptions::default(), &closer));
        xgress.start();

        peer.write(b"data").await;
        wait_until(|| forwarded.load(Ordering::SeqCst) == 1).await;
        assert_eq!(faults.load(Ordering::SeqCst), expected_faults);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_closes_after_max_close_wait() {
        let closer = Closer::new();
        let options = XgressOptions {
            max_close_wait: Duration::from_secs(30),
            ..Default::default()
        };
        let (connection, _peer) = channel_connection("client");
        let xgress = Xgress::new("c1", "ctrl", Address::new("x"), Originator::Terminator, connection.clone(), env(Arc::new(MockDataPlane::new()), options, &closer));

        xgress.unrouted();
        time::sleep(Duration::from_secs(29)).await;
        assert!(!xgress.is_closed());

        time::sleep(Duration::from_secs(2)).await;
        assert!(xgress.is_closed());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_router_shutdown_closes_endpoint() {
        let closer = Closer::new();
        let (connection, _peer) = channel_connection("client");
        let xgress = Xgress::new("c1", "ctrl", Address::new("x"), Originator::Terminator, connection.clone(), env(Arc::new(MockDataPlane::new()), XgressOptions::default(), &closer));
        xgress.start();

        closer.close();
        wait_until(|| connection.is_closed()).await;
        assert!(xgress.is_closed());
    }

    #[tokio::test]
    async fn test_inspect_circuit() {
        let f = routed_fixture().await;
        f.xgress.send_payload(payload(2, b"later"), Duration::ZERO, PayloadType::Forwarded).await.unwrap();
        wait_until(|| f.link.acks().len() == 1).await;

        let mut detail = CircuitInspectDetail::new("c1");
        f.xgress.inspect_circuit(&mut detail).await;

        let x = &detail.xgress_details["x"];
        assert_eq!(x.label, "client");
        assert_eq!(x.originator, Originator::Initiator.to_string());
        assert!(x.send_buffer.is_safe());
        assert!(x.recv_buffer.is_safe());
        assert_eq!(x.recv_buffer.detail().buffered_payloads, 1);
        assert_eq!(x.recv_buffer.detail().next_payload_sequence, Some(2));
        assert_eq!(x.send_buffer.detail().buffered_payloads, 0);
    }

    /// never finishes ingesting, keeping the ingester's task busy
    struct StalledTarget;

    #[async_trait]
    impl IngestTarget for StalledTarget {
        async fn ingest_payload(&self, _payload: Payload) {
            std::future::pending::<()>().await
        }

        async fn queue_sends(&self) {}

        fn inspect_receive_buffer(&self) -> RecvBufferDetail {
            RecvBufferDetail::default()
        }
    }

    /// an ingester whose task is stuck and whose queue (of size 1) is full
    async fn stalled_ingester(closer: &Closer) -> Arc<PayloadIngester> {
        let ingester = Arc::new(PayloadIngester::new(1, closer.notify()));
        let target: Arc<dyn IngestTarget> = Arc::new(StalledTarget);
        ingester.ingest(target.clone(), payload(0, b"a")).await.unwrap();
        ingester.ingest(target, payload(1, b"b")).await.unwrap();
        ingester
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspect_falls_back_to_best_effort() {
        let closer = Closer::new();
        let ingester = stalled_ingester(&closer).await;
        let (connection, _peer) = channel_connection("client");
        let xgress = Xgress::new("c1", "ctrl", Address::new("x"), Originator::Initiator, connection,
            env_with_ingester(Arc::new(MockDataPlane::new()), XgressOptions::default(), &closer, ingester));
        assert!(xgress.rx_buffer.lock().receive_unordered(payload(3, b"gap"), u32::MAX));

        let mut detail = CircuitInspectDetail::new("c1");
        xgress.inspect_circuit(&mut detail).await;

        let recv_buffer = &detail.xgress_details["x"].recv_buffer;
        assert!(!recv_buffer.is_safe());
        assert_eq!(recv_buffer.detail(), &xgress.rx_stats.best_effort_detail());
        assert_eq!(recv_buffer.detail().buffered_payloads, 1);
        assert_eq!(recv_buffer.detail().max_sequence, 3);
        assert_eq!(recv_buffer.detail().size, payload(3, b"gap").size());
        assert!(detail.xgress_details["x"].send_buffer.is_safe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_payload_times_out_on_busy_ingester() {
        let closer = Closer::new();
        let ingester = stalled_ingester(&closer).await;
        let (connection, _peer) = channel_connection("client");
        let xgress = Xgress::new("c1", "ctrl", Address::new("x"), Originator::Initiator, connection,
            env_with_ingester(Arc::new(MockDataPlane::new()), XgressOptions::default(), &closer, ingester));

        let err = xgress.send_payload(payload(0, b"a"), Duration::from_millis(50), PayloadType::Forwarded).await.unwrap_err();
        assert!(is_send_timeout(&err));
    }
}
