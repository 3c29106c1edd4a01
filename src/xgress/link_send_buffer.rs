use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::config::XgressOptions;
use crate::inspect::{Inspection, SendBufferDetail};
use crate::metrics::DataPlaneMetrics;
use crate::util::clock::MonotonicClock;
use crate::util::close_notify::CloseNotify;
use crate::xgress::message::{Acknowledgement, Payload};
use crate::xgress::retransmitter::Retransmitter;
use crate::xgress::tx_payload::{SendOrigin, TxPayload};

/// pending acks are processed before new payloads are admitted, up to this many at a time
const MAX_BIASED_ACKS: usize = 10;
const MIN_RETX_CHECK_GAP_MS: i64 = 64;
const ACK_QUEUE_SIZE: usize = 16;

#[derive(Default)]
struct SendBufferStats {
    window_size: u32,
    link_send_buffer_size: AtomicU32,
    link_recv_buffer_size: AtomicU32,
    buffered_payloads: AtomicUsize,
    retx_threshold: AtomicU32,
    closed: AtomicBool,
}
impl SendBufferStats {
    fn best_effort_detail(&self) -> SendBufferDetail {
        SendBufferDetail {
            window_size: self.window_size,
            link_send_buffer_size: self.link_send_buffer_size.load(Ordering::Acquire),
            link_recv_buffer_size: self.link_recv_buffer_size.load(Ordering::Acquire),
            buffered_payloads: self.buffered_payloads.load(Ordering::Acquire),
            retx_threshold: self.retx_threshold.load(Ordering::Acquire),
            closed: self.closed.load(Ordering::Acquire),
            ..Default::default()
        }
    }
}

/// Send side of an endpoint: keeps sent payloads until they are acknowledged, hands overdue
///  payloads to the [Retransmitter], and holds back new payloads while the window is exhausted.
///
/// All state is owned by a dedicated task; this is the handle for talking to it.
pub struct LinkSendBuffer {
    newly_buffered: mpsc::Sender<(Arc<TxPayload>, oneshot::Sender<()>)>,
    acks: mpsc::Sender<Acknowledgement>,
    inspects: mpsc::Sender<oneshot::Sender<SendBufferDetail>>,
    stats: Arc<SendBufferStats>,
    origin: Arc<SendOrigin>,
}

impl LinkSendBuffer {
    pub fn new(
        origin: Arc<SendOrigin>,
        options: &XgressOptions,
        retransmitter: Arc<Retransmitter>,
        metrics: Arc<DataPlaneMetrics>,
        clock: MonotonicClock,
        close_notify: CloseNotify,
    ) -> LinkSendBuffer {
        let (newly_buffered, newly_buffered_rx) = mpsc::channel(1);
        let (acks, acks_rx) = mpsc::channel(ACK_QUEUE_SIZE);
        let (inspects, inspects_rx) = mpsc::channel(1);

        let stats = Arc::new(SendBufferStats {
            window_size: options.tx_portal_size,
            retx_threshold: AtomicU32::new(options.retx_start_ms),
            ..Default::default()
        });

        let buffer_loop = SendBufferLoop {
            origin: origin.clone(),
            buffer: FxHashMap::default(),
            window_size: options.tx_portal_size,
            link_send_buffer_size: 0,
            link_recv_buffer_size: 0,
            received_ack_hwm: -1,
            retx_threshold: options.retx_start_ms,
            retx_scale: options.retx_scale,
            retx_add_ms: options.retx_add_ms,
            last_rtt: 0,
            last_retx_check: 0,
            duplicate_acks: 0,
            retransmits: 0,
            blocked_by_local_window: false,
            blocked_by_remote_window: false,
            retransmitter,
            metrics,
            clock,
            stats: stats.clone(),
        };
        tokio::spawn(buffer_loop.run(newly_buffered_rx, acks_rx, inspects_rx, options.retx_check_interval, close_notify));

        LinkSendBuffer {
            newly_buffered,
            acks,
            inspects,
            stats,
            origin,
        }
    }

    /// Returns once the payload was accepted into the window. This is where an endpoint's reads
    ///  from its local peer get throttled.
    pub async fn buffer_payload(&self, payload: Payload) -> anyhow::Result<Arc<TxPayload>> {
        let tx = Arc::new(TxPayload::new(payload, self.origin.clone()));
        let (accepted, accepted_rx) = oneshot::channel();
        self.newly_buffered.send((tx.clone(), accepted)).await
            .map_err(|_| anyhow!("send buffer of {} is closed", self.origin.address))?;
        accepted_rx.await
            .map_err(|_| anyhow!("send buffer of {} is closed", self.origin.address))?;
        Ok(tx)
    }

    pub async fn receive_acknowledgement(&self, ack: Acknowledgement) {
        if self.acks.send(ack).await.is_err() {
            trace!(address = %self.origin.address, "send buffer is closed, ignoring acknowledgement");
        }
    }

    pub async fn inspect(&self, timeout: Duration) -> Inspection<SendBufferDetail> {
        let (reply, reply_rx) = oneshot::channel();
        let request = async {
            self.inspects.send(reply).await.ok()?;
            reply_rx.await.ok()
        };
        match time::timeout(timeout, request).await {
            Ok(Some(detail)) => Inspection::Safe(detail),
            _ => Inspection::BestEffort(self.stats.best_effort_detail()),
        }
    }
}

struct SendBufferLoop {
    origin: Arc<SendOrigin>,
    buffer: FxHashMap<i32, Arc<TxPayload>>,
    window_size: u32,
    link_send_buffer_size: u32,
    link_recv_buffer_size: u32,
    received_ack_hwm: i32,
    retx_threshold: u32,
    retx_scale: f64,
    retx_add_ms: u32,
    last_rtt: u16,
    last_retx_check: i64,
    duplicate_acks: u64,
    retransmits: u64,
    blocked_by_local_window: bool,
    blocked_by_remote_window: bool,
    retransmitter: Arc<Retransmitter>,
    metrics: Arc<DataPlaneMetrics>,
    clock: MonotonicClock,
    stats: Arc<SendBufferStats>,
}

impl SendBufferLoop {
    async fn run(
        mut self,
        mut newly_buffered: mpsc::Receiver<(Arc<TxPayload>, oneshot::Sender<()>)>,
        mut acks: mpsc::Receiver<Acknowledgement>,
        mut inspects: mpsc::Receiver<oneshot::Sender<SendBufferDetail>>,
        retx_check_interval: Duration,
        mut close_notify: CloseNotify,
    ) {
        let mut retx_ticks = time::interval(retx_check_interval);
        retx_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for _ in 0..MAX_BIASED_ACKS {
                match acks.try_recv() {
                    Ok(ack) => self.receive_acknowledgement(ack),
                    Err(_) => break,
                }
            }

            let blocked = self.is_blocked();
            select! {
                Some(ack) = acks.recv() => self.receive_acknowledgement(ack),
                Some((tx, accepted)) = newly_buffered.recv(), if !blocked => {
                    self.accept(tx);
                    let _ = accepted.send(());
                }
                Some(reply) = inspects.recv() => {
                    let _ = reply.send(self.inspect());
                }
                _ = retx_ticks.tick() => self.retransmit().await,
                _ = close_notify.closed() => {
                    self.close();
                    return;
                }
            }
        }
    }

    fn is_blocked(&mut self) -> bool {
        let by_local = self.window_size < self.link_send_buffer_size;
        let by_remote = self.window_size < self.link_recv_buffer_size;

        if by_local && !self.blocked_by_local_window {
            debug!(address = %self.origin.address, "blocked by local window: {} unacknowledged bytes", self.link_send_buffer_size);
        }
        if by_remote && !self.blocked_by_remote_window {
            debug!(address = %self.origin.address, "blocked by remote window: peer buffers {} bytes", self.link_recv_buffer_size);
        }
        self.blocked_by_local_window = by_local;
        self.blocked_by_remote_window = by_remote;
        by_local || by_remote
    }

    fn accept(&mut self, tx: Arc<TxPayload>) {
        self.link_send_buffer_size = self.link_send_buffer_size.saturating_add(tx.payload.size());
        self.buffer.insert(tx.sequence(), tx);
        self.update_stats();
    }

    fn receive_acknowledgement(&mut self, ack: Acknowledgement) {
        trace!(address = %self.origin.address, sequences = ?ack.sequences, "received acknowledgement");

        for sequence in &ack.sequences {
            match self.buffer.remove(sequence) {
                Some(tx) => {
                    tx.mark_acked();
                    self.link_send_buffer_size = self.link_send_buffer_size.saturating_sub(tx.payload.size());
                    if *sequence > self.received_ack_hwm {
                        self.received_ack_hwm = *sequence;
                    }
                }
                None => {
                    self.duplicate_acks += 1;
                    self.metrics.duplicate_acks.inc();
                }
            }
        }

        self.link_recv_buffer_size = ack.recv_buffer_size;

        if ack.rtt > 0 {
            let rtt = (self.clock.now_millis() as u16).wrapping_sub(ack.rtt);
            self.last_rtt = rtt;
            self.metrics.payload_rtt.observe(rtt as f64);
            self.retx_threshold = (rtt as f64 * self.retx_scale) as u32 + self.retx_add_ms;
        }
        self.update_stats();
    }

    async fn retransmit(&mut self) {
        let now = self.clock.now_millis();
        if now.saturating_sub(self.last_retx_check) < MIN_RETX_CHECK_GAP_MS {
            return;
        }
        self.last_retx_check = now;

        let threshold = self.retx_threshold as i64;
        let mut due = self.buffer.values()
            .filter(|tx| tx.is_retransmittable() && now.saturating_sub(tx.age()) >= threshold)
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|tx| tx.sequence());

        for tx in due {
            if tx.mark_queued() {
                trace!(address = %self.origin.address, sequence = tx.sequence(), "queueing payload for retransmission");
                self.retransmits += 1;
                self.retransmitter.queue(tx).await;
            }
        }
    }

    fn close(&mut self) {
        debug!(address = %self.origin.address, "closing send buffer with {} unacknowledged payloads", self.buffer.len());
        self.buffer.clear();
        self.link_send_buffer_size = 0;
        self.update_stats();
        self.stats.closed.store(true, Ordering::Release);
    }

    fn update_stats(&self) {
        self.stats.link_send_buffer_size.store(self.link_send_buffer_size, Ordering::Release);
        self.stats.link_recv_buffer_size.store(self.link_recv_buffer_size, Ordering::Release);
        self.stats.buffered_payloads.store(self.buffer.len(), Ordering::Release);
        self.stats.retx_threshold.store(self.retx_threshold, Ordering::Release);
    }

    fn inspect(&self) -> SendBufferDetail {
        SendBufferDetail {
            window_size: self.window_size,
            link_send_buffer_size: self.link_send_buffer_size,
            link_recv_buffer_size: self.link_recv_buffer_size,
            buffered_payloads: self.buffer.len(),
            received_ack_hwm: self.received_ack_hwm,
            retx_threshold: self.retx_threshold,
            last_rtt: self.last_rtt,
            duplicate_acks: self.duplicate_acks,
            retransmits: self.retransmits,
            blocked_by_local_window: self.blocked_by_local_window,
            blocked_by_remote_window: self.blocked_by_remote_window,
            closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::wait_until;
    use crate::util::close_notify::Closer;
    use crate::xgress::data_plane::MockDataPlane;
    use crate::xgress::message::{Address, Originator};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        closer: Closer,
        clock: MonotonicClock,
        metrics: Arc<DataPlaneMetrics>,
        send_buffer: LinkSendBuffer,
        retransmitted: Arc<AtomicUsize>,
    }

    fn fixture(tx_portal_size: u32) -> Fixture {
        let closer = Closer::new();
        let clock = MonotonicClock::new();
        let metrics = Arc::new(DataPlaneMetrics::default());
        let retransmitted = Arc::new(AtomicUsize::new(0));

        let mut data_plane = MockDataPlane::new();
        let counter = retransmitted.clone();
        data_plane.expect_retransmit_payload()
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let retransmitter = Arc::new(Retransmitter::new(Arc::new(data_plane), metrics.clone(), clock, 4, closer.notify()));

        let options = XgressOptions {
            tx_portal_size,
            ..Default::default()
        };
        let origin = Arc::new(SendOrigin::new(Address::new("x"), "c", "ctrl"));
        let send_buffer = LinkSendBuffer::new(origin, &options, retransmitter, metrics.clone(), clock, closer.notify());

        Fixture { closer, clock, metrics, send_buffer, retransmitted }
    }

    fn payload(sequence: i32, len: usize) -> Payload {
        Payload::new("c", Originator::Initiator, sequence, Bytes::from(vec![1u8; len]))
    }

    fn ack(sequences: Vec<i32>, recv_buffer_size: u32) -> Acknowledgement {
        let mut ack = Acknowledgement::new("c", Originator::Terminator);
        ack.sequences = sequences;
        ack.recv_buffer_size = recv_buffer_size;
        ack
    }

    async fn safe_detail(send_buffer: &LinkSendBuffer) -> SendBufferDetail {
        match send_buffer.inspect(Duration::from_secs(1)).await {
            Inspection::Safe(d) => d,
            Inspection::BestEffort(_) => panic!("expected safe inspection"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_window_blocks_until_ack() {
        let f = Arc::new(fixture(10));

        f.send_buffer.buffer_payload(payload(0, 8)).await.unwrap();
        f.send_buffer.buffer_payload(payload(1, 8)).await.unwrap();

        let f2 = f.clone();
        let third = tokio::spawn(async move { f2.send_buffer.buffer_payload(payload(2, 8)).await });
        time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        let detail = safe_detail(&f.send_buffer).await;
        assert!(detail.blocked_by_local_window);
        assert_eq!(detail.link_send_buffer_size, 16);
        assert_eq!(detail.buffered_payloads, 2);

        f.send_buffer.receive_acknowledgement(ack(vec![0], 0)).await;
        let tx = time::timeout(Duration::from_secs(1), third).await.unwrap().unwrap().unwrap();
        assert_eq!(tx.sequence(), 2);

        let detail = safe_detail(&f.send_buffer).await;
        assert_eq!(detail.received_ack_hwm, 0);
        assert_eq!(detail.link_send_buffer_size, 16);
        assert_eq!(detail.buffered_payloads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_window_and_duplicate_acks() {
        let f = fixture(10);
        let tx = f.send_buffer.buffer_payload(payload(0, 4)).await.unwrap();

        f.send_buffer.receive_acknowledgement(ack(vec![0], 11)).await;
        f.send_buffer.receive_acknowledgement(ack(vec![0], 11)).await;

        let detail = safe_detail(&f.send_buffer).await;
        assert!(tx.is_acked());
        assert!(detail.blocked_by_remote_window);
        assert!(!detail.blocked_by_local_window);
        assert_eq!(detail.duplicate_acks, 1);
        assert_eq!(f.metrics.duplicate_acks.get(), 1);

        f.send_buffer.receive_acknowledgement(ack(vec![], 0)).await;
        let detail = safe_detail(&f.send_buffer).await;
        assert!(!detail.blocked_by_remote_window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmits_until_acked() {
        let f = fixture(1000);
        let tx = f.send_buffer.buffer_payload(payload(0, 4)).await.unwrap();
        tx.mark_sent(f.clock.now_millis());

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.retransmitted.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(200)).await;
        wait_until(|| f.retransmitted.load(Ordering::SeqCst) >= 1).await;

        f.send_buffer.receive_acknowledgement(ack(vec![0], 0)).await;
        wait_until(|| tx.is_acked()).await;
        let count = f.retransmitted.load(Ordering::SeqCst);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.retransmitted.load(Ordering::SeqCst), count);
        assert_eq!(f.metrics.retransmissions.get(), count as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_buffer() {
        let f = fixture(1000);
        f.send_buffer.buffer_payload(payload(0, 4)).await.unwrap();
        f.closer.close();

        wait_until(|| f.send_buffer.newly_buffered.is_closed()).await;
        assert!(f.send_buffer.buffer_payload(payload(1, 4)).await.is_err());

        let inspection = f.send_buffer.inspect(Duration::from_millis(100)).await;
        assert!(!inspection.is_safe());
        assert!(inspection.detail().closed);
        assert_eq!(inspection.detail().buffered_payloads, 0);
    }
}
