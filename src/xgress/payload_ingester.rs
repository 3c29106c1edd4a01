use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, trace};

use crate::inspect::RecvBufferDetail;
use crate::util::close_notify::CloseNotify;
use crate::xgress::message::Payload;

/// The part of an endpoint whose state is owned by the payload ingester's task. Its methods are
///  never called concurrently with each other (for all targets sharing an ingester).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngestTarget: Send + Sync + 'static {
    async fn ingest_payload(&self, payload: Payload);
    /// move deliverable payloads toward the local peer
    async fn queue_sends(&self);
    fn inspect_receive_buffer(&self) -> RecvBufferDetail;
}

struct InspectRequest {
    target: Arc<dyn IngestTarget>,
    reply: oneshot::Sender<RecvBufferDetail>,
}

/// Single task that serializes all receive side work of the endpoints sharing it
pub struct PayloadIngester {
    payload_ingest: mpsc::Sender<(Arc<dyn IngestTarget>, Payload)>,
    send_requests: mpsc::Sender<Arc<dyn IngestTarget>>,
    inspect_requests: mpsc::Sender<InspectRequest>,
}

impl PayloadIngester {
    pub fn new(queue_size: usize, close_notify: CloseNotify) -> PayloadIngester {
        let (payload_ingest, payload_rx) = mpsc::channel(queue_size);
        let (send_requests, send_rx) = mpsc::channel(queue_size);
        let (inspect_requests, inspect_rx) = mpsc::channel(4);

        tokio::spawn(run(payload_rx, send_rx, inspect_rx, close_notify));

        PayloadIngester {
            payload_ingest,
            send_requests,
            inspect_requests,
        }
    }

    pub async fn ingest(&self, target: Arc<dyn IngestTarget>, payload: Payload) -> anyhow::Result<()> {
        self.payload_ingest.send((target, payload)).await
            .map_err(|_| anyhow!("payload ingester is shut down"))
    }

    pub async fn request_send(&self, target: Arc<dyn IngestTarget>) {
        if self.send_requests.send(target).await.is_err() {
            trace!("payload ingester is shut down, ignoring send request");
        }
    }

    /// `None` if the ingester did not answer within the timeout
    pub async fn inspect(&self, target: Arc<dyn IngestTarget>, timeout: Duration) -> Option<RecvBufferDetail> {
        let (reply, reply_rx) = oneshot::channel();
        let request = async {
            self.inspect_requests.send(InspectRequest { target, reply }).await.ok()?;
            reply_rx.await.ok()
        };
        time::timeout(timeout, request).await.ok().flatten()
    }
}

async fn run(
    mut payloads: mpsc::Receiver<(Arc<dyn IngestTarget>, Payload)>,
    mut send_requests: mpsc::Receiver<Arc<dyn IngestTarget>>,
    mut inspect_requests: mpsc::Receiver<InspectRequest>,
    mut close_notify: CloseNotify,
) {
    loop {
        select! {
            Some((target, payload)) = payloads.recv() => target.ingest_payload(payload).await,
            Some(target) = send_requests.recv() => target.queue_sends().await,
            Some(request) = inspect_requests.recv() => {
                let _ = request.reply.send(request.target.inspect_receive_buffer());
            }
            _ = close_notify.closed() => {
                debug!("payload ingester shut down");
                return;
            }
        }
    }
}
