use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::xgress::xgress::Connection;

/// A [Connection] backed by channels, with the other ends held by a [ConnectionPeer]
pub struct ChannelConnection {
    label: String,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

impl ChannelConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The application side of a [ChannelConnection]. Dropping `to_xgress` signals end of data.
pub struct ConnectionPeer {
    pub to_xgress: Option<mpsc::Sender<Bytes>>,
    pub from_xgress: mpsc::UnboundedReceiver<Bytes>,
}

impl ConnectionPeer {
    pub async fn write(&self, data: &'static [u8]) {
        if let Some(to_xgress) = &self.to_xgress {
            to_xgress.send(Bytes::from_static(data)).await
                .expect("connection is closed");
        }
    }

    pub fn end_of_data(&mut self) {
        self.to_xgress = None;
    }
}

pub fn channel_connection(label: &str) -> (Arc<ChannelConnection>, ConnectionPeer) {
    let (to_xgress, inbound) = mpsc::channel(16);
    let (outbound, from_xgress) = mpsc::unbounded_channel();
    let connection = Arc::new(ChannelConnection {
        label: label.to_string(),
        inbound: Mutex::new(inbound),
        outbound,
        closed: AtomicBool::new(false),
    });
    (connection, ConnectionPeer { to_xgress: Some(to_xgress), from_xgress })
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn read_payload(&self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn write_payload(&self, data: Bytes) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(anyhow!("connection {} is closed", self.label));
        }
        self.outbound.send(data)
            .map_err(|_| anyhow!("peer of {} is gone", self.label))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}
