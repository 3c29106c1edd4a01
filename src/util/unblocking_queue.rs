use std::collections::VecDeque;

use anyhow::anyhow;
use async_trait::async_trait;
use prometheus_client::metrics::gauge::Gauge;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::util::close_notify::CloseNotify;

/// Storage for items that were accepted but not yet handed to the sink. It is owned exclusively
///  by the ingesting task, so it needs no synchronization.
pub trait Backlog<T>: Send + 'static {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Backlog<T> for VecDeque<T> {
    fn push(&mut self, item: T) {
        self.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.pop_front()
    }

    fn len(&self) -> usize {
        VecDeque::len(self)
    }
}

#[async_trait]
pub trait QueueSink<T>: Send + Sync + 'static {
    async fn deliver(&self, item: T);
}

/// A queue whose producers never wait for the (potentially slow) consumer: an ingesting task
///  accepts items into an unbounded backlog as fast as they arrive, and hands them one at a time
///  through a single-slot channel to a sending task that calls the sink.
///
/// NB: producers can still wait briefly on the bounded ingest channel, but only while the
///  ingesting task is busy moving items, never on the sink
pub struct UnblockingQueue<T> {
    name: &'static str,
    ingest: mpsc::Sender<T>,
}

impl<T: Send + 'static> UnblockingQueue<T> {
    pub fn spawn(
        name: &'static str,
        backlog: impl Backlog<T>,
        sink: impl QueueSink<T>,
        depth: Gauge,
        ingest_capacity: usize,
        close_notify: CloseNotify,
    ) -> UnblockingQueue<T> {
        let (ingest, ingest_rx) = mpsc::channel(ingest_capacity);
        let (handoff, handoff_rx) = mpsc::channel(1);

        tokio::spawn(run_ingester(name, backlog, ingest_rx, handoff, depth, close_notify.clone()));
        tokio::spawn(run_sender(name, handoff_rx, sink, close_notify));

        UnblockingQueue { name, ingest }
    }

    pub async fn push(&self, item: T) -> anyhow::Result<()> {
        self.ingest.send(item).await
            .map_err(|_| anyhow!("{} queue is shut down", self.name))
    }
}

async fn run_ingester<T: Send + 'static>(
    name: &'static str,
    mut backlog: impl Backlog<T>,
    mut ingest: mpsc::Receiver<T>,
    handoff: mpsc::Sender<T>,
    depth: Gauge,
    mut close_notify: CloseNotify,
) {
    let mut next = None;
    loop {
        if next.is_none() {
            next = backlog.pop();
        }
        depth.set(backlog.len() as i64);

        select! {
            item = ingest.recv() => match item {
                Some(item) => backlog.push(item),
                None => {
                    debug!("{} queue: all producers are gone, shutting down", name);
                    return;
                }
            },
            permit = handoff.reserve(), if next.is_some() => match permit {
                Ok(permit) => {
                    if let Some(item) = next.take() {
                        permit.send(item);
                    }
                }
                Err(_) => {
                    debug!("{} queue: sender stopped, shutting down", name);
                    return;
                }
            },
            _ = close_notify.closed() => {
                trace!("{} queue: closed with {} items in backlog", name, backlog.len());
                return;
            }
        }
    }
}

async fn run_sender<T: Send + 'static>(
    name: &'static str,
    mut handoff: mpsc::Receiver<T>,
    sink: impl QueueSink<T>,
    mut close_notify: CloseNotify,
) {
    loop {
        select! {
            item = handoff.recv() => match item {
                Some(item) => sink.deliver(item).await,
                None => return,
            },
            _ = close_notify.closed() => {
                trace!("{} queue: sender closed", name);
                return;
            }
        }
    }
}
