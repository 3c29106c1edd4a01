use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::util::unblocking_queue::Backlog;
use crate::xgress::message::Address;
use crate::xgress::tx_payload::TxPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(usize);

struct Node {
    entry: Arc<TxPayload>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO of payloads waiting for retransmission: a doubly linked list in an arena of slots, so
///  that removal from any position is O(1) given the node's handle. A payload (identified by its
///  endpoint address and sequence) is contained at most once.
#[derive(Default)]
pub struct RetransmitQueue {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: FxHashMap<(Address, i32), usize>,
}

impl RetransmitQueue {
    pub fn new() -> RetransmitQueue {
        Default::default()
    }

    fn key(entry: &TxPayload) -> (Address, i32) {
        (entry.origin().address.clone(), entry.sequence())
    }

    /// `None` if the payload is already queued
    pub fn push_back(&mut self, entry: Arc<TxPayload>) -> Option<NodeHandle> {
        let key = Self::key(&entry);
        if self.index.contains_key(&key) {
            return None;
        }

        let node = Node {
            entry,
            prev: self.tail,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.tail.and_then(|t| self.slots[t].as_mut()) {
            Some(tail) => tail.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.index.insert(key, idx);
        Some(NodeHandle(idx))
    }

    pub fn pop_front(&mut self) -> Option<Arc<TxPayload>> {
        let head = self.head?;
        self.remove(NodeHandle(head))
    }

    pub fn remove(&mut self, handle: NodeHandle) -> Option<Arc<TxPayload>> {
        let node = self.slots.get_mut(handle.0)?.take()?;

        match node.prev.and_then(|p| self.slots[p].as_mut()) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|n| self.slots[n].as_mut()) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }

        self.free.push(handle.0);
        self.index.remove(&Self::key(&node.entry));
        Some(node.entry)
    }

    pub fn contains(&self, entry: &TxPayload) -> bool {
        self.index.contains_key(&Self::key(entry))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Backlog<Arc<TxPayload>> for RetransmitQueue {
    fn push(&mut self, item: Arc<TxPayload>) {
        if self.push_back(item.clone()).is_none() {
            trace!(circuit_id = %item.payload.circuit_id, sequence = item.sequence(), "payload is already queued for retransmission");
        }
    }

    /// skips payloads that were acknowledged while waiting
    fn pop(&mut self) -> Option<Arc<TxPayload>> {
        while let Some(entry) = self.pop_front() {
            if !entry.is_acked() {
                return Some(entry);
            }
            trace!(circuit_id = %entry.payload.circuit_id, sequence = entry.sequence(), "payload was acknowledged while queued");
        }
        None
    }

    fn len(&self) -> usize {
        RetransmitQueue::len(self)
    }
}
