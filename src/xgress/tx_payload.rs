use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use crate::xgress::message::{Address, Payload};

/// The endpoint a sent payload belongs to, as far as retransmission is concerned
#[derive(Debug)]
pub struct SendOrigin {
    pub address: Address,
    pub circuit_id: String,
    pub ctrl_id: String,
    closed: AtomicBool,
}
impl SendOrigin {
    pub fn new(address: Address, circuit_id: impl Into<String>, ctrl_id: impl Into<String>) -> SendOrigin {
        SendOrigin {
            address,
            circuit_id: circuit_id.into(),
            ctrl_id: ctrl_id.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// returns `true` for the call that actually closed it
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

const ACKED: i32 = -1;

/// A payload that was sent and is waiting for its acknowledgement
#[derive(Debug)]
pub struct TxPayload {
    pub payload: Payload,
    /// millis of the last (re)transmission, `i64::MAX` while not sent yet
    age: AtomicI64,
    /// 1 while in the retransmit queue, 0 if not, [ACKED] once acknowledged
    retx_queued: AtomicI32,
    origin: Arc<SendOrigin>,
}
impl TxPayload {
    pub fn new(payload: Payload, origin: Arc<SendOrigin>) -> TxPayload {
        TxPayload {
            payload,
            age: AtomicI64::new(i64::MAX),
            retx_queued: AtomicI32::new(0),
            origin,
        }
    }

    pub fn origin(&self) -> &Arc<SendOrigin> {
        &self.origin
    }

    pub fn sequence(&self) -> i32 {
        self.payload.sequence
    }

    pub fn age(&self) -> i64 {
        self.age.load(Ordering::Acquire)
    }

    pub fn mark_sent(&self, now_millis: i64) {
        self.age.store(now_millis, Ordering::Release);
    }

    /// `true` if the payload was neither queued nor acknowledged, and is queued now
    pub fn mark_queued(&self) -> bool {
        self.retx_queued.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn dequeued(&self) {
        let _ = self.retx_queued.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// `false` if it was acknowledged before
    pub fn mark_acked(&self) -> bool {
        self.retx_queued.swap(ACKED, Ordering::AcqRel) != ACKED
    }

    pub fn is_acked(&self) -> bool {
        self.retx_queued.load(Ordering::Acquire) == ACKED
    }

    pub fn is_retransmittable(&self) -> bool {
        self.retx_queued.load(Ordering::Acquire) == 0
    }
}
