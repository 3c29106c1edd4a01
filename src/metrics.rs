use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Data plane counters and gauges. One instance is shared by all endpoints, links and delivery
///  pipelines of a router; clones share the underlying values.
#[derive(Clone, Debug)]
pub struct DataPlaneMetrics {
    pub duplicate_payloads: Counter,
    pub dropped_payloads: Counter,
    pub duplicate_acks: Counter,
    pub acks_sent: Counter,
    pub ack_failures: Counter,
    pub ack_queue_size: Gauge,
    pub retransmissions: Counter,
    pub retransmission_failures: Counter,
    pub retransmitter_queue_size: Gauge,
    pub link_dropped_xg_payloads: Counter,
    pub link_dropped_fwd_payloads: Counter,
    pub link_dropped_rtx_payloads: Counter,
    /// milliseconds
    pub payload_rtt: Histogram,
}

impl Default for DataPlaneMetrics {
    fn default() -> Self {
        DataPlaneMetrics {
            duplicate_payloads: Counter::default(),
            dropped_payloads: Counter::default(),
            duplicate_acks: Counter::default(),
            acks_sent: Counter::default(),
            ack_failures: Counter::default(),
            ack_queue_size: Gauge::default(),
            retransmissions: Counter::default(),
            retransmission_failures: Counter::default(),
            retransmitter_queue_size: Gauge::default(),
            link_dropped_xg_payloads: Counter::default(),
            link_dropped_fwd_payloads: Counter::default(),
            link_dropped_rtx_payloads: Counter::default(),
            payload_rtt: Histogram::new(exponential_buckets(1.0, 2.0, 14)),
        }
    }
}

impl DataPlaneMetrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("xgress_duplicate_payloads", "Payloads received more than once", metrics.duplicate_payloads.clone());
        registry.register("xgress_dropped_payloads", "Payloads dropped because the receive buffer was full", metrics.dropped_payloads.clone());
        registry.register("xgress_duplicate_acks", "Acknowledgements for payloads that were no longer buffered", metrics.duplicate_acks.clone());
        registry.register("xgress_acks_sent", "Acknowledgements handed to the data plane", metrics.acks_sent.clone());
        registry.register("xgress_ack_failures", "Acknowledgements that could not be forwarded", metrics.ack_failures.clone());
        registry.register("xgress_ack_queue_size", "Acknowledgements waiting to be sent", metrics.ack_queue_size.clone());
        registry.register("xgress_retransmissions", "Payloads retransmitted", metrics.retransmissions.clone());
        registry.register("xgress_retransmission_failures", "Retransmissions that could not be forwarded", metrics.retransmission_failures.clone());
        registry.register("xgress_retransmitter_queue_size", "Payloads waiting for retransmission", metrics.retransmitter_queue_size.clone());
        registry.register("link_dropped_xg_payloads", "Payloads from local endpoints dropped by a full link queue", metrics.link_dropped_xg_payloads.clone());
        registry.register("link_dropped_fwd_payloads", "Forwarded payloads dropped by a full link queue", metrics.link_dropped_fwd_payloads.clone());
        registry.register("link_dropped_rtx_payloads", "Retransmitted payloads dropped by a full link queue", metrics.link_dropped_rtx_payloads.clone());
        registry.register("xgress_payload_rtt_ms", "Round trip time between sending a payload and receiving its acknowledgement", metrics.payload_rtt.clone());
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registered_metrics_share_state() {
        let mut registry = Registry::default();
        let metrics = DataPlaneMetrics::init(&mut registry);

        metrics.dropped_payloads.inc();
        metrics.clone().dropped_payloads.inc();
        metrics.retransmitter_queue_size.set(7);

        let mut encoded = String::new();
        encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("xgress_dropped_payloads_total 2"));
        assert!(encoded.contains("xgress_retransmitter_queue_size 7"));
    }
}
