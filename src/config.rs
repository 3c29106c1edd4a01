use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// polling interval of deferred unroute watchers. A circuit is removed once its local
    ///  endpoint has not received anything from a link for longer than this.
    pub xgress_close_check_interval: Duration,
    /// circuits without traffic for longer than this are candidates for idle reaping
    pub idle_circuit_timeout: Duration,
    /// zero disables the idle circuit scanner
    pub idle_scan_interval: Duration,
    /// batching interval for forward faults. Zero disables forward fault reporting, link faults
    ///  are sent regardless.
    pub fault_tx_interval: Duration,
    /// timeout for passing a payload that arrived on a link on to its next hop
    pub payload_forward_timeout: Duration,
    /// how long an inspection waits for the owning task before falling back to a best effort
    ///  snapshot
    pub inspect_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            xgress_close_check_interval: Duration::from_secs(5),
            idle_circuit_timeout: Duration::from_secs(60),
            idle_scan_interval: Duration::from_secs(60),
            fault_tx_interval: Duration::from_secs(15),
            payload_forward_timeout: Duration::from_secs(1),
            inspect_timeout: Duration::from_millis(100),
        }
    }
}

impl ForwarderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.xgress_close_check_interval.is_zero() {
            bail!("xgress close check interval must be positive");
        }
        if self.idle_circuit_timeout.is_zero() {
            bail!("idle circuit timeout must be positive");
        }
        if self.inspect_timeout.is_zero() {
            bail!("inspect timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct XgressOptions {
    /// soft limit for the reorder buffer, in bytes
    pub max_rx_buffer_size: u32,
    /// send window, in bytes: no new payloads are sent while this many bytes are unacknowledged,
    ///  or while the peer reports a receive buffer of this size
    pub tx_portal_size: u32,

    pub retx_start_ms: u32,
    /// retransmission threshold is `rtt * retx_scale + retx_add_ms`
    pub retx_scale: f64,
    pub retx_add_ms: u32,
    pub retx_check_interval: Duration,

    /// how long an unrouted endpoint waits for a regular close before closing itself
    pub max_close_wait: Duration,

    /// payloads that are in order but not yet written to the local peer
    pub tx_queue_size: usize,
    pub ingest_queue_size: usize,
    pub ack_queue_size: usize,
    pub retransmit_queue_size: usize,
}

impl Default for XgressOptions {
    fn default() -> Self {
        XgressOptions {
            max_rx_buffer_size: 4 * 1024 * 1024,
            tx_portal_size: 4 * 1024 * 1024,
            retx_start_ms: 200,
            retx_scale: 1.5,
            retx_add_ms: 0,
            retx_check_interval: Duration::from_millis(100),
            max_close_wait: Duration::from_secs(30),
            tx_queue_size: 1,
            ingest_queue_size: 16,
            ack_queue_size: 16,
            retransmit_queue_size: 16,
        }
    }
}

impl XgressOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tx_portal_size == 0 {
            bail!("tx portal size must be positive");
        }
        if self.retx_scale.is_nan() || self.retx_scale < 1.0 {
            bail!("retx scale must be at least 1.0, is {}", self.retx_scale);
        }
        if self.retx_check_interval.is_zero() {
            bail!("retx check interval must be positive");
        }
        if self.tx_queue_size == 0 || self.ingest_queue_size == 0 || self.ack_queue_size == 0 || self.retransmit_queue_size == 0 {
            bail!("queue sizes must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub forwarder: ForwarderConfig,
    pub xgress: XgressOptions,
}

impl RouterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.forwarder.validate()?;
        self.xgress.validate()
    }
}
