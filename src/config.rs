use std::time::Duration;

use anyhow::bail;

use crate::link::datagram::DatagramData;

pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Parameters for the retransmission timeout estimation as described in RFC 6298.
#[derive(Debug, Clone)]
pub struct RtoConfig {
    /// weight of a new RTT sample in the smoothed RTT, between 0.0 and 1.0
    pub alpha: f64,
    /// weight of a new RTT sample's deviation in the RTT variance, between 0.0 and 1.0
    pub beta: f64,
    pub k: u32,
    /// clock granularity, used as a lower bound for the variance term
    pub granularity: Duration,
    /// RTO before the first RTT sample is available. This is also the upper bound for
    ///  retransmitting 'recent' messages.
    pub initial_rto: Duration,
    pub max_rto: Duration,
    pub backoff_factor: u32,
}

impl Default for RtoConfig {
    fn default() -> Self {
        RtoConfig {
            alpha: 0.125,
            beta: 0.25,
            k: 4,
            granularity: Duration::from_millis(1),
            initial_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(60),
            backoff_factor: 2,
        }
    }
}

impl RtoConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            bail!("alpha must be between 0.0 and 1.0, was {}", self.alpha);
        }
        if !(0.0..=1.0).contains(&self.beta) {
            bail!("beta must be between 0.0 and 1.0, was {}", self.beta);
        }
        if self.granularity.is_zero() {
            bail!("clock granularity must be positive");
        }
        if self.initial_rto > self.max_rto {
            bail!("initial RTO {:?} exceeds max RTO {:?}", self.initial_rto, self.max_rto);
        }
        if self.backoff_factor < 1 {
            bail!("backoff factor must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ThroughputMonitorConfig {
    pub measurement_interval: Duration,
    /// number of measurements that are averaged before the send window is adjusted
    pub history_size: usize,
    pub window_step: usize,
    pub min_window: usize,
    pub max_window: usize,
}

impl Default for ThroughputMonitorConfig {
    fn default() -> Self {
        ThroughputMonitorConfig {
            measurement_interval: Duration::from_secs(1),
            history_size: 3,
            window_step: 50,
            min_window: 50,
            max_window: 10_000,
        }
    }
}

impl ThroughputMonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.measurement_interval.is_zero() {
            bail!("measurement interval must be positive");
        }
        if self.history_size == 0 {
            bail!("history size must be at least 1");
        }
        if self.min_window == 0 || self.min_window > self.max_window {
            bail!("invalid send window bounds [{}, {}]", self.min_window, self.max_window);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub max_datagram_size: usize,
    /// maximum number of 'recent' unacknowledged messages. The throughput monitor (if any) adjusts
    ///  the window starting from this value.
    pub initial_send_window: usize,
    /// sleep between attempts of a blocking send while the send window is full
    pub send_retry_interval: Duration,
    /// number of attempts of a blocking send before the message is queued instead
    pub send_attempts: u32,
    pub send_loop_interval: Duration,
    /// messages that were retransmitted more often than this are demoted to 'stale'
    pub max_retries_before_stale: u32,

    pub rto: RtoConfig,
    pub throughput_monitor: Option<ThroughputMonitorConfig>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            max_datagram_size: 1472,
            initial_send_window: 1000,
            send_retry_interval: Duration::from_millis(100),
            send_attempts: 10,
            send_loop_interval: Duration::from_millis(1),
            max_retries_before_stale: 2,
            rto: Default::default(),
            throughput_monitor: Some(Default::default()),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(DatagramData::HEADER_LEN..=MAX_UDP_PAYLOAD).contains(&self.max_datagram_size) {
            bail!("max datagram size must be between {} and {}, was {}", DatagramData::HEADER_LEN, MAX_UDP_PAYLOAD, self.max_datagram_size);
        }
        if self.initial_send_window == 0 {
            bail!("send window must be positive");
        }
        if self.send_attempts == 0 {
            bail!("send attempts must be positive");
        }
        if self.send_loop_interval.is_zero() {
            bail!("send loop interval must be positive");
        }
        self.rto.validate()?;
        if let Some(monitor) = &self.throughput_monitor {
            monitor.validate()?;
            if !(monitor.min_window..=monitor.max_window).contains(&self.initial_send_window) {
                bail!("initial send window {} is outside the throughput monitor's bounds", self.initial_send_window);
            }
        }
        Ok(())
    }
}
