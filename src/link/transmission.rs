use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::RtoConfig;

/// Send bookkeeping of a single unacknowledged message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TransmissionHistory {
    pub send_time: Instant,
    pub retries: u32,
}

impl TransmissionHistory {
    pub fn new(send_time: Instant) -> TransmissionHistory {
        TransmissionHistory { send_time, retries: 0 }
    }

    pub fn mark_resent(&mut self, now: Instant) {
        self.send_time = now;
        self.retries += 1;
    }

    /// RTT samples of retransmitted messages are ambiguous and must be ignored (Karn's algorithm)
    pub fn is_retransmitted(&self) -> bool {
        self.retries > 0
    }
}

/// RFC 6298 retransmission timeout estimation for a single destination.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransmissionParameters {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl TransmissionParameters {
    pub fn new(config: &RtoConfig) -> TransmissionParameters {
        TransmissionParameters {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: config.initial_rto,
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn on_rtt_sample(&mut self, rtt: Duration, config: &RtoConfig) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2;
                rtt
            }
            Some(srtt) => {
                // RTTVAR is updated with the *old* SRTT
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar.mul_f64(1.0 - config.beta) + deviation.mul_f64(config.beta);
                srtt.mul_f64(1.0 - config.alpha) + rtt.mul_f64(config.alpha)
            }
        };
        self.srtt = Some(srtt);

        let variance_term = config.granularity.max(self.rttvar * config.k);
        self.rto = (srtt + variance_term).min(config.max_rto);
        trace!("RTT sample {:?}: srtt={:?}, rttvar={:?}, rto={:?}", rtt, srtt, self.rttvar, self.rto);
    }

    pub fn back_off(&mut self, config: &RtoConfig) {
        self.rto = self.rto.saturating_mul(config.backoff_factor).min(config.max_rto);
    }

    /// Recent messages are retransmitted after at most the initial RTO, regardless of how far the
    ///  RTO was backed off. Stale messages wait for the full RTO.
    pub fn retransmission_timeout(&self, is_stale: bool, config: &RtoConfig) -> Duration {
        if is_stale {
            self.rto
        }
        else {
            self.rto.min(config.initial_rto)
        }
    }
}
