use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::ThroughputMonitorConfig;

/// The current send window size, shared between the sender and the throughput monitor.
#[derive(Debug)]
pub struct SendWindow {
    size: AtomicUsize,
}

impl SendWindow {
    pub fn new(size: usize) -> SendWindow {
        SendWindow { size: AtomicUsize::new(size) }
    }

    pub fn get(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn set(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }
}

/// Additive increase / decrease of the send window based on the number of acknowledgements per
///  measurement interval.
pub struct ThroughputMonitor {
    config: ThroughputMonitorConfig,
    acks_in_interval: AtomicUsize,
    history: Mutex<ThroughputHistory>,
}

impl ThroughputMonitor {
    pub fn new(config: ThroughputMonitorConfig) -> ThroughputMonitor {
        let history = ThroughputHistory::new(config.history_size);
        ThroughputMonitor {
            config,
            acks_in_interval: AtomicUsize::new(0),
            history: Mutex::new(history),
        }
    }

    pub fn config(&self) -> &ThroughputMonitorConfig {
        &self.config
    }

    pub fn on_ack(&self) {
        self.acks_in_interval.fetch_add(1, Ordering::AcqRel);
    }

    /// Ends the current measurement interval, adjusting the send window if a full history of
    ///  measurements is available.
    pub fn end_interval(&self, window: &SendWindow) {
        let num_acks = self.acks_in_interval.swap(0, Ordering::AcqRel);

        let trend = match self.history.lock() {
            Ok(mut history) => history.add_measurement(num_acks),
            Err(e) => {
                warn!("throughput history is poisoned - not adjusting the send window: {}", e);
                return;
            }
        };

        let old_size = window.get();
        let new_size = match trend {
            None => return,
            Some(Trend::NonDecreasing) => old_size.saturating_add(self.config.window_step),
            Some(Trend::Decreasing) => old_size.saturating_sub(self.config.window_step),
        }
            .clamp(self.config.min_window, self.config.max_window);

        if new_size != old_size {
            debug!("throughput {:?}: adjusting send window from {} to {}", trend, old_size, new_size);
            window.set(new_size);
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Trend {
    NonDecreasing,
    Decreasing,
}

/// Measurements are collected in batches. Each full batch's average is compared to the previous
///  batch's average.
#[derive(Debug)]
pub struct ThroughputHistory {
    batch_size: usize,
    batch: Vec<usize>,
    previous_average: f64,
}

impl ThroughputHistory {
    pub fn new(batch_size: usize) -> ThroughputHistory {
        ThroughputHistory {
            batch_size,
            batch: Vec::with_capacity(batch_size),
            previous_average: 0.0,
        }
    }

    pub fn add_measurement(&mut self, num_acks: usize) -> Option<Trend> {
        self.batch.push(num_acks);
        if self.batch.len() < self.batch_size {
            return None;
        }

        let average = self.batch.iter().sum::<usize>() as f64 / self.batch.len() as f64;
        self.batch.clear();

        let trend = if average >= self.previous_average {
            Trend::NonDecreasing
        }
        else {
            Trend::Decreasing
        };
        self.previous_average = average;
        Some(trend)
    }
}
