//! # Sampling Module
//!
//! Heart rate samples and the minimum-interval decimation that turns the
//! sensor's sub-second notification stream into the recorded series.
//!
//! Decimation is greedy: a sample is kept when at least one sampling interval
//! has passed since the last kept sample, otherwise it is dropped. Nothing is
//! averaged. The live plot still sees every raw sample.

use chrono::{DateTime, Local};
use std::time::Duration;

/// One heart rate reading. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub heart_rate: u16,
}

impl Sample {
    pub fn new(timestamp: DateTime<Local>, heart_rate: u16) -> Self {
        Self {
            timestamp,
            heart_rate,
        }
    }
}

/// Greedy low-pass over sample timestamps
#[derive(Debug, Clone)]
pub struct Decimator {
    interval: chrono::Duration,
    last_accepted: Option<DateTime<Local>>,
}

impl Decimator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX),
            last_accepted: None,
        }
    }

    /// Returns true when the sample belongs in the recorded series
    pub fn offer(&mut self, sample: &Sample) -> bool {
        let accept = match self.last_accepted {
            None => true,
            Some(last) => sample.timestamp - last >= self.interval,
        };
        if accept {
            self.last_accepted = Some(sample.timestamp);
        }
        accept
    }
}
