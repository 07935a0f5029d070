//! When a periodic background monitor closes its current period.

use std::time::Duration;

/// A period ends after a fixed duration or after a number of samples
/// (completed tests).  When both are set the duration decides and the
/// sample count is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub duration: Option<Duration>,
    pub samples: Option<u64>,
}

impl StopPolicy {
    pub fn after_duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            samples: None,
        }
    }

    pub fn after_samples(samples: u64) -> Self {
        Self {
            duration: None,
            samples: Some(samples),
        }
    }

    pub fn is_due(&self, elapsed: Duration, samples: u64) -> bool {
        match (self.duration, self.samples) {
            (Some(duration), _) => elapsed >= duration,
            (None, Some(limit)) => samples >= limit,
            (None, None) => true,
        }
    }
}
