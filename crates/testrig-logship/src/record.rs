//! The unit of shipping.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// One structured log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub t: u64,
    pub level: String,
    pub logger: String,
    pub message: String,
}

impl LogRecord {
    /// A record stamped with the current time.
    pub fn new(level: impl Into<String>, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            t: now_millis(),
            level: level.into(),
            logger: logger.into(),
            message: message.into(),
        }
    }

    pub fn at(mut self, t: u64) -> Self {
        self.t = t;
        self
    }
}

impl From<&log::Record<'_>> for LogRecord {
    fn from(record: &log::Record<'_>) -> Self {
        Self::new(
            record.level().as_str(),
            record.target(),
            record.args().to_string(),
        )
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
