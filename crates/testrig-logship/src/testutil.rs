//! Deliveries for tests.

use crate::error::DeliveryError;
use crate::http::Delivery;
use crate::record::LogRecord;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

/// Hands every batch to a channel.
pub struct ChannelDelivery {
    tx: Mutex<Sender<Vec<LogRecord>>>,
}

impl ChannelDelivery {
    pub fn new() -> (Self, Receiver<Vec<LogRecord>>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl Delivery for ChannelDelivery {
    fn send(&self, batch: &[LogRecord]) -> Result<(), DeliveryError> {
        let _ = self.tx.lock().send(batch.to_vec());
        Ok(())
    }
}

/// Rejects everything as unauthorized.
pub struct FailingDelivery;

impl Delivery for FailingDelivery {
    fn send(&self, _batch: &[LogRecord]) -> Result<(), DeliveryError> {
        Err(DeliveryError::Rejected {
            status: 401,
            body: "unauthorized".into(),
        })
    }
}

pub fn record(i: usize) -> LogRecord {
    LogRecord::new("INFO", "test", format!("m{}", i)).at(i as u64)
}
