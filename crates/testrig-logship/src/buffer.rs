//! The buffered, time-or-capacity flushing handler.
//!
//! ```text
//!   append ──▶ buffer ──(len == capacity)──▶ cancel timer, schedule now ─┐
//!                 ▲                                                      ▼
//!                 └──── swap for empty ◀── flush_lock ◀── timer thread ──┘
//!                                              │
//!                                              ▼
//!                                        Delivery::send
//! ```
//!
//! Producers only ever take the buffer lock, which is never held across a
//! send.  Sends are serialized by a second lock, so batches leave in the
//! order their records were appended.  At most one timer is outstanding
//! per handler.

use crate::error::DeliveryError;
use crate::http::Delivery;
use crate::record::LogRecord;
use crate::timer::{Scheduler, TimerHandle};
use parking_lot::Mutex;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Inner<D: Delivery> {
    delivery: D,
    capacity: usize,
    interval: Duration,
    buffer: Mutex<Vec<LogRecord>>,
    flush_lock: Mutex<()>,
    timer: Mutex<Option<TimerHandle>>,
    scheduler: Scheduler,
    /// Failures from timer-driven flushes, oldest first.
    errors: Mutex<Vec<DeliveryError>>,
    closed: AtomicBool,
}

/// Cheap to clone; all clones feed the same buffer.
pub struct BufferedHandler<D: Delivery> {
    inner: Arc<Inner<D>>,
}

impl<D: Delivery> Clone for BufferedHandler<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Delivery> BufferedHandler<D> {
    /// Flush every `interval`, or as soon as `capacity` records are waiting.
    pub fn new(delivery: D, capacity: usize, interval: Duration) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            delivery,
            capacity: capacity.max(1),
            interval,
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            timer: Mutex::new(None),
            scheduler: Scheduler::new("logship-flush")?,
            errors: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let handle = inner.schedule(interval);
        *inner.timer.lock() = Some(handle);
        Ok(Self { inner })
    }

    /// Queue a record.  Returns `false` once the handler is closed.
    pub fn append(&self, record: LogRecord) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        let full = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(record);
            buffer.len() >= self.inner.capacity
        };
        if full {
            self.inner.flush_early();
        }
        true
    }

    /// Send whatever is buffered now, on the calling thread.
    pub fn flush(&self) -> Result<(), DeliveryError> {
        self.inner.flush_batch()
    }

    /// Cancel the timer and send the remaining records.
    ///
    /// Only the first call does anything.  Returns the oldest delivery
    /// failure, including ones from earlier background flushes; later
    /// failures stay available from [`BufferedHandler::take_errors`].
    pub fn close(&self) -> Result<(), DeliveryError> {
        self.inner.close()
    }

    /// Failures from background flushes since the last call.
    pub fn take_errors(&self) -> Vec<DeliveryError> {
        mem::take(&mut *self.inner.errors.lock())
    }

    pub(crate) fn retain_error(&self, err: DeliveryError) {
        self.inner.errors.lock().push(err);
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn delivery(&self) -> &D {
        &self.inner.delivery
    }
}

impl<D: Delivery> Inner<D> {
    fn schedule(self: &Arc<Self>, delay: Duration) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.schedule(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timer();
            }
        })
    }

    /// Replace the pending timer with one that fires immediately.
    fn flush_early(self: &Arc<Self>) {
        let mut slot = self.timer.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = slot.take() {
            self.scheduler.cancel(&handle);
        }
        *slot = Some(self.schedule(Duration::ZERO));
    }

    fn on_timer(self: &Arc<Self>) {
        if let Err(err) = self.flush_batch() {
            self.errors.lock().push(err);
        }
        let mut slot = self.timer.lock();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let pending = slot
            .as_ref()
            .is_some_and(|handle| self.scheduler.is_pending(handle));
        if !pending {
            *slot = Some(self.schedule(self.interval));
        }
    }

    fn flush_batch(&self) -> Result<(), DeliveryError> {
        let _serial = self.flush_lock.lock();
        let batch = mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.delivery.send(&batch)
    }

    fn close(&self) -> Result<(), DeliveryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.timer.lock().take() {
            self.scheduler.cancel(&handle);
        }
        let last = self.flush_batch();
        let mut errors = self.errors.lock();
        if let Err(err) = last {
            errors.push(err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.remove(0))
        }
    }
}

impl<D: Delivery> Drop for Inner<D> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let batch = mem::take(self.buffer.get_mut());
        if !batch.is_empty() {
            // Nobody is left to report a failure to.
            let _ = self.delivery.send(&batch);
        }
    }
}
