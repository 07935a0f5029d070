//! A one-thread scheduler for delayed, cancellable callbacks.
//!
//! ```text
//!   schedule(delay, f) ──▶ queue[(deadline, id)] ──▶ timer thread runs f
//!   cancel(handle)     ──▶ removes the entry if it has not started
//! ```
//!
//! Callbacks run on the timer thread, one at a time and outside the queue
//! lock, so a callback may schedule or cancel further work.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
}

struct Queue {
    entries: BTreeMap<u64, (Instant, Task)>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Scheduler {
    /// Start the timer thread.
    pub fn new(name: &str) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BTreeMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker))?;
        let thread_id = thread.thread().id();
        Ok(Self {
            shared,
            thread: Some(thread),
            thread_id,
        })
    }

    /// Run `task` once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        let id = queue.next_id;
        queue.next_id += 1;
        queue.entries.insert(id, (Instant::now() + delay, Box::new(task)));
        self.shared.wakeup.notify_one();
        TimerHandle { id }
    }

    /// Returns `true` if the callback was removed before it started.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let removed = self.shared.queue.lock().entries.remove(&handle.id);
        if removed.is_some() {
            self.shared.wakeup.notify_one();
        }
        removed.is_some()
    }

    /// Whether the callback is still waiting for its deadline.
    pub fn is_pending(&self, handle: &TimerHandle) -> bool {
        self.shared.queue.lock().entries.contains_key(&handle.id)
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        // The last owner may be a callback running on the timer thread.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn next_due(queue: &Queue) -> Option<(u64, Instant)> {
    queue
        .entries
        .iter()
        .map(|(id, (deadline, _))| (*id, *deadline))
        .min_by_key(|(id, deadline)| (*deadline, *id))
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        match next_due(&queue) {
            None => shared.wakeup.wait(&mut queue),
            Some((id, deadline)) if deadline <= Instant::now() => {
                if let Some((_, task)) = queue.entries.remove(&id) {
                    MutexGuard::unlocked(&mut queue, task);
                }
            }
            Some((_, deadline)) => {
                shared.wakeup.wait_until(&mut queue, deadline);
            }
        }
    }
}
