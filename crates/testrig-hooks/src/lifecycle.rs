//! Stepdown coordination between the test thread and a fault actor.
//!
//! The handshake has three observable states:
//!
//! ```text
//!   test thread                          actor
//!   ───────────                          ─────
//!   mark_test_started()  ──────────▶   wait_for_stepdown_permitted() -> true
//!                                        ...acts...
//!   mark_test_finished() ──────────▶   poll_for_idle_request() -> true
//!                        ◀──────────   send_idle_acknowledgement()
//!   stop()               ──────────▶   wait_for_stepdown_permitted() -> false
//! ```
//!
//! [`FlagLifecycle`] keeps the state in memory for an actor thread.
//! [`FileLifecycle`] keeps it in sentinel files so an actor in another
//! process can take part.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The controller/actor handshake.
pub trait StepdownLifecycle: Send + Sync {
    /// A test is about to run; the actor may act.
    fn mark_test_started(&self);

    /// The test finished; the actor must go idle.
    fn mark_test_finished(&self) -> io::Result<()>;

    /// Block until acting is permitted.  `false` once stopped.
    fn wait_for_stepdown_permitted(&self) -> bool;

    /// Sleep up to `timeout`, returning early on `stop()`.
    fn wait_for_stepdown_interval(&self, timeout: Duration);

    /// Whether the actor has been asked to go idle.
    fn poll_for_idle_request(&self) -> bool;

    /// Actor side: confirm that it is idle.
    fn send_idle_acknowledgement(&self) -> io::Result<()>;

    /// Wake every waiter, now and forever.  Idempotent.
    fn stop(&self);
}

#[derive(Debug, Default)]
struct FlagState {
    running: bool,
    idle_request: bool,
    idle_ack: bool,
    stopped: bool,
}

/// In-process handshake: three flags under one monitor.
#[derive(Debug, Default)]
pub struct FlagLifecycle {
    state: Mutex<FlagState>,
    cond: Condvar,
}

impl FlagLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the actor to go idle without ending the test.
    pub fn request_idle(&self) {
        let mut state = self.state.lock();
        state.idle_request = true;
        self.cond.notify_all();
    }

    pub fn is_idle_acknowledged(&self) -> bool {
        self.state.lock().idle_ack
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl StepdownLifecycle for FlagLifecycle {
    fn mark_test_started(&self) {
        let mut state = self.state.lock();
        state.running = true;
        state.idle_request = false;
        state.idle_ack = false;
        self.cond.notify_all();
    }

    fn mark_test_finished(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.idle_request = false;
        state.idle_ack = false;
        self.cond.notify_all();
        Ok(())
    }

    fn wait_for_stepdown_permitted(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            if state.running && !state.idle_request {
                return true;
            }
            self.cond.wait(&mut state);
        }
    }

    fn wait_for_stepdown_interval(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if !state.stopped {
            self.cond.wait_for(&mut state, timeout);
        }
    }

    fn poll_for_idle_request(&self) -> bool {
        let state = self.state.lock();
        state.idle_request || !state.running
    }

    fn send_idle_acknowledgement(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.idle_ack = true;
        self.cond.notify_all();
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.cond.notify_all();
    }
}

/// Paths of the three sentinel files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepdownFiles {
    pub permitted: PathBuf,
    pub idle_request: PathBuf,
    pub idle_ack: PathBuf,
}

impl StepdownFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            permitted: dir.join("permitted"),
            idle_request: dir.join("idle_request"),
            idle_ack: dir.join("idle_ack"),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.permitted, &self.idle_request, &self.idle_ack]
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn touch(path: &Path) -> io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(drop)
}

/// Cross-process handshake encoded by the existence of sentinel files.
///
/// The other process creates `permitted` while a test runs and
/// `idle_request` when it wants the actor idle.  Waits poll the filesystem;
/// the local condition variable only makes `stop()` prompt.
#[derive(Debug)]
pub struct FileLifecycle {
    files: StepdownFiles,
    stopped: Mutex<bool>,
    cond: Condvar,
    poll_interval: Duration,
}

impl FileLifecycle {
    pub fn new(files: StepdownFiles) -> Self {
        Self {
            files,
            stopped: Mutex::new(false),
            cond: Condvar::new(),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn files(&self) -> &StepdownFiles {
        &self.files
    }
}

impl StepdownLifecycle for FileLifecycle {
    fn mark_test_started(&self) {}

    fn mark_test_finished(&self) -> io::Result<()> {
        for path in self.files.all() {
            remove_if_present(path)?;
        }
        self.cond.notify_all();
        Ok(())
    }

    fn wait_for_stepdown_permitted(&self) -> bool {
        let mut stopped = self.stopped.lock();
        loop {
            if *stopped {
                return false;
            }
            if self.files.permitted.is_file() {
                return true;
            }
            self.cond.wait_for(&mut stopped, self.poll_interval);
        }
    }

    fn wait_for_stepdown_interval(&self, timeout: Duration) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, timeout);
        }
    }

    fn poll_for_idle_request(&self) -> bool {
        self.files.idle_request.is_file()
    }

    fn send_idle_acknowledgement(&self) -> io::Result<()> {
        touch(&self.files.idle_ack)?;
        remove_if_present(&self.files.permitted)
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }
}
