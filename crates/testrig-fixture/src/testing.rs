//! Test doubles for fixtures and hooks.
//!
//! Enabled inside this crate's tests and, for other crates, through the
//! `testing` feature.

use crate::client::{command_name, AdminClient, ClientError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

type Responder = dyn Fn(u16, &str, &Value) -> Result<Value, ClientError> + Send + Sync;

/// One command seen by a [`ScriptedClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
    pub port: u16,
    pub db: String,
    pub name: String,
    pub body: Value,
}

/// An [`AdminClient`] answering from a closure and recording every call.
pub struct ScriptedClient {
    responder: Box<Responder>,
    calls: Mutex<Vec<RecordedCommand>>,
    unreachable: Mutex<BTreeSet<u16>>,
}

impl ScriptedClient {
    pub fn new(
        responder: impl Fn(u16, &str, &Value) -> Result<Value, ClientError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            unreachable: Mutex::new(BTreeSet::new()),
        }
    }

    /// Answers `{ok: 1}` to everything.
    pub fn ok() -> Self {
        Self::new(|_, _, _| Ok(json!({"ok": 1})))
    }

    /// A healthy replica set whose primary listens on `primary_port`.
    ///
    /// `isMaster` and `replSetGetStatus` report PRIMARY on that port and
    /// SECONDARY elsewhere; every other command succeeds.
    pub fn healthy_replica_set(primary_port: u16) -> Self {
        Self::new(move |port, _db, command| {
            let is_primary = port == primary_port;
            Ok(match command_name(command).as_str() {
                "isMaster" => json!({"ok": 1, "ismaster": is_primary, "secondary": !is_primary}),
                "replSetGetStatus" => json!({"ok": 1, "myState": if is_primary { 1 } else { 2 }}),
                _ => json!({"ok": 1}),
            })
        })
    }

    /// Make `ping` and `run_command` on `port` fail as unreachable.
    pub fn set_unreachable(&self, port: u16, unreachable: bool) {
        let mut ports = self.unreachable.lock();
        if unreachable {
            ports.insert(port);
        } else {
            ports.remove(&port);
        }
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls.lock().clone()
    }

    /// Commands named `name` run so far.
    pub fn calls_named(&self, name: &str) -> Vec<RecordedCommand> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.name == name)
            .cloned()
            .collect()
    }

    fn check_reachable(&self, port: u16) -> Result<(), ClientError> {
        if self.unreachable.lock().contains(&port) {
            return Err(ClientError::Unreachable {
                port,
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

impl AdminClient for ScriptedClient {
    fn ping(&self, port: u16) -> Result<(), ClientError> {
        self.check_reachable(port)
    }

    fn run_command(&self, port: u16, db: &str, command: &Value) -> Result<Value, ClientError> {
        self.calls.lock().push(RecordedCommand {
            port,
            db: db.to_string(),
            name: command_name(command),
            body: command.clone(),
        });
        self.check_reachable(port)?;
        (self.responder)(port, db, command)
    }
}

/// Write an executable shell script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// A long-running fake server that accepts any arguments and exits 0 on
/// SIGTERM.
pub fn fake_server(dir: &Path, name: &str) -> io::Result<PathBuf> {
    write_script(dir, name, "trap 'exit 0' TERM\nwhile :; do sleep 0.05; done")
}

/// A program that exits immediately with `code`.
pub fn exiting_program(dir: &Path, name: &str, code: i32) -> io::Result<PathBuf> {
    write_script(dir, name, &format!("exit {}", code))
}

/// SIGKILL `pid` and collect its exit status here, so the [`Process`]
/// handle that spawned it can no longer wait on it.
///
/// [`Process`]: crate::process::Process
pub fn reap_behind_handle(pid: u32) {
    let pid = pid as libc::pid_t;
    let mut status = 0;
    // SAFETY: kill(2) and waitpid(2) only touch `status`, a valid local.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, &mut status, 0);
    }
}
