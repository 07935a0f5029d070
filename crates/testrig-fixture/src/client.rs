//! Admin-command access to deployment members.
//!
//! Fixtures and hooks never speak the database wire protocol themselves.
//! They send JSON command documents through an [`AdminClient`], addressed by
//! port.  [`ShellClient`] implements it with the configured shell
//! executable; tests use the scripted client from the `testing` module.

use crate::process::{build_args, OptionMap, OptionValue};
use log::debug;
use serde_json::Value;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// Server error codes meaning "this node is not (or no longer) primary".
const NOT_PRIMARY_CODES: &[i64] = &[10107, 13435, 13436, 11600, 11602, 189, 91];

/// Errors from admin commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("could not reach port {port}: {reason}")]
    Unreachable { port: u16, reason: String },

    #[error("command '{command}' failed on port {port}: {code_name} ({code}): {message}")]
    CommandFailed {
        port: u16,
        command: String,
        code: i64,
        code_name: String,
        message: String,
    },

    #[error("write concern error on port {port} ({code}): {message}")]
    WriteConcern { port: u16, code: i64, message: String },

    #[error("unexpected response from port {port}: {detail}")]
    Protocol { port: u16, detail: String },
}

impl ClientError {
    /// The node refused because it is not primary.
    pub fn is_not_primary(&self) -> bool {
        matches!(self, ClientError::CommandFailed { code, .. } if NOT_PRIMARY_CODES.contains(code))
    }

    /// A replicated write may succeed if issued again.
    pub fn is_retryable_write(&self) -> bool {
        matches!(
            self,
            ClientError::Unreachable { .. } | ClientError::WriteConcern { .. }
        ) || self.is_not_primary()
    }
}

/// Sends admin commands to deployment members.
pub trait AdminClient: Send + Sync {
    /// Succeeds once the member accepts connections.
    fn ping(&self, port: u16) -> Result<(), ClientError>;

    /// Run `command` against database `db` on the member at `port`.
    ///
    /// The first key of `command` is the command name.  A response with
    /// `ok != 1` is returned as [`ClientError::CommandFailed`].
    fn run_command(&self, port: u16, db: &str, command: &Value) -> Result<Value, ClientError>;
}

/// Name of a command document (its first key).
pub fn command_name(command: &Value) -> String {
    command
        .as_object()
        .and_then(|fields| fields.keys().next())
        .cloned()
        .unwrap_or_default()
}

/// Turn a raw command response into a result.
pub fn check_response(port: u16, command: &str, response: Value) -> Result<Value, ClientError> {
    let ok = response.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
    if ok != 1.0 {
        return Err(ClientError::CommandFailed {
            port,
            command: command.to_string(),
            code: response.get("code").and_then(Value::as_i64).unwrap_or(-1),
            code_name: response
                .get("codeName")
                .and_then(Value::as_str)
                .unwrap_or("UnknownError")
                .to_string(),
            message: response
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    if let Some(wce) = response.get("writeConcernError") {
        return Err(ClientError::WriteConcern {
            port,
            code: wce.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: wce
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    Ok(response)
}

/// Runs admin commands by launching the shell with `--eval`.
#[derive(Debug, Clone)]
pub struct ShellClient {
    shell: PathBuf,
    host: String,
    connect_timeout: Duration,
}

impl ShellClient {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            host: "localhost".to_string(),
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Script that prints the command response as one line of JSON.
    fn eval_script(db: &str, command: &Value) -> String {
        let db_literal = Value::String(db.to_string());
        format!(
            "print(JSON.stringify(db.getSiblingDB({}).runCommand({})));",
            db_literal, command
        )
    }
}

impl AdminClient for ShellClient {
    fn ping(&self, port: u16) -> Result<(), ClientError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map(|_| ())
            .map_err(|err| ClientError::Unreachable {
                port,
                reason: err.to_string(),
            })
    }

    fn run_command(&self, port: u16, db: &str, command: &Value) -> Result<Value, ClientError> {
        let name = command_name(command);
        debug!("Running '{}' on port {}", name, port);

        let mut options = OptionMap::new();
        options.insert("host".into(), OptionValue::from(self.host.as_str()));
        options.insert("port".into(), OptionValue::from(port));
        options.insert("quiet".into(), OptionValue::flag());
        options.insert("eval".into(), OptionValue::from(Self::eval_script(db, command)));
        let args = build_args(&self.shell, &options, &[]);

        let output = Command::new(&args[0])
            .args(&args[1..])
            .output()
            .map_err(|err| ClientError::Unreachable {
                port,
                reason: format!("could not launch {}: {}", self.shell.display(), err),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::Unreachable {
                port,
                reason: format!("shell exited with {}: {}{}", output.status, stdout, stderr),
            });
        }

        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| ClientError::Protocol {
                port,
                detail: "empty response".to_string(),
            })?;
        let response: Value = serde_json::from_str(line).map_err(|err| ClientError::Protocol {
            port,
            detail: format!("{}: {}", err, line),
        })?;

        check_response(port, &name, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_name_is_first_key() {
        let cmd = json!({"insert": "coll", "documents": [], "writeConcern": {"w": 2}});
        assert_eq!(command_name(&cmd), "insert");
        assert_eq!(command_name(&json!(1)), "");
    }

    #[test]
    fn failed_response_maps_to_command_failed() {
        let err = check_response(
            20000,
            "replSetStepUp",
            json!({"ok": 0, "code": 10107, "codeName": "NotMaster", "errmsg": "not master"}),
        )
        .unwrap_err();
        assert!(err.is_not_primary());
        assert!(err.is_retryable_write());
        assert!(matches!(err, ClientError::CommandFailed { code: 10107, .. }));
    }

    #[test]
    fn write_concern_error_is_retryable() {
        let err = check_response(
            20000,
            "insert",
            json!({"ok": 1, "n": 1, "writeConcernError": {"code": 64, "errmsg": "waiting for replication timed out"}}),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ClientError::WriteConcern {
                port: 20000,
                code: 64,
                message: "waiting for replication timed out".to_string()
            }
        );
        assert!(err.is_retryable_write());
    }

    #[test]
    fn ok_response_passes_through() {
        let response = check_response(1, "isMaster", json!({"ok": 1.0, "ismaster": true})).unwrap();
        assert_eq!(response["ismaster"], json!(true));
    }

    #[test]
    fn eval_script_embeds_ordered_command() {
        let script = ShellClient::eval_script("admin", &json!({"replSetFreeze": 0, "comment": "x"}));
        assert_eq!(
            script,
            r#"print(JSON.stringify(db.getSiblingDB("admin").runCommand({"replSetFreeze":0,"comment":"x"})));"#
        );
    }

    #[test]
    fn ping_fails_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = ShellClient::new("mongo");
        assert!(client.ping(port).is_ok());

        drop(listener);
        assert!(matches!(client.ping(port), Err(ClientError::Unreachable { .. })));
    }

    #[test]
    fn shell_client_parses_last_line_of_output() {
        let dir = tempfile::tempdir().unwrap();
        let shell = dir.path().join("fake-shell");
        std::fs::write(
            &shell,
            "#!/bin/sh\necho 'banner'\necho '{\"ok\": 1, \"myState\": 2}'\n",
        )
        .unwrap();
        std::fs::set_permissions(
            &shell,
            std::os::unix::fs::PermissionsExt::from_mode(0o755),
        )
        .unwrap();

        let client = ShellClient::new(&shell);
        let response = client
            .run_command(20000, "admin", &json!({"replSetGetStatus": 1}))
            .unwrap();
        assert_eq!(response["myState"], json!(2));
    }
}
