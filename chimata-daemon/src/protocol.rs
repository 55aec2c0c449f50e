//! Control socket wire format and the blocking client the CLI uses.
//!
//! One JSON object per line in each direction. Requests are tagged by `cmd`:
//! `{"cmd":"status"}`, `{"cmd":"reload"}`, `{"cmd":"stop"}` and
//! `{"cmd":"sync","mirror":"debian"}`.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::reconciler::ReconcileSummary;

/// How long the client waits on a connected socket before giving up.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// `status` is what callers poll right after `start`; give a daemon that is
/// still binding its socket a few chances.
const STATUS_CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Status,
    Reload,
    Stop,
    Sync { mirror: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Payload of a successful response, or the daemon's error message.
    pub fn into_result(self) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(message)) => Err(DaemonError::Protocol(message)),
            (false, None) => Err(DaemonError::Protocol("daemon reported an unspecified error".into())),
        }
    }
}

/// Blocking client for one daemon control socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
    io_timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Daemon status payload: `running`, `pid`, `config` and per-mirror
    /// `mirrors` entries.
    pub fn status(&self) -> Result<Value, DaemonError> {
        self.exchange(&DaemonRequest::Status, STATUS_CONNECT_ATTEMPTS)
    }

    pub fn reload(&self) -> Result<ReconcileSummary, DaemonError> {
        let data = self.call(&DaemonRequest::Reload)?;
        serde_json::from_value(data).map_err(DaemonError::from)
    }

    /// Trigger one run of `mirror`. `Ok(false)` means a run was already in
    /// progress and the request was skipped.
    pub fn sync(&self, mirror: &str) -> Result<bool, DaemonError> {
        let data = self.call(&DaemonRequest::Sync {
            mirror: mirror.to_string(),
        })?;
        Ok(data["started"].as_bool().unwrap_or(false))
    }

    pub fn stop(&self) -> Result<(), DaemonError> {
        self.call(&DaemonRequest::Stop).map(|_| ())
    }

    /// Send `request` once and return the response payload.
    pub fn call(&self, request: &DaemonRequest) -> Result<Value, DaemonError> {
        self.exchange(request, 1)
    }

    fn exchange(&self, request: &DaemonRequest, connect_attempts: u32) -> Result<Value, DaemonError> {
        let stream = self.connect(connect_attempts)?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.io_timeout)))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        (&stream)
            .write_all(line.as_bytes())
            .map_err(|e| self.transport_err(e))?;

        let mut reply = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut reply)
            .map_err(|e| self.transport_err(e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }

        let response: DaemonResponse = serde_json::from_str(reply.trim_end())?;
        response.into_result()
    }

    fn connect(&self, attempts: u32) -> Result<UnixStream, DaemonError> {
        let mut attempt = 1;
        loop {
            let err = match UnixStream::connect(&self.socket) {
                Ok(stream) => return Ok(stream),
                Err(err) if !means_not_running(err.kind()) => {
                    return Err(io_err(&self.socket, err));
                }
                Err(_) => DaemonError::DaemonNotRunning {
                    socket: self.socket.clone(),
                },
            };
            if attempt >= attempts {
                return Err(err);
            }
            attempt += 1;
            sleep(CONNECT_RETRY_DELAY);
        }
    }

    fn transport_err(&self, err: std::io::Error) -> DaemonError {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => DaemonError::Protocol(format!(
                "daemon at {} did not answer within {}s",
                self.socket.display(),
                self.io_timeout.as_secs_f32()
            )),
            _ => io_err(&self.socket, err),
        }
    }
}

fn means_not_running(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}
