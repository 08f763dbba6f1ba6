//! Thin adapter between the controller and the external control bus.
//!
//! The bus itself is a separate pub/sub fabric; this end of it only
//! speaks two message kinds in each direction, `RFS_FILE_CHANGED` and
//! `RFS_FILE_DELETED`, plus the stop order used for graceful shutdown.
//! Messages are single text lines: a command word followed by
//! `key=value` parameters separated by semicolons.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const CMD_FILE_CHANGED: &str = "RFS_FILE_CHANGED";
pub const CMD_FILE_DELETED: &str = "RFS_FILE_DELETED";
pub const CMD_STOP: &str = "RFS_STOP";

/// A message crossing the bus boundary, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    FileChanged {
        filename: PathBuf,
        id: u32,
        mtime_sec: u64,
        mtime_nsec: u64,
        endpoints: String,
    },
    FileDeleted {
        filename: PathBuf,
    },
    Stop,
}

/// An incoming message plus whether it arrived over a secure bus channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub command: BusCommand,
    pub secure: bool,
}

impl BusCommand {
    pub fn encode(&self) -> String {
        match self {
            Self::FileChanged {
                filename,
                id,
                mtime_sec,
                mtime_nsec,
                endpoints,
            } => format!(
                "{CMD_FILE_CHANGED} filename={};id={id};mtime={mtime_sec}.{mtime_nsec:09};endpoints={endpoints}",
                filename.display(),
            ),
            Self::FileDeleted { filename } => {
                format!("{CMD_FILE_DELETED} filename={}", filename.display())
            }
            Self::Stop => CMD_STOP.to_string(),
        }
    }
}

/// Parse one bus line. Commands outside this daemon's contract return
/// `None` and are ignored by the caller.
pub fn parse(line: &str) -> Option<BusEvent> {
    let line = line.trim();
    let (command, params) = match line.split_once(' ') {
        Some((command, params)) => (command, params),
        None => (line, ""),
    };

    let get = |key: &str| -> Option<&str> {
        params
            .split(';')
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    };
    let secure = get("secure").is_some_and(|v| v == "true");

    let command = match command {
        CMD_FILE_CHANGED => {
            let filename = get("filename").filter(|f| !f.is_empty())?;
            let id = get("id")?.parse().ok()?;
            let (mtime_sec, mtime_nsec) = parse_mtime(get("mtime").unwrap_or("0"))?;
            let endpoints = get("endpoints").filter(|e| !e.is_empty())?;
            BusCommand::FileChanged {
                filename: PathBuf::from(filename),
                id,
                mtime_sec,
                mtime_nsec,
                endpoints: endpoints.to_string(),
            }
        }
        CMD_FILE_DELETED => BusCommand::FileDeleted {
            filename: PathBuf::from(get("filename").filter(|f| !f.is_empty())?),
        },
        CMD_STOP => BusCommand::Stop,
        _ => return None,
    };

    Some(BusEvent { command, secure })
}

/// Unix seconds with optional nanosecond decimals, `sec.nnnnnnnnn`.
fn parse_mtime(value: &str) -> Option<(u64, u64)> {
    match value.split_once('.') {
        Some((sec, nsec)) => {
            // right-pad so "1.5" means 500 ms, not 5 ns
            let mut digits = nsec.to_string();
            digits.truncate(9);
            while digits.len() < 9 {
                digits.push('0');
            }
            Some((sec.parse().ok()?, digits.parse().ok()?))
        }
        None => Some((value.parse().ok()?, 0)),
    }
}

/// Publishing side of the adapter, cheap to clone into the controller.
#[derive(Debug, Clone)]
pub struct BusHandle {
    tx: Option<mpsc::UnboundedSender<BusCommand>>,
}

impl BusHandle {
    /// Handle for a daemon running without a bus: announcements are
    /// dropped with a log line, pulls still work.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, command: BusCommand) {
        match &self.tx {
            Some(tx) => {
                if tx.send(command).is_err() {
                    tracing::warn!("control bus writer is gone; dropping announcement");
                }
            }
            None => {
                tracing::debug!(command = ?command, "no control bus configured; dropping announcement");
            }
        }
    }
}

/// Connect to the bus and pump messages both ways until cancelled.
///
/// Incoming lines that parse land on `incoming`; the returned handle
/// queues outgoing announcements.
pub async fn connect(
    addr: &str,
    incoming: mpsc::UnboundedSender<BusEvent>,
    cancel: CancellationToken,
) -> Result<BusHandle> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to control bus at {addr}"))?;
    tracing::info!(addr, "connected to control bus");

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BusCommand>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outgoing = rx.recv() => {
                    let Some(command) = outgoing else { break };
                    let mut line = command.encode();
                    line.push('\n');
                    if let Err(e) = write_half.write_all(line.as_bytes()).await {
                        tracing::error!(error = %e, "control bus write failed");
                        break;
                    }
                }
                incoming_line = lines.next_line() => {
                    match incoming_line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse(&line) {
                                if incoming.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::warn!("control bus closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "control bus read failed");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(BusHandle { tx: Some(tx) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_changed_round_trips() {
        let command = BusCommand::FileChanged {
            filename: PathBuf::from("/data/foo"),
            id: 0x1234_5678,
            mtime_sec: 1_699_999_999,
            mtime_nsec: 42,
            endpoints: "rfs://10.0.0.1:4044,rfss://10.0.0.1:4045".into(),
        };
        let line = command.encode();
        let event = parse(&line).expect("parse");
        assert_eq!(event.command, command);
        assert!(!event.secure);
    }

    #[test]
    fn file_deleted_round_trips() {
        let command = BusCommand::FileDeleted {
            filename: PathBuf::from("/data/foo"),
        };
        let event = parse(&command.encode()).expect("parse");
        assert_eq!(event.command, command);
    }

    #[test]
    fn secure_flag_is_read() {
        let line = "RFS_FILE_CHANGED filename=/data/foo;id=7;mtime=12.5;endpoints=rfss://h:4045;secure=true";
        let event = parse(line).expect("parse");
        assert!(event.secure);
        match event.command {
            BusCommand::FileChanged {
                mtime_sec,
                mtime_nsec,
                ..
            } => {
                assert_eq!(mtime_sec, 12);
                assert_eq!(mtime_nsec, 500_000_000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_commands_are_ignored() {
        assert!(parse("RFS_PING serial=1").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn missing_parameters_fail_the_parse() {
        assert!(parse("RFS_FILE_CHANGED id=7;endpoints=rfs://h:1").is_none());
        assert!(parse("RFS_FILE_CHANGED filename=/f;id=x;endpoints=rfs://h:1").is_none());
        assert!(parse("RFS_FILE_DELETED").is_none());
    }

    #[test]
    fn stop_parses_bare() {
        let event = parse("RFS_STOP").expect("parse");
        assert_eq!(event.command, BusCommand::Stop);
    }
}
