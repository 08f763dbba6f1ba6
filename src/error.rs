//! Session-level error taxonomy.
//!
//! A `SessionError` terminates exactly one transfer session; it never
//! propagates past the task running that session. Configuration problems
//! at startup use `anyhow` instead and abort the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Frame began with the wrong 4-byte sentinel.
    #[error("bad frame magic: expected {expected:?}, got {got:?}")]
    BadMagic { expected: [u8; 4], got: [u8; 4] },

    /// A declared name or credential length is outside its valid range.
    #[error("bad length for {field}: {len}")]
    BadLength { field: &'static str, len: usize },

    /// The peer closed the connection mid-frame.
    #[error("truncated frame while reading {0}")]
    TruncatedFrame(&'static str),

    /// Header carried a transfer id other than the one requested.
    #[error("file id mismatch: expected {expected:#010x}, received {got:#010x}")]
    IdMismatch { expected: u32, got: u32 },

    /// The requested transfer id is not in the shared-file registry.
    #[error("unknown transfer id {0:#010x}")]
    UnknownId(u32),

    /// Body digest did not match the footer digest.
    #[error("checksum mismatch for {filename}")]
    ChecksumMismatch { filename: String },

    /// The sender could not resolve the file owner or group to a name.
    #[error("cannot resolve {kind} {id} to a name for {filename}")]
    NameLookup {
        kind: &'static str,
        id: u32,
        filename: String,
    },

    /// Received credentials did not match the configured ones.
    #[error("credential mismatch")]
    Credentials,

    /// Read or write failure on the socket or the local filesystem.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
