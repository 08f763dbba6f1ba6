//! Wire frames for the data channel.
//!
//! All multi-byte integers are little-endian. Each frame starts with a
//! 4-byte sentinel; the header's fixed part is padded to an 8-byte
//! boundary and followed by length-prefixed variable fields (username,
//! group name, optional login and password) read in one bounded pass.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{SessionError, SessionResult};

pub const REQUEST_MAGIC: [u8; 4] = *b"FILE";
pub const DATA_MAGIC: [u8; 4] = *b"DATA";
pub const END_MAGIC: [u8; 4] = *b"END!";

pub const REQUEST_LEN: usize = 8;
pub const HEADER_LEN: usize = 40;
pub const FOOTER_LEN: usize = 20;

/// Fixed-size socket buffer for body streaming, both directions.
pub const CHUNK_LEN: usize = 4096;
/// Upper bound on the concatenated variable fields (4 × 255 plus slack).
pub const NAMES_BUF_LEN: usize = 1024;

/// Default data-server port.
pub const DEFAULT_PORT: u16 = 4044;

pub const SCHEME_PLAIN: &str = "rfs";
pub const SCHEME_SECURE: &str = "rfss";

/// Pull request sent by the receiving side right after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequest {
    pub id: u32,
}

impl FileRequest {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[..4].copy_from_slice(&REQUEST_MAGIC);
        buf[4..].copy_from_slice(&self.id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_LEN]) -> SessionResult<Self> {
        check_magic(&buf[..4], REQUEST_MAGIC)?;
        let id = u32::from_le_bytes(buf[4..8].try_into().expect("4-byte id"));
        Ok(Self { id })
    }
}

/// Transfer metadata preceding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub id: u32,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub size: u32,
    pub mode: u16,
    pub username_len: u8,
    pub groupname_len: u8,
    pub login_len: u8,
    pub password_len: u8,
}

impl DataHeader {
    /// Byte count of the variable area following the fixed header.
    pub fn names_len(&self) -> usize {
        usize::from(self.username_len)
            + usize::from(self.groupname_len)
            + usize::from(self.login_len)
            + usize::from(self.password_len)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(&DATA_MAGIC);
        buf.put_u32_le(self.id);
        buf.put_u64_le(self.mtime_sec);
        buf.put_u64_le(self.mtime_nsec);
        buf.put_u32_le(self.size);
        buf.put_u16_le(self.mode);
        buf.put_u8(self.username_len);
        buf.put_u8(self.groupname_len);
        buf.put_u8(self.login_len);
        buf.put_u8(self.password_len);
        buf.put_bytes(0, 6);
        debug_assert_eq!(buf.len(), HEADER_LEN);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> SessionResult<Self> {
        check_magic(&buf[..4], DATA_MAGIC)?;
        let mut rest = &buf[4..];
        Ok(Self {
            id: rest.get_u32_le(),
            mtime_sec: rest.get_u64_le(),
            mtime_nsec: rest.get_u64_le(),
            size: rest.get_u32_le(),
            mode: rest.get_u16_le(),
            username_len: rest.get_u8(),
            groupname_len: rest.get_u8(),
            login_len: rest.get_u8(),
            password_len: rest.get_u8(),
        })
    }
}

/// Checksum and end sentinel closing a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFooter {
    pub digest: [u8; 16],
}

impl DataFooter {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        buf[..16].copy_from_slice(&self.digest);
        buf[16..].copy_from_slice(&END_MAGIC);
        buf
    }

    pub fn decode(buf: &[u8; FOOTER_LEN]) -> SessionResult<Self> {
        check_magic(&buf[16..], END_MAGIC)?;
        let digest = buf[..16].try_into().expect("16-byte digest");
        Ok(Self { digest })
    }
}

/// Variable fields following the fixed header, in declared order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderNames {
    pub username: String,
    pub groupname: String,
    pub login: Vec<u8>,
    pub password: Vec<u8>,
}

impl HeaderNames {
    /// Serialize back-to-back, validating the sender-side length rules:
    /// user and group names must be 1–255 bytes, credentials 0–255.
    pub fn encode(&self) -> SessionResult<BytesMut> {
        check_name_len("username", self.username.len())?;
        check_name_len("groupname", self.groupname.len())?;
        check_credential_len("login", self.login.len())?;
        check_credential_len("password", self.password.len())?;

        let mut buf = BytesMut::with_capacity(
            self.username.len() + self.groupname.len() + self.login.len() + self.password.len(),
        );
        buf.put_slice(self.username.as_bytes());
        buf.put_slice(self.groupname.as_bytes());
        buf.put_slice(&self.login);
        buf.put_slice(&self.password);
        Ok(buf)
    }

    /// Split a received variable area using the header's declared lengths.
    pub fn decode(header: &DataHeader, buf: &[u8]) -> SessionResult<Self> {
        if buf.len() != header.names_len() {
            return Err(SessionError::BadLength {
                field: "names area",
                len: buf.len(),
            });
        }
        let (user, rest) = buf.split_at(usize::from(header.username_len));
        let (group, rest) = rest.split_at(usize::from(header.groupname_len));
        let (login, password) = rest.split_at(usize::from(header.login_len));
        Ok(Self {
            username: String::from_utf8_lossy(user).into_owned(),
            groupname: String::from_utf8_lossy(group).into_owned(),
            login: login.to_vec(),
            password: password.to_vec(),
        })
    }

    pub fn lengths(&self) -> (u8, u8, u8, u8) {
        (
            self.username.len() as u8,
            self.groupname.len() as u8,
            self.login.len() as u8,
            self.password.len() as u8,
        )
    }
}

/// A peer data endpoint as advertised in announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `rfs://host:port` or `rfss://host:port`.
    pub fn parse(uri: &str) -> Option<Self> {
        let (secure, rest) = if let Some(rest) = uri.strip_prefix("rfss://") {
            (true, rest)
        } else if let Some(rest) = uri.strip_prefix("rfs://") {
            (false, rest)
        } else {
            return None;
        };

        // bracketed IPv6 form: [addr]:port
        let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            (host, tail.strip_prefix(':'))
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };
        if host.is_empty() {
            return None;
        }
        let port = match port {
            Some(p) => p.parse().ok()?,
            None => DEFAULT_PORT,
        };
        Some(Self {
            secure,
            host: host.to_string(),
            port,
        })
    }

    /// Parse a comma-separated endpoint list, dropping malformed entries.
    pub fn parse_list(csv: &str) -> Vec<Self> {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(Self::parse)
            .collect()
    }

    pub fn uri(&self) -> String {
        let scheme = if self.secure { SCHEME_SECURE } else { SCHEME_PLAIN };
        if self.host.contains(':') {
            format!("{scheme}://[{}]:{}", self.host, self.port)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Read a fixed-size frame, turning EOF-mid-frame into `TruncatedFrame`.
pub async fn read_frame<const N: usize, R>(
    stream: &mut R,
    what: &'static str,
) -> SessionResult<[u8; N]>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SessionError::TruncatedFrame(what)
        } else {
            SessionError::Io(e)
        }
    })?;
    Ok(buf)
}

/// Read exactly `len` bytes of the variable name area into `buf`.
pub async fn read_names<R>(stream: &mut R, buf: &mut [u8], len: usize) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
{
    debug_assert!(len <= buf.len());
    stream.read_exact(&mut buf[..len]).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SessionError::TruncatedFrame("names")
        } else {
            SessionError::Io(e)
        }
    })?;
    Ok(())
}

fn check_magic(got: &[u8], expected: [u8; 4]) -> SessionResult<()> {
    if got != expected {
        return Err(SessionError::BadMagic {
            expected,
            got: got.try_into().expect("4-byte magic"),
        });
    }
    Ok(())
}

fn check_name_len(field: &'static str, len: usize) -> SessionResult<()> {
    if len == 0 || len > 255 {
        return Err(SessionError::BadLength { field, len });
    }
    Ok(())
}

fn check_credential_len(field: &'static str, len: usize) -> SessionResult<()> {
    if len > 255 {
        return Err(SessionError::BadLength { field, len });
    }
    Ok(())
}
