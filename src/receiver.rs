//! Outbound pull session: fetch one announced file and publish it atomically.
//!
//! The session connects to an advertised endpoint, requests the transfer
//! id it was told about, and writes the body into a temp file on the same
//! filesystem as the destination. Only after the footer digest checks out
//! are ownership, mode and mtime applied and the temp file renamed over
//! the destination. On every failure path the temp file is unlinked and
//! the destination stays untouched.

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::Credentials;
use crate::digest::Murmur3Stream;
use crate::error::{SessionError, SessionResult};
use crate::privs::Privileges;
use crate::protocol::{
    read_frame, read_names, DataFooter, DataHeader, Endpoint, FileRequest, CHUNK_LEN, FOOTER_LEN,
    HEADER_LEN, NAMES_BUF_LEN,
};
use crate::users;

/// Build a TLS connector trusting the cluster certificate.
///
/// Peers across a cluster share one certificate, so the same PEM file
/// that backs the local rfss listener doubles as the trust anchor for
/// outbound rfss connections.
pub fn tls_connector(trusted_certificate: &Path) -> Result<TlsConnector> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pem = std::fs::read(trusted_certificate).with_context(|| {
        format!(
            "cannot read trusted certificate {}",
            trusted_certificate.display()
        )
    })?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.context("trusted certificate file is not valid PEM")?;
        roots
            .add(cert)
            .context("cannot add certificate to the trust store")?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Unlinks the temp file on drop unless the transfer was published.
struct TempGuard {
    path: PathBuf,
    disarmed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            disarmed: false,
        }
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "cannot remove temp file of failed transfer"
                );
            }
        }
    }
}

/// Everything needed to pull one announced file.
#[derive(Clone)]
pub struct ReceiveSession {
    pub target: PathBuf,
    pub id: u32,
    pub temp_dir: PathBuf,
    pub endpoint: Endpoint,
    pub expected: Option<Credentials>,
    pub connector: Option<TlsConnector>,
}

impl ReceiveSession {
    /// Connect to the peer and run the transfer to completion.
    pub async fn run(self, counter: &AtomicU64) -> SessionResult<()> {
        let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;

        if self.endpoint.secure {
            let connector = self.connector.clone().ok_or_else(|| {
                SessionError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "secure endpoint selected but no TLS trust configured",
                ))
            })?;
            let name = server_name(&self.endpoint.host)?;
            let stream = connector.connect(name, stream).await?;
            self.run_on_stream(stream, counter).await
        } else {
            self.run_on_stream(stream, counter).await
        }
    }

    /// Transfer state machine over an established connection.
    pub async fn run_on_stream<S>(&self, mut stream: S, counter: &AtomicU64) -> SessionResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&FileRequest { id: self.id }.encode())
            .await?;
        stream.flush().await?;

        let raw: [u8; HEADER_LEN] = read_frame(&mut stream, "data header").await?;
        let header = DataHeader::decode(&raw)?;
        if header.id != self.id {
            return Err(SessionError::IdMismatch {
                expected: self.id,
                got: header.id,
            });
        }

        let mut names_buf = [0u8; NAMES_BUF_LEN];
        let names_len = header.names_len();
        read_names(&mut stream, &mut names_buf, names_len).await?;
        let names = crate::protocol::HeaderNames::decode(&header, &names_buf[..names_len])?;

        if let Some(expected) = &self.expected {
            if names.login != expected.login.as_bytes()
                || names.password != expected.password.as_bytes()
            {
                // discarded silently on the wire, logged locally
                tracing::error!(
                    filename = %self.target.display(),
                    "peer presented wrong credentials; dropping transfer"
                );
                return Err(SessionError::Credentials);
            }
        }

        let basename = self.target.file_name().ok_or_else(|| {
            SessionError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "target filename has no basename",
            ))
        })?;
        let seq = counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .temp_dir
            .join(format!("{}-{seq}.tmp", basename.to_string_lossy()));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        let mut guard = TempGuard::new(temp_path.clone());

        let mut digest = Murmur3Stream::for_transfer();
        let mut remaining = u64::from(header.size);
        let mut buf = [0u8; CHUNK_LEN];
        while remaining > 0 {
            let want = remaining.min(CHUNK_LEN as u64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(SessionError::TruncatedFrame("file body"));
            }
            digest.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        drop(file);

        let raw: [u8; FOOTER_LEN] = read_frame(&mut stream, "data footer").await?;
        let footer = DataFooter::decode(&raw)?;
        if footer.digest != digest.finalize() {
            return Err(SessionError::ChecksumMismatch {
                filename: self.target.display().to_string(),
            });
        }

        self.publish(&temp_path, &header, &names)?;
        guard.disarm();

        tracing::info!(
            filename = %self.target.display(),
            id = self.id,
            size = header.size,
            peer = %self.endpoint,
            "file received"
        );
        Ok(())
    }

    /// Apply metadata and rename into place.
    ///
    /// Ownership, mode and mtime are each best-effort: a failure is
    /// logged and the file is published with whatever attributes took.
    /// The rename itself must succeed.
    fn publish(
        &self,
        temp_path: &Path,
        header: &DataHeader,
        names: &crate::protocol::HeaderNames,
    ) -> SessionResult<()> {
        let _privs = Privileges::elevate();

        if let Err(e) = users::apply_owner(temp_path, &names.username, &names.groupname) {
            tracing::warn!(
                filename = %self.target.display(),
                user = %names.username,
                group = %names.groupname,
                error = %e,
                "cannot apply ownership to received file"
            );
        }
        if let Err(e) = users::apply_mode(temp_path, u32::from(header.mode)) {
            tracing::warn!(
                filename = %self.target.display(),
                mode = format!("{:o}", header.mode),
                error = %e,
                "cannot apply mode to received file"
            );
        }
        if let Err(e) = users::apply_mtime(temp_path, header.mtime_sec, header.mtime_nsec) {
            tracing::warn!(
                filename = %self.target.display(),
                error = %e,
                "cannot apply mtime to received file"
            );
        }

        std::fs::rename(temp_path, &self.target)?;
        Ok(())
    }
}

fn server_name(host: &str) -> SessionResult<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|_| {
        SessionError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{host:?} is not a valid TLS server name"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HeaderNames;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn session(target: &Path, temp_dir: &Path, id: u32) -> ReceiveSession {
        ReceiveSession {
            target: target.to_path_buf(),
            id,
            temp_dir: temp_dir.to_path_buf(),
            endpoint: Endpoint::parse("rfs://127.0.0.1:4044").expect("endpoint"),
            expected: None,
            connector: None,
        }
    }

    struct Transfer {
        header: DataHeader,
        names: HeaderNames,
        body: Vec<u8>,
        digest: [u8; 16],
    }

    fn transfer(id: u32, body: &[u8]) -> Transfer {
        let names = HeaderNames {
            username: users::user_name(unsafe { libc::getuid() }).expect("own user name"),
            groupname: users::group_name(unsafe { libc::getgid() }).expect("own group name"),
            login: Vec::new(),
            password: Vec::new(),
        };
        let (username_len, groupname_len, login_len, password_len) = names.lengths();
        let header = DataHeader {
            id,
            mtime_sec: 1_650_000_000,
            mtime_nsec: 987_654_321,
            size: body.len() as u32,
            mode: 0o640,
            username_len,
            groupname_len,
            login_len,
            password_len,
        };
        let mut digest = Murmur3Stream::for_transfer();
        digest.update(body);
        Transfer {
            header,
            names,
            body: body.to_vec(),
            digest: digest.finalize(),
        }
    }

    async fn play_sender<S>(mut stream: S, transfer: Transfer, corrupt_body: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw: [u8; crate::protocol::REQUEST_LEN] =
            read_frame(&mut stream, "request").await.expect("request");
        let request = FileRequest::decode(&raw).expect("request frame");
        assert_eq!(request.id, transfer.header.id);

        // writes are best-effort: a receiver that failed early has
        // already dropped its end of the stream
        let _ = stream.write_all(&transfer.header.encode()).await;
        let _ = stream
            .write_all(&transfer.names.encode().expect("names"))
            .await;

        let mut body = transfer.body.clone();
        if corrupt_body {
            if let Some(byte) = body.first_mut() {
                *byte ^= 0xFF;
            }
        }
        let _ = stream.write_all(&body).await;
        let _ = stream
            .write_all(
                &DataFooter {
                    digest: transfer.digest,
                }
                .encode(),
            )
            .await;
        let _ = stream.flush().await;
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .expect("read temp dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "tmp"))
            .collect()
    }

    #[tokio::test]
    async fn happy_path_publishes_content_mode_and_mtime() {
        let dest = TempDir::new().expect("dest dir");
        let tmp = TempDir::new().expect("temp dir");
        let target = dest.path().join("foo");

        let contents: Vec<u8> = (0u32..12 * 1024).map(|i| (i % 251) as u8).collect();
        let t = transfer(0x0101_0101, &contents);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = tokio::spawn(play_sender(server, t, false));

        let counter = AtomicU64::new(1);
        session(&target, tmp.path(), 0x0101_0101)
            .run_on_stream(client, &counter)
            .await
            .expect("receive session");
        sender.await.expect("sender task");

        let published = std::fs::read(&target).expect("published file");
        assert_eq!(published, contents);

        let meta = std::fs::metadata(&target).expect("stat");
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_650_000_000);
        assert_eq!(meta.mtime_nsec(), 987_654_321);
        assert!(temp_files(tmp.path()).is_empty(), "temp file must be gone");
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_temp_and_leaves_target_alone() {
        let dest = TempDir::new().expect("dest dir");
        let tmp = TempDir::new().expect("temp dir");
        let target = dest.path().join("foo");
        std::fs::write(&target, b"previous generation").expect("seed target");

        let t = transfer(7, b"fresh contents");
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = tokio::spawn(play_sender(server, t, true));

        let counter = AtomicU64::new(1);
        let err = session(&target, tmp.path(), 7)
            .run_on_stream(client, &counter)
            .await
            .expect_err("corrupted body must fail");
        sender.await.expect("sender task");

        assert!(matches!(err, SessionError::ChecksumMismatch { .. }));
        assert_eq!(
            std::fs::read(&target).expect("target intact"),
            b"previous generation"
        );
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn id_mismatch_terminates_before_any_file_io() {
        let dest = TempDir::new().expect("dest dir");
        let tmp = TempDir::new().expect("temp dir");
        let target = dest.path().join("foo");

        let t = transfer(0xAAAA_0000, b"body");
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            // sender answers with a different id than requested
            let mut stream = server;
            let _: [u8; crate::protocol::REQUEST_LEN] =
                read_frame(&mut stream, "request").await.expect("request");
            stream
                .write_all(&t.header.encode())
                .await
                .expect("header");
        });

        let counter = AtomicU64::new(1);
        let err = session(&target, tmp.path(), 0xBBBB_0000)
            .run_on_stream(client, &counter)
            .await
            .expect_err("id mismatch must fail");

        assert!(matches!(
            err,
            SessionError::IdMismatch {
                expected: 0xBBBB_0000,
                got: 0xAAAA_0000
            }
        ));
        assert!(!target.exists());
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn credential_mismatch_fails_the_session() {
        let dest = TempDir::new().expect("dest dir");
        let tmp = TempDir::new().expect("temp dir");
        let target = dest.path().join("foo");

        let mut t = transfer(9, b"body");
        t.names.login = b"intruder".to_vec();
        t.names.password = b"wrong".to_vec();
        let (username_len, groupname_len, login_len, password_len) = t.names.lengths();
        t.header.username_len = username_len;
        t.header.groupname_len = groupname_len;
        t.header.login_len = login_len;
        t.header.password_len = password_len;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let sender = tokio::spawn(play_sender(server, t, false));

        let mut s = session(&target, tmp.path(), 9);
        s.expected = Some(Credentials {
            login: "cluster".into(),
            password: "s3cret".into(),
        });

        let counter = AtomicU64::new(1);
        let err = s
            .run_on_stream(client, &counter)
            .await
            .expect_err("wrong credentials must fail");
        sender.await.expect("sender task");

        assert!(matches!(err, SessionError::Credentials));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn empty_file_transfers_cleanly() {
        let dest = TempDir::new().expect("dest dir");
        let tmp = TempDir::new().expect("temp dir");
        let target = dest.path().join("empty");

        let t = transfer(3, b"");
        let (client, server) = tokio::io::duplex(4096);
        let sender = tokio::spawn(play_sender(server, t, false));

        let counter = AtomicU64::new(1);
        session(&target, tmp.path(), 3)
            .run_on_stream(client, &counter)
            .await
            .expect("receive session");
        sender.await.expect("sender task");

        assert_eq!(std::fs::metadata(&target).expect("stat").len(), 0);
    }
}
