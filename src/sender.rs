//! Data-channel listener: answers pull requests by streaming files out.
//!
//! One accepted connection carries exactly one transfer. The session
//! reads the pull request, resolves the transfer id against the shared
//! registry, then writes header, names, body chunks and footer in strict
//! order, feeding the body through the checksum stream as it goes.

use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::Credentials;
use crate::digest::Murmur3Stream;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    read_frame, DataFooter, DataHeader, FileRequest, HeaderNames, CHUNK_LEN, REQUEST_LEN,
};
use crate::registry::SharedFiles;
use crate::users;

/// Build a TLS acceptor from PEM certificate and private key files.
pub fn tls_acceptor(certificate: &Path, private_key: &Path) -> Result<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_pem = std::fs::read(certificate)
        .with_context(|| format!("cannot read certificate {}", certificate.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .context("certificate file is not valid PEM")?;

    let key_pem = std::fs::read(private_key)
        .with_context(|| format!("cannot read private key {}", private_key.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("private key file is not valid PEM")?
        .context("no private key found in PEM file")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("cannot build TLS server configuration")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept loop for one listening socket, plain or TLS.
///
/// Runs until cancelled; in-flight sessions are aborted on shutdown.
/// The registry stays on the loop thread, so sessions are spawned onto
/// the local task set and `serve` itself must run inside one.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    files: Rc<SharedFiles>,
    credentials: Option<Credentials>,
    cancel: CancellationToken,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed on data listener");
                        continue;
                    }
                };
                let files = files.clone();
                let credentials = credentials.clone();
                let acceptor = acceptor.clone();
                sessions.spawn_local(async move {
                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => run_session(tls, peer, files, credentials).await,
                            Err(e) => Err(SessionError::Io(e)),
                        },
                        None => run_session(stream, peer, files, credentials).await,
                    };
                    if let Err(e) = result {
                        tracing::error!(peer = %peer, error = %e, "send session failed");
                    }
                });
            }
            // reap finished sessions so the set does not grow without bound
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
    sessions.shutdown().await;
}

/// Serve exactly one pull request on an established connection.
pub async fn run_session<S>(
    mut stream: S,
    peer: SocketAddr,
    files: Rc<SharedFiles>,
    credentials: Option<Credentials>,
) -> SessionResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw: [u8; REQUEST_LEN] = read_frame(&mut stream, "file request").await?;
    let request = FileRequest::decode(&raw)?;

    let shared = files
        .get(request.id)
        .ok_or(SessionError::UnknownId(request.id))?;
    tracing::debug!(peer = %peer, id = request.id, filename = %shared.filename.display(), "pull request");

    // open and stat fresh; the registry snapshot may predate the request
    let mut file = tokio::fs::File::open(&shared.filename).await?;
    let meta = file.metadata().await?;

    if meta.len() > u64::from(u32::MAX) {
        return Err(SessionError::BadLength {
            field: "size",
            len: meta.len() as usize,
        });
    }
    let size = meta.len() as u32;

    let username = users::user_name(meta.uid()).ok_or(SessionError::NameLookup {
        kind: "uid",
        id: meta.uid(),
        filename: shared.filename.display().to_string(),
    })?;
    let groupname = users::group_name(meta.gid()).ok_or(SessionError::NameLookup {
        kind: "gid",
        id: meta.gid(),
        filename: shared.filename.display().to_string(),
    })?;

    let names = HeaderNames {
        username,
        groupname,
        login: credentials
            .as_ref()
            .map(|c| c.login.clone().into_bytes())
            .unwrap_or_default(),
        password: credentials
            .map(|c| c.password.into_bytes())
            .unwrap_or_default(),
    };
    let names_buf = names.encode()?;
    let (username_len, groupname_len, login_len, password_len) = names.lengths();

    let header = DataHeader {
        id: request.id,
        mtime_sec: meta.mtime().max(0) as u64,
        mtime_nsec: meta.mtime_nsec().max(0) as u64,
        size,
        mode: (meta.mode() & 0o7777) as u16,
        username_len,
        groupname_len,
        login_len,
        password_len,
    };

    stream.write_all(&header.encode()).await?;
    stream.write_all(&names_buf).await?;

    let mut digest = Murmur3Stream::for_transfer();
    let mut remaining = u64::from(size);
    let mut buf = [0u8; CHUNK_LEN];
    while remaining > 0 {
        let want = remaining.min(CHUNK_LEN as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while streaming",
            )));
        }
        digest.update(&buf[..n]);
        stream.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    let footer = DataFooter {
        digest: digest.finalize(),
    };
    stream.write_all(&footer.encode()).await?;
    stream.flush().await?;

    tracing::info!(
        peer = %peer,
        filename = %shared.filename.display(),
        id = request.id,
        size,
        "file sent"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FOOTER_LEN, HEADER_LEN};
    use tempfile::TempDir;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().expect("socket addr")
    }

    async fn read_exact_vec<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.expect("read");
        buf
    }

    #[tokio::test]
    async fn session_streams_header_body_and_footer() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("payload.bin");
        let contents: Vec<u8> = (0u32..10_000).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &contents).expect("write payload");

        let files = Rc::new(SharedFiles::new());
        let shared = files.offer(&path).expect("offer");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let client_side = async {
            client
                .write_all(&FileRequest { id: shared.id }.encode())
                .await
                .expect("send request");

            let header_raw = read_exact_vec(&mut client, HEADER_LEN).await;
            let header =
                DataHeader::decode(header_raw.as_slice().try_into().expect("header size"))
                    .expect("header");
            assert_eq!(header.id, shared.id);
            assert_eq!(header.size as usize, contents.len());
            assert_eq!(header.login_len, 0);

            let names_raw = read_exact_vec(&mut client, header.names_len()).await;
            let names = HeaderNames::decode(&header, &names_raw).expect("names");
            assert!(!names.username.is_empty());
            assert!(!names.groupname.is_empty());

            let body = read_exact_vec(&mut client, header.size as usize).await;
            assert_eq!(body, contents);

            let footer_raw = read_exact_vec(&mut client, FOOTER_LEN).await;
            let footer =
                DataFooter::decode(footer_raw.as_slice().try_into().expect("footer size"))
                    .expect("footer");
            let mut digest = Murmur3Stream::for_transfer();
            digest.update(&contents);
            assert_eq!(footer.digest, digest.finalize());
        };

        let (session, ()) = tokio::join!(run_session(server, peer(), files, None), client_side);
        session.expect("session");
    }

    #[tokio::test]
    async fn session_carries_configured_credentials() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").expect("write");

        let files = Rc::new(SharedFiles::new());
        let shared = files.offer(&path).expect("offer");

        let credentials = Credentials {
            login: "cluster".into(),
            password: "s3cret".into(),
        };
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let client_side = async {
            client
                .write_all(&FileRequest { id: shared.id }.encode())
                .await
                .expect("send request");

            let header_raw = read_exact_vec(&mut client, HEADER_LEN).await;
            let header =
                DataHeader::decode(header_raw.as_slice().try_into().expect("header size"))
                    .expect("header");
            assert_eq!(header.login_len, 7);
            assert_eq!(header.password_len, 6);

            let names_raw = read_exact_vec(&mut client, header.names_len()).await;
            let names = HeaderNames::decode(&header, &names_raw).expect("names");
            assert_eq!(names.login, b"cluster");
            assert_eq!(names.password, b"s3cret");

            // drain the rest so the session can finish
            let _ = read_exact_vec(&mut client, header.size as usize + FOOTER_LEN).await;
        };

        let (session, ()) = tokio::join!(
            run_session(server, peer(), files, Some(credentials)),
            client_side
        );
        session.expect("session");
    }

    #[tokio::test]
    async fn unknown_id_fails_the_session() {
        let files = Rc::new(SharedFiles::new());
        let (mut client, server) = tokio::io::duplex(1024);

        let client_side = async {
            client
                .write_all(&FileRequest { id: 0xDEAD_BEEF }.encode())
                .await
                .expect("send request");
        };

        let (session, ()) = tokio::join!(run_session(server, peer(), files, None), client_side);
        let err = session.expect_err("session must fail");
        assert!(matches!(err, SessionError::UnknownId(0xDEAD_BEEF)));
    }

    #[tokio::test]
    async fn bad_request_magic_fails_the_session() {
        let files = Rc::new(SharedFiles::new());
        let (mut client, server) = tokio::io::duplex(1024);

        let client_side = async {
            client.write_all(b"NOPE\0\0\0\0").await.expect("send junk");
        };

        let (session, ()) = tokio::join!(run_session(server, peer(), files, None), client_side);
        let err = session.expect_err("session must fail");
        assert!(matches!(err, SessionError::BadMagic { .. }));
    }
}
