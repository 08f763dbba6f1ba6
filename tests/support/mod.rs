#![allow(dead_code)]

//! Shared fixtures for the transfer integration tests.

use rfsd::config::Credentials;
use rfsd::protocol::Endpoint;
use rfsd::registry::SharedFiles;
use std::rc::Rc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Start a plain data listener on an ephemeral port, serving `files`.
///
/// The registry stays on the loop thread, so the accept loop is spawned
/// locally; call this from inside a `LocalSet`.
pub async fn start_sender(
    files: Rc<SharedFiles>,
    credentials: Option<Credentials>,
) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let port = listener.local_addr().expect("local addr").port();
    let cancel = CancellationToken::new();
    tokio::task::spawn_local(rfsd::sender::serve(
        listener,
        None,
        files,
        credentials,
        cancel.clone(),
    ));
    (port, cancel)
}

pub fn plain_endpoint(port: u16) -> Endpoint {
    Endpoint::parse(&format!("rfs://127.0.0.1:{port}")).expect("loopback endpoint")
}

pub fn secure_endpoint(port: u16) -> Endpoint {
    Endpoint::parse(&format!("rfss://localhost:{port}")).expect("loopback TLS endpoint")
}
