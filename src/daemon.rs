//! Runtime lifecycle: wire the subsystems together, run until a stop
//! order or signal, then shut everything down.

use anyhow::{Context, Result};
use std::rc::Rc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{self, BusCommand, BusHandle};
use crate::config::Settings;
use crate::controller::Controller;
use crate::paths::PathRegistry;
use crate::protocol::Endpoint;
use crate::quiesce;
use crate::registry::SharedFiles;
use crate::{receiver, sender, watcher};

/// Run the daemon until shutdown. Everything multiplexes onto the one
/// cooperative runtime the binary starts; the registries are owned here,
/// never leave the loop thread, and are handed out by reference.
pub async fn run(settings: Settings) -> Result<()> {
    // send sessions borrow the shared-file registry, so they and their
    // accept loops live on a local task set
    let local = LocalSet::new();
    local.run_until(run_inner(settings)).await
}

async fn run_inner(settings: Settings) -> Result<()> {
    let paths = Rc::new(PathRegistry::load(&settings.watch_dirs)?);
    let files = Rc::new(SharedFiles::new());
    let cancel = CancellationToken::new();

    // TLS material is read synchronously at startup; a broken
    // certificate should fail the daemon, not the first session
    let (acceptor, connector) = match (&settings.certificate, &settings.private_key) {
        (Some(cert), Some(key)) => (
            Some(sender::tls_acceptor(cert, key)?),
            Some(receiver::tls_connector(cert)?),
        ),
        _ => (None, None),
    };

    let listener = bind(&settings.listen).await?;
    tracing::info!(listen = %settings.listen, "data channel listening");
    tokio::task::spawn_local(sender::serve(
        listener,
        None,
        files.clone(),
        settings.credentials.clone(),
        cancel.child_token(),
    ));

    if let Some(secure) = &settings.secure_listen {
        let listener = bind(secure).await?;
        tracing::info!(listen = %secure, "secure data channel listening");
        tokio::task::spawn_local(sender::serve(
            listener,
            acceptor,
            files.clone(),
            settings.credentials.clone(),
            cancel.child_token(),
        ));
    }

    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();
    let bus = match &settings.bus {
        Some(addr) => bus::connect(addr, bus_tx, cancel.child_token()).await?,
        None => {
            tracing::warn!("no control bus configured; running in serve-only mode");
            BusHandle::disconnected()
        }
    };

    let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
    let _watcher = watcher::spawn(&paths, watch_tx)?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut controller = Controller::new(
        paths.clone(),
        files.clone(),
        &settings,
        connector,
        bus,
        done_tx,
    );

    spawn_signal_handler(cancel.clone())?;

    let mut ticker = tokio::time::interval(quiesce::TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = watch_rx.recv() => controller.handle_file_event(event),
            Some(event) = bus_rx.recv() => {
                if event.command == BusCommand::Stop {
                    tracing::info!("stop order received from the control bus");
                    break;
                }
                controller.handle_bus_event(event);
            }
            Some(path) = done_rx.recv() => controller.file_received(&path),
            _ = ticker.tick() => controller.tick(Instant::now()),
        }
    }

    tracing::info!("stopping rfsd service");
    cancel.cancel();
    Ok(())
}

async fn bind(endpoint: &Endpoint) -> Result<TcpListener> {
    TcpListener::bind((endpoint.host.as_str(), endpoint.port))
        .await
        .with_context(|| {
            format!(
                "cannot bind data listener to {endpoint} - \
                 is another rfsd instance running?"
            )
        })
}

fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    tracing::error!("failed to listen for Ctrl+C");
                    return;
                }
                tracing::info!("interrupt received - initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("termination signal received - initiating graceful shutdown");
            }
        }
        cancel.cancel();
    });
    Ok(())
}
