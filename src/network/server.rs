//! One TCP listener per instrument.

use super::session::{ConnectionSession, SessionSettings};
use crate::error::{AppResult, EmulatorError};
use crate::instrument::Instrument;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// How long `stop` waits for the accept loop. Must exceed [`SESSION_DRAIN_TIMEOUT`].
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period for open sessions before they are aborted.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Open sessions, decremented when a session task ends for any reason.
struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running listener serving one [`Instrument`].
#[derive(Debug)]
pub struct InstrumentServer {
    instrument: Arc<Instrument>,
    local_addr: SocketAddr,
    started_at: Instant,
    clients: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl InstrumentServer {
    /// Binds `host:<instrument port>` and starts accepting connections.
    pub async fn start(
        instrument: Arc<Instrument>,
        host: &str,
        settings: SessionSettings,
    ) -> AppResult<Self> {
        let addr = resolve(host, instrument.port()).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EmulatorError::Bind {
                instrument: instrument.name().to_string(),
                addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(
            instrument = %instrument.id(),
            addr = %local_addr,
            "Listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let clients = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(accept_loop(
            listener,
            instrument.clone(),
            settings,
            clients.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            instrument,
            local_addr,
            started_at: Instant::now(),
            clients,
            shutdown_tx,
            task,
        })
    }

    /// The instrument being served.
    #[must_use]
    pub fn instrument(&self) -> &Arc<Instrument> {
        &self.instrument
    }

    /// Address actually bound (resolves port `0`).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Time since the listener was bound.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Sessions currently open.
    #[must_use]
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Closes the listener and every open session.
    pub async fn stop(self) -> AppResult<()> {
        let _ = self.shutdown_tx.send(true);
        let id = self.instrument.id().to_string();
        match timeout(SHUTDOWN_TIMEOUT, self.task).await {
            Ok(Ok(())) => {
                info!(instrument = %id, "Stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(instrument = %id, error = %e, "Server task failed");
                Err(EmulatorError::Io(std::io::Error::other(e.to_string())))
            }
            Err(_) => {
                warn!(instrument = %id, "Shutdown timed out");
                Err(EmulatorError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("server for '{id}' did not stop in time"),
                )))
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        EmulatorError::Configuration(format!("host '{host}' did not resolve to an address"))
    })
}

async fn accept_loop(
    listener: TcpListener,
    instrument: Arc<Instrument>,
    settings: SessionSettings,
    clients: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let session = ConnectionSession::new(peer, instrument.clone(), settings.clone());
                    let guard = ClientGuard::new(&clients);
                    let session_shutdown = shutdown_rx.clone();
                    sessions.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = session.run(stream, session_shutdown).await {
                            warn!(peer = %peer, error = %e, "Session ended with error");
                        }
                    });
                }
                Err(e) => error!(instrument = %instrument.id(), error = %e, "Accept error"),
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!(instrument = %instrument.id(), error = %e, "Session task panicked");
                }
            }
        }
    }

    // Listener closes here so the port can be rebound right away.
    drop(listener);

    let drain = async { while sessions.join_next().await.is_some() {} };
    if timeout(SESSION_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(instrument = %instrument.id(), "Aborting sessions that did not stop");
        sessions.abort_all();
    }
}
