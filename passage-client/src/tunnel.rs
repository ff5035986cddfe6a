//! A bound public endpoint, accepting connections forwarded by the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use passage_core::Logged;

use crate::error::Error;
use crate::raw::RawSession;
use crate::session::{self, TunnelMap};

/// A listener for connections arriving at a public endpoint bound on the
/// tunnel server.
///
/// Works like a network listener whose `accept` yields connections from a
/// remote machine. Dropping a `Tunnel` without calling [`Tunnel::close`]
/// leaves the server-side bind in place until the session ends.
pub struct Tunnel {
    url: String,
    protocol: String,
    accept_rx: Mutex<mpsc::Receiver<Logged>>,
    closed: Arc<AtomicBool>,
    raw: Arc<RawSession>,
    tunnels: Arc<TunnelMap>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Tunnel {
    pub(crate) fn new(
        url: String,
        protocol: String,
        accept_rx: mpsc::Receiver<Logged>,
        closed: Arc<AtomicBool>,
        raw: Arc<RawSession>,
        tunnels: Arc<TunnelMap>,
    ) -> Tunnel {
        Tunnel {
            url,
            protocol,
            accept_rx: Mutex::new(accept_rx),
            closed,
            raw,
            tunnels,
        }
    }

    /// The public URL this tunnel is reachable at.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The tunneled protocol: "http", "https", "tcp" or "tls".
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Wait for the next connection made to the public endpoint. The
    /// connection's peer address is the public remote's.
    pub async fn accept(&self) -> Result<Logged, Error> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::TunnelClosed)
    }

    /// Unbind the endpoint on the server and close the tunnel. Idempotent:
    /// a second call returns [`Error::AlreadyClosed`] without side effects.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        info!(url = %self.url, "closing tunnel");
        session::unlisten(&self.raw, &self.tunnels, &self.url).await
    }
}
