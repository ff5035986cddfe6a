//! Resilient session: reconnects, re-authenticates and re-binds after
//! transport failure.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use passage_core::MuxSession;

use crate::error::Error;
use crate::raw::RawSession;
use crate::session::{Session, TunnelMap};

/// Initial reconnect backoff.
const START_WAIT: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const MAX_WAIT: Duration = Duration::from_secs(30);

/// Establishes new mux sessions toward the tunnel server. Injected so the
/// transport (TCP, TLS, proxied) stays out of this crate.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<Arc<dyn MuxSession>>;
}

/// A [`Session`] that survives transport failures.
///
/// When the receive loop's accept fails, the session dials the server again
/// with exponential backoff, re-authenticates under its existing id, and
/// re-binds every tunnel with the options pinned at first listen, so
/// existing [`crate::Tunnel`] objects keep delivering connections.
/// Application-level rejections (auth or re-bind) are permanent and reported
/// through [`ReconnectingSession::wait`].
pub struct ReconnectingSession {
    session: Session,
    done: Mutex<mpsc::Receiver<Error>>,
}

impl std::fmt::Debug for ReconnectingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSession").finish()
    }
}

impl ReconnectingSession {
    /// Dial the server and authenticate with `auth_extra`; the initial
    /// connection attempt completes (or fails permanently) before this
    /// returns.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        auth_extra: Value,
    ) -> Result<ReconnectingSession, Error> {
        let raw = Arc::new(RawSession::new(None));
        let tunnels: Arc<TunnelMap> = Arc::new(DashMap::new());
        let (done_tx, done_rx) = mpsc::channel(1);

        let reconnector = Arc::new(Reconnector {
            raw: raw.clone(),
            tunnels: tunnels.clone(),
            dialer,
            auth_extra,
            done: done_tx,
        });

        reconnector.reconnect().await?;

        let session = Session::with_parts(raw, tunnels, Some(reconnector));
        Ok(ReconnectingSession {
            session,
            done: Mutex::new(done_rx),
        })
    }

    /// Block until the session fails permanently and return the failure.
    pub async fn wait(&self) -> Error {
        self.done
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Error::SessionClosed)
    }
}

impl std::ops::Deref for ReconnectingSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

/// The reconnect algorithm, shared between the constructor and the receive
/// loop's failure path.
pub(crate) struct Reconnector {
    raw: Arc<RawSession>,
    tunnels: Arc<TunnelMap>,
    dialer: Arc<dyn Dialer>,
    auth_extra: Value,
    done: mpsc::Sender<Error>,
}

impl Reconnector {
    /// Dial until a session is authenticated and every tunnel is re-bound.
    /// Transport failures retry forever with backoff; an `Error` field in an
    /// auth or bind response is permanent.
    pub(crate) async fn reconnect(&self) -> Result<(), Error> {
        let mut wait = START_WAIT;

        'retry: loop {
            let mux = match self.dialer.dial().await {
                Ok(mux) => mux,
                Err(err) => {
                    backoff(&mut wait, &format!("dial failed: {err}")).await;
                    continue;
                }
            };
            self.raw.install_mux(mux).await;

            let resp = match self.raw.auth(&self.raw.id(), self.auth_extra.clone()).await {
                Ok(resp) => resp,
                Err(err) => {
                    backoff(&mut wait, &format!("auth failed: {err}")).await;
                    continue;
                }
            };
            if !resp.error.is_empty() {
                return self.fail(resp.error).await;
            }
            info!(client_id = %resp.client_id, "session re-established");

            // Re-establish every bind against the new transport. The options
            // were pinned at first listen, so the server hands back the same
            // public addresses.
            let binds: Vec<(String, String, Value, Value)> = self
                .tunnels
                .iter()
                .map(|e| {
                    (
                        e.key().clone(),
                        e.protocol.clone(),
                        e.opts.clone(),
                        e.extra.clone(),
                    )
                })
                .collect();

            for (url, protocol, opts, extra) in binds {
                let resp = match self.raw.listen(&protocol, opts, extra).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        backoff(&mut wait, &format!("re-bind of {url} failed: {err}")).await;
                        continue 'retry;
                    }
                };
                if !resp.error.is_empty() {
                    return self.fail(resp.error).await;
                }
            }

            return Ok(());
        }
    }

    /// Report a permanent failure on the done channel and return it.
    async fn fail(&self, error: String) -> Result<(), Error> {
        let _ = self.done.send(Error::Rejected(error.clone())).await;
        Err(Error::Rejected(error))
    }
}

async fn backoff(wait: &mut Duration, reason: &str) {
    warn!(wait_secs = wait.as_secs(), "{reason}, waiting before reconnecting");
    tokio::time::sleep(*wait).await;
    *wait = (*wait * 2).min(MAX_WAIT);
}
