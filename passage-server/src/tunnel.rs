//! Server-side tunnel: a public endpoint bound to one session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use passage_core::join;
use passage_core::proto::Bind;
use passage_core::Logged;

use crate::binder::{BindError, Binders, Bound, PublicListener};
use crate::hooks::TunnelHooks;
use crate::session::Session;

/// A single binding of a virtual host or port over a tunneling session.
///
/// Public connections accepted on its listener are each bridged to a fresh
/// proxy stream on the owning session.
pub struct Tunnel {
    req: Bind,
    url: String,
    start: Instant,
    sess: Weak<Session>,
    hooks: Arc<dyn TunnelHooks>,
    closing: AtomicBool,
    stop: Notify,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Create a tunnel from a bind request: look up the binder for the
    /// requested protocol, bind the public endpoint, and start the accept
    /// loop.
    pub(crate) async fn bind(
        req: &Bind,
        sess: &Arc<Session>,
        binders: &Binders,
        hooks: Arc<dyn TunnelHooks>,
    ) -> Result<Arc<Tunnel>, BindError> {
        let binder = binders
            .get(&req.protocol)
            .ok_or_else(|| BindError::UnknownProtocol(req.protocol.clone()))?;

        let Bound { listener, url } = binder.bind(&req.options).await?;

        let tunnel = Arc::new(Tunnel {
            req: req.clone(),
            url,
            start: Instant::now(),
            sess: Arc::downgrade(sess),
            hooks: hooks.clone(),
            closing: AtomicBool::new(false),
            stop: Notify::new(),
            accept_task: StdMutex::new(None),
        });

        let task = tokio::spawn(tunnel.clone().accept_loop(listener));
        *tunnel.accept_task.lock().unwrap() = Some(task);

        if let Err(err) = hooks.on_tunnel_open(&tunnel).await {
            let _ = tunnel.shutdown().await;
            return Err(BindError::Hook(err));
        }

        Ok(tunnel)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> &str {
        &self.req.protocol
    }

    /// The bind request that opened this tunnel.
    pub fn bind_request(&self) -> &Bind {
        &self.req
    }

    /// When the tunnel was bound.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Accept public connections until the tunnel shuts down. Owns the
    /// listener: when the loop exits, the port or hostname is released.
    async fn accept_loop(self: Arc<Self>, mut listener: Box<dyn PublicListener>) {
        info!(url = %self.url, "listening for public connections");
        loop {
            tokio::select! {
                _ = self.stop.notified() => return,
                conn = listener.accept() => match conn {
                    Some(conn) => {
                        let tunnel = self.clone();
                        tokio::spawn(async move { tunnel.handle_public(conn).await });
                    }
                    None => {
                        if self.closing.load(Ordering::SeqCst) {
                            return;
                        }
                        // a dead listener means the tunnel can no longer be
                        // served; take the whole session down
                        error!(url = %self.url, "public listener failed");
                        if let Some(sess) = self.sess.upgrade() {
                            tokio::spawn(async move { sess.shutdown().await });
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Bridge one public connection to a fresh proxy stream.
    async fn handle_public(self: Arc<Self>, conn: Logged) {
        let peer = conn.peer().unwrap_or("unknown").to_owned();
        info!(url = %self.url, %peer, "new public connection");

        if let Err(err) = self.hooks.on_connection_open(&self, &conn).await {
            error!(%err, "on_connection_open hook rejected connection");
            return;
        }

        let started = Instant::now();
        let Some(sess) = self.sess.upgrade() else {
            debug!(url = %self.url, "session gone, dropping public connection");
            return;
        };
        let proxy = match sess.open_proxy(&peer, &self.url).await {
            Ok(proxy) => proxy,
            Err(err) => {
                error!(%err, "failed to open proxy stream");
                return;
            }
        };

        let (bytes_in, bytes_out) = join(conn, proxy).await;

        if let Err(err) = self
            .hooks
            .on_connection_close(&self, started.elapsed(), bytes_in, bytes_out)
            .await
        {
            error!(%err, "on_connection_close hook failed");
        }
    }

    /// Stop accepting, release the public endpoint, and run the close hook.
    /// The listener is gone by the time this returns. A second call returns
    /// an error without side effects.
    pub(crate) async fn shutdown(&self) -> anyhow::Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            anyhow::bail!("already shutting down");
        }
        info!(url = %self.url, "tunnel shutting down");

        self.stop.notify_one();
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.hooks.on_tunnel_close(self).await?;
        info!(url = %self.url, "tunnel shutdown complete");
        Ok(())
    }
}
