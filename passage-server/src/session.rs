//! Server-side session: one authenticated client and its tunnels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use passage_core::codec::{read_msg, read_msg_as, write_msg};
use passage_core::proto::{Auth, AuthResp, Bind, BindResp, Message, StartProxy, Unbind, UnbindResp, VERSION};
use passage_core::{secure_rand_id, Logged, MuxSession};

use crate::binder::Binders;
use crate::guard::ShutdownGuard;
use crate::hooks::{SessionHooks, TunnelHooks};
use crate::registry::SessionRegistry;
use crate::tunnel::Tunnel;

/// An authenticated control relationship with one client.
///
/// The first stream of a session must carry the auth exchange; every later
/// client-initiated stream carries a single bind or unbind round trip.
/// Proxy streams flow the other way, opened by [`Session::open_proxy`].
pub struct Session {
    auth: StdMutex<Option<Auth>>,
    start: Instant,
    mux: Arc<dyn MuxSession>,
    tunnels: DashMap<String, Arc<Tunnel>>,
    id: StdMutex<String>,
    hooks: Arc<dyn SessionHooks>,
    tunnel_hooks: Arc<dyn TunnelHooks>,
    binders: Arc<Binders>,
    guard: ShutdownGuard,
    registry: Arc<SessionRegistry>,
    shutting_down: AtomicBool,
}

impl Session {
    pub fn new(
        mux: Arc<dyn MuxSession>,
        registry: Arc<SessionRegistry>,
        hooks: Arc<dyn SessionHooks>,
        tunnel_hooks: Arc<dyn TunnelHooks>,
        binders: Arc<Binders>,
    ) -> Arc<Session> {
        Arc::new(Session {
            auth: StdMutex::new(None),
            start: Instant::now(),
            mux,
            tunnels: DashMap::new(),
            id: StdMutex::new(String::new()),
            hooks,
            tunnel_hooks,
            binders,
            guard: ShutdownGuard::new(),
            registry,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// The client id, empty until authentication and cleared when this
    /// instance is displaced by a reconnect.
    pub fn id(&self) -> String {
        self.id.lock().unwrap().clone()
    }

    pub(crate) fn clear_id(&self) {
        self.id.lock().unwrap().clear();
    }

    /// The auth message this session presented, once authenticated.
    pub fn auth(&self) -> Option<Auth> {
        self.auth.lock().unwrap().clone()
    }

    /// When the session was accepted.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Number of tunnels currently bound on this session.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Drive the session: authenticate, then serve streams until the mux
    /// dies or a protocol error occurs.
    pub async fn run(self: Arc<Self>) {
        if let Err(err) = self.handle_auth().await {
            warn!(%err, "session authentication failed");
            self.shutdown().await;
            return;
        }

        loop {
            match self.mux.accept().await {
                Ok(stream) => {
                    let session = self.clone();
                    tokio::spawn(async move { session.handle_stream(stream).await });
                }
                Err(err) => {
                    debug!(%err, "session transport closed");
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Accept the auth stream, negotiate and register.
    async fn handle_auth(self: &Arc<Self>) -> Result<()> {
        let mut stream = self.mux.accept().await.context("failed to accept auth stream")?;
        stream.add_tag("auth");

        let auth: Auth = read_msg_as(&mut stream)
            .await
            .context("failed to read auth message")?;

        let id = if auth.client_id.is_empty() {
            secure_rand_id(16)
        } else {
            auth.client_id.clone()
        };
        *self.id.lock().unwrap() = id.clone();
        *self.auth.lock().unwrap() = Some(auth.clone());

        // take our place in the registry; an older instance of this client
        // id is displaced and shut down
        self.registry.register(self.clone());

        if !auth.version.iter().any(|v| v == VERSION) {
            return self
                .fail_auth(
                    &mut stream,
                    format!(
                        "No acceptable protocol version. Requested: {:?}, capable: {VERSION}",
                        auth.version
                    ),
                )
                .await;
        }

        if let Err(err) = self.hooks.on_auth(self, &auth).await {
            return self.fail_auth(&mut stream, err.to_string()).await;
        }

        write_msg(
            &mut stream,
            AuthResp {
                version: VERSION.to_owned(),
                client_id: id.clone(),
                error: String::new(),
                extra: Value::Null,
            },
        )
        .await
        .context("failed to write auth response")?;

        info!(client_id = %id, "session authenticated");
        Ok(())
    }

    async fn fail_auth(&self, stream: &mut Logged, message: String) -> Result<()> {
        let _ = write_msg(
            stream,
            AuthResp {
                error: message.clone(),
                ..Default::default()
            },
        )
        .await;
        anyhow::bail!(message)
    }

    /// One client-initiated stream: a single bind or unbind round trip.
    async fn handle_stream(self: Arc<Self>, mut stream: Logged) {
        let _permit = match self.guard.enter().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("rejecting stream, session is shutting down");
                return;
            }
        };

        // a fatal error shuts the whole session down; spawned so the
        // shutdown does not wait on our own guard permit
        let fatal = |session: Arc<Session>| {
            tokio::spawn(async move { session.shutdown().await });
        };

        match read_msg(&mut stream).await {
            Ok(Message::Bind(bind)) => {
                if let Err(err) = self.handle_bind(&mut stream, bind).await {
                    error!(%err, "bind stream failed");
                    fatal(self.clone());
                }
            }
            Ok(Message::Unbind(unbind)) => {
                if let Err(err) = self.handle_unbind(&mut stream, unbind).await {
                    error!(%err, "unbind stream failed");
                    fatal(self.clone());
                }
            }
            Ok(other) => {
                error!(kind = other.kind(), "unexpected message kind on stream");
                fatal(self.clone());
            }
            Err(err) => {
                error!(%err, "failed to read message from stream");
                fatal(self.clone());
            }
        }
    }

    async fn handle_bind(self: &Arc<Self>, stream: &mut Logged, bind: Bind) -> Result<()> {
        debug!(protocol = %bind.protocol, "binding new tunnel");

        if let Err(err) = self.hooks.on_bind(self, &bind).await {
            write_msg(
                stream,
                BindResp {
                    protocol: bind.protocol,
                    error: err.to_string(),
                    ..Default::default()
                },
            )
            .await?;
            return Ok(());
        }

        let resp = match Tunnel::bind(&bind, self, &self.binders, self.tunnel_hooks.clone()).await {
            Ok(tunnel) => {
                let url = tunnel.url().to_owned();
                self.tunnels.insert(url.clone(), tunnel);
                info!(%url, client_id = %self.id(), "registered new tunnel");
                BindResp {
                    url,
                    protocol: bind.protocol,
                    ..Default::default()
                }
            }
            Err(err) => BindResp {
                protocol: bind.protocol,
                error: err.to_string(),
                ..Default::default()
            },
        };

        write_msg(stream, resp).await?;
        Ok(())
    }

    async fn handle_unbind(self: &Arc<Self>, stream: &mut Logged, unbind: Unbind) -> Result<()> {
        debug!(url = %unbind.url, "unbinding tunnel");

        let resp = match self.tunnels.remove(&unbind.url) {
            Some((_, tunnel)) => match tunnel.shutdown().await {
                Ok(()) => UnbindResp::default(),
                Err(err) => UnbindResp {
                    error: err.to_string(),
                    ..Default::default()
                },
            },
            None => UnbindResp {
                error: format!("no tunnel found for {}", unbind.url),
                ..Default::default()
            },
        };

        write_msg(stream, resp).await?;
        Ok(())
    }

    /// Open a proxy stream to the client for a public connection arriving at
    /// `url` from `client_addr`.
    pub(crate) async fn open_proxy(&self, client_addr: &str, url: &str) -> Result<Logged> {
        let mut stream = self.mux.open().await.context("failed to open proxy stream")?;
        stream.add_tag("proxy");
        stream.add_tag(url);

        write_msg(
            &mut stream,
            StartProxy {
                url: url.to_owned(),
                client_addr: client_addr.to_owned(),
            },
        )
        .await?;
        Ok(stream)
    }

    /// Tear the session down: quiesce stream handlers, shut every tunnel,
    /// deregister, close the transport. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client_id = %self.id(), "session shutting down");

        self.guard.begin_shutdown().await;

        if let Err(err) = self.hooks.on_close(self).await {
            error!(%err, "on_close hook failed, aborting shutdown");
            self.guard.complete_shutdown().await;
            return;
        }

        let tunnels: Vec<Arc<Tunnel>> = {
            let urls: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
            urls.into_iter()
                .filter_map(|url| self.tunnels.remove(&url).map(|(_, t)| t))
                .collect()
        };
        for tunnel in tunnels {
            if let Err(err) = tunnel.shutdown().await {
                warn!(url = %tunnel.url(), %err, "tunnel shutdown failed");
            }
        }

        self.registry.unregister(self);
        let _ = self.mux.close().await;
        self.guard.complete_shutdown().await;

        info!(client_id = %self.id(), "session shutdown complete");
    }
}
