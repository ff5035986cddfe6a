//! High-level client session: typed tunnels over a raw session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use passage_core::codec::read_msg_as;
use passage_core::proto::{HttpOptions, StartProxy, TcpOptions, TlsOptions};
use passage_core::{Logged, MuxSession};

use crate::error::Error;
use crate::raw::RawSession;
use crate::reconnect::Reconnector;
use crate::tunnel::Tunnel;

/// Server-side registration state for one tunnel, kept so the session can
/// dispatch proxy streams and a reconnect can re-bind.
pub(crate) struct TunnelEntry {
    pub(crate) tx: mpsc::Sender<Logged>,
    pub(crate) protocol: String,
    /// Bind options after reconnect-stability rewriting.
    pub(crate) opts: Value,
    pub(crate) extra: Value,
    pub(crate) closed: Arc<AtomicBool>,
}

pub(crate) type TunnelMap = DashMap<String, TunnelEntry>;

/// A client session on which tunnels can be listened.
///
/// Listening a tunnel returns a [`Tunnel`] from which new public
/// connections are accepted. A background task dispatches server-initiated
/// proxy streams to the right tunnel by URL.
pub struct Session {
    raw: Arc<RawSession>,
    tunnels: Arc<TunnelMap>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish()
    }
}

impl Session {
    /// Create a session over an established mux and start its receive loop.
    pub fn new(mux: Arc<dyn MuxSession>) -> Session {
        let raw = Arc::new(RawSession::new(Some(mux)));
        Session::with_parts(raw, Arc::new(DashMap::new()), None)
    }

    pub(crate) fn with_parts(
        raw: Arc<RawSession>,
        tunnels: Arc<TunnelMap>,
        recovery: Option<Arc<Reconnector>>,
    ) -> Session {
        tokio::spawn(receive(raw.clone(), tunnels.clone(), recovery));
        Session { raw, tunnels }
    }

    /// Authenticate with the tunnel server. `id` is empty for new sessions;
    /// `extra` carries application data such as credentials.
    pub async fn auth(&self, id: &str, extra: Value) -> Result<(), Error> {
        let resp = self.raw.auth(id, extra).await?;
        if !resp.error.is_empty() {
            return Err(Error::Rejected(resp.error));
        }
        Ok(())
    }

    /// The server-assigned session id, empty before the first auth.
    pub fn id(&self) -> String {
        self.raw.id()
    }

    /// Negotiate a new remote listen for `protocol` with protocol-specific
    /// options. Applications typically prefer [`Session::listen_http`] and
    /// friends.
    pub async fn listen(
        &self,
        protocol: &str,
        opts: Value,
        extra: Value,
    ) -> Result<Tunnel, Error> {
        let resp = self
            .raw
            .listen(protocol, opts.clone(), extra.clone())
            .await?;
        if !resp.error.is_empty() {
            return Err(Error::Rejected(resp.error));
        }

        // If the server assigned a random hostname or port, fold it back into
        // the options so a re-bind after reconnect requests the same address.
        let opts = rewrite_opts(protocol, opts, &resp.url)?;

        let (tx, rx) = mpsc::channel(1);
        let closed = Arc::new(AtomicBool::new(false));
        self.tunnels.insert(
            resp.url.clone(),
            TunnelEntry {
                tx,
                protocol: protocol.to_owned(),
                opts,
                extra,
                closed: closed.clone(),
            },
        );
        debug!(url = %resp.url, protocol, "tunnel registered");

        Ok(Tunnel::new(
            resp.url,
            protocol.to_owned(),
            rx,
            closed,
            self.raw.clone(),
            self.tunnels.clone(),
        ))
    }

    /// Listen a new HTTP endpoint.
    pub async fn listen_http(&self, opts: HttpOptions, extra: Value) -> Result<Tunnel, Error> {
        self.listen("http", serde_json::to_value(&opts)?, extra).await
    }

    /// Listen a new HTTPS endpoint.
    pub async fn listen_https(&self, opts: HttpOptions, extra: Value) -> Result<Tunnel, Error> {
        self.listen("https", serde_json::to_value(&opts)?, extra).await
    }

    /// Listen a new TCP endpoint.
    pub async fn listen_tcp(&self, opts: TcpOptions, extra: Value) -> Result<Tunnel, Error> {
        self.listen("tcp", serde_json::to_value(&opts)?, extra).await
    }

    /// Listen a new TLS endpoint.
    pub async fn listen_tls(&self, opts: TlsOptions, extra: Value) -> Result<Tunnel, Error> {
        self.listen("tls", serde_json::to_value(&opts)?, extra).await
    }

    /// Listen HTTP and HTTPS endpoints sharing one hostname.
    ///
    /// The first bind pins down any randomly assigned hostname, so the
    /// second bind is deterministic.
    pub async fn listen_http_and_https(
        &self,
        opts: HttpOptions,
        extra: Value,
    ) -> Result<(Tunnel, Tunnel), Error> {
        let http = self
            .listen("http", serde_json::to_value(&opts)?, extra.clone())
            .await?;
        let rewritten = self
            .tunnels
            .get(http.url())
            .map(|e| e.opts.clone())
            .unwrap_or(Value::Null);
        match self.listen("https", rewritten, extra).await {
            Ok(https) => Ok((http, https)),
            Err(err) => {
                let _ = http.close().await;
                Err(err)
            }
        }
    }

    /// Close the underlying transport, failing all tunnels.
    pub async fn close(&self) {
        self.raw.close().await;
    }
}

/// Remove a tunnel from the session and release it on the server.
pub(crate) async fn unlisten(
    raw: &RawSession,
    tunnels: &TunnelMap,
    url: &str,
) -> Result<(), Error> {
    tunnels.remove(url);
    let resp = raw.unlisten(url).await?;
    if !resp.error.is_empty() {
        error!(url, error = %resp.error, "server failed to unlisten tunnel");
        return Err(Error::Rejected(resp.error));
    }
    Ok(())
}

/// Background loop dispatching server-initiated proxy streams to tunnels.
async fn receive(
    raw: Arc<RawSession>,
    tunnels: Arc<TunnelMap>,
    recovery: Option<Arc<Reconnector>>,
) {
    loop {
        match raw.accept().await {
            Ok(stream) => {
                let tunnels = tunnels.clone();
                tokio::spawn(handle_proxy(stream, tunnels));
            }
            Err(err) => {
                let Some(recovery) = recovery.as_ref() else {
                    warn!(%err, "session accept failed");
                    break;
                };
                debug!(%err, "session accept failed, reconnecting");
                if let Err(err) = recovery.reconnect().await {
                    error!(%err, "session failed permanently");
                    break;
                }
            }
        }
    }

    // Tear down every tunnel: dropping the senders wakes pending accepts.
    let urls: Vec<String> = tunnels.iter().map(|e| e.key().clone()).collect();
    for url in urls {
        if let Some((_, entry)) = tunnels.remove(&url) {
            entry.closed.store(true, Ordering::SeqCst);
        }
    }
}

async fn handle_proxy(mut stream: Logged, tunnels: Arc<TunnelMap>) {
    let start = match read_msg_as::<_, StartProxy>(&mut stream).await {
        Ok(start) => start,
        Err(err) => {
            warn!(%err, "bad proxy stream preamble");
            return;
        }
    };
    stream.set_peer(&start.client_addr);
    stream.add_tag(&start.url);

    let tx = tunnels.get(&start.url).map(|e| e.tx.clone());
    match tx {
        Some(tx) => {
            if tx.send(stream).await.is_err() {
                debug!(url = %start.url, "tunnel closed, dropping proxy connection");
            }
        }
        // the tunnel may have just been unbound; discard the stream
        None => warn!(url = %start.url, "no tunnel for proxy connection"),
    }
}

/// Pin randomly assigned addresses into the bind options so that re-binding
/// after a reconnect requests the same public address.
fn rewrite_opts(protocol: &str, opts: Value, url: &str) -> Result<Value, Error> {
    match protocol {
        "http" | "https" => {
            let mut parsed: HttpOptions = passage_core::proto::unpack_field(&opts)?;
            if parsed.hostname.is_empty() && parsed.subdomain.is_empty() {
                parsed.hostname = host_part(url).to_owned();
                return Ok(serde_json::to_value(&parsed)?);
            }
            Ok(opts)
        }
        "tcp" => {
            let mut parsed: TcpOptions = passage_core::proto::unpack_field(&opts)?;
            if parsed.remote_port == 0 {
                let port = url
                    .rsplit(':')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(|| {
                        Error::Rejected(format!("server returned unparseable url {url}"))
                    })?;
                parsed.remote_port = port;
                return Ok(serde_json::to_value(&parsed)?);
            }
            Ok(opts)
        }
        _ => Ok(opts),
    }
}

/// Everything after the scheme separator: `http://a.example.com` →
/// `a.example.com`.
fn host_part(url: &str) -> &str {
    match url.split_once("://") {
        Some((_, host)) => host,
        None => url,
    }
}
