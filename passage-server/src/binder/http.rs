//! HTTP and HTTPS binders over the virtual-host muxer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use passage_core::proto::HttpOptions;
use passage_core::Logged;

use super::{pick_name, unpack_options, BindError, Binder, Bound, PublicListener, MAX_RANDOM_ATTEMPTS};
use crate::vhost::{HttpConn, MuxError, VhostError, VhostListener, VhostMux};

/// Abstracts the hostname registration surface of a [`VhostMux`], so the
/// reverse-proxy variant can rewrite the routing key.
pub trait HostMuxer: Send + Sync {
    fn listen(&self, name: &str) -> Result<VhostListener, VhostError>;
}

impl HostMuxer for VhostMux {
    fn listen(&self, name: &str) -> Result<VhostListener, VhostError> {
        VhostMux::listen(self, name)
    }
}

/// Binds virtual hostnames for one scheme on a shared vhost muxer.
pub struct HttpBinder {
    mux: Arc<dyn HostMuxer>,
    public_base_addr: String,
    proto: String,
}

impl HttpBinder {
    /// Serve plaintext HTTP on `listener` and bind `http` tunnels.
    pub fn http(listener: TcpListener, public_base_addr: &str, mux_timeout: Duration) -> HttpBinder {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "http binder listening");
        }
        let (mux, errors) = VhostMux::http(listener, mux_timeout);
        spawn_error_loop(errors);
        Self::with_muxer(mux, "http", public_base_addr)
    }

    /// Terminate TLS on `listener` with `acceptor` and bind `https` tunnels.
    pub fn https(
        listener: TcpListener,
        public_base_addr: &str,
        mux_timeout: Duration,
        acceptor: TlsAcceptor,
    ) -> HttpBinder {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "https binder listening");
        }
        let (mux, errors) = VhostMux::https(listener, acceptor, mux_timeout);
        spawn_error_loop(errors);
        Self::with_muxer(mux, "https", public_base_addr)
    }

    /// Share an existing muxer; used for the reverse-proxy pairing. The
    /// caller owns the muxer's error loop.
    pub(crate) fn with_muxer(
        mux: Arc<dyn HostMuxer>,
        proto: &str,
        public_base_addr: &str,
    ) -> HttpBinder {
        HttpBinder {
            mux,
            public_base_addr: crate::vhost::normalize(public_base_addr),
            proto: proto.to_owned(),
        }
    }

    pub fn bind_opts(&self, opts: &HttpOptions) -> Result<Bound, BindError> {
        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let (hostname, is_random) =
                pick_name(&opts.hostname, &opts.subdomain, &self.public_base_addr);

            // binding can fail if the hostname is already taken; only a
            // randomly drawn name is worth another attempt
            let inner = match self.mux.listen(&hostname) {
                Ok(inner) => inner,
                Err(VhostError::HostInUse(_)) if is_random => continue,
                Err(err) => return Err(err.into()),
            };

            let url = format!("{}://{hostname}", self.proto);
            let listener: Box<dyn PublicListener> = if opts.auth.is_empty() {
                Box::new(VhostPublic { inner })
            } else {
                Box::new(AuthGate::new(inner, &opts.auth))
            };
            return Ok(Bound { listener, url });
        }
        Err(BindError::RandomExhausted)
    }
}

#[async_trait]
impl Binder for HttpBinder {
    async fn bind(&self, opts: &Value) -> Result<Bound, BindError> {
        let opts: HttpOptions = unpack_options(opts)?;
        self.bind_opts(&opts)
    }
}

fn into_logged(conn: HttpConn) -> Logged {
    let peer = conn.peer().to_owned();
    let host = conn.host().to_owned();
    let mut logged = Logged::wrap(conn, "pub");
    logged.add_tag(&host);
    logged.set_peer(peer);
    logged
}

struct VhostPublic {
    inner: VhostListener,
}

#[async_trait]
impl PublicListener for VhostPublic {
    async fn accept(&mut self) -> Option<Logged> {
        self.inner.accept().await.map(into_logged)
    }
}

const UNAUTHORIZED: &[u8] = b"HTTP/1.0 401 Not Authorized\r\n\
WWW-Authenticate: Basic realm=\"go-tunnel\"\r\n\
Content-Length: 22\r\n\
\r\n\
Authorization required";

/// Gates accepted connections behind HTTP basic auth: a request whose
/// `Authorization` header does not match is answered with 401 and closed,
/// and the next connection is accepted instead.
struct AuthGate {
    inner: VhostListener,
    encoded_auth: String,
}

impl AuthGate {
    fn new(inner: VhostListener, auth: &str) -> AuthGate {
        // pre-encode the expected header value for cheap comparisons
        AuthGate {
            inner,
            encoded_auth: format!("Basic {}", STANDARD.encode(auth)),
        }
    }
}

#[async_trait]
impl PublicListener for AuthGate {
    async fn accept(&mut self) -> Option<Logged> {
        loop {
            let mut conn = self.inner.accept().await?;
            if conn.header("authorization") == Some(self.encoded_auth.as_str()) {
                return Some(into_logged(conn));
            }

            debug!(host = %conn.host(), peer = %conn.peer(), "rejecting unauthenticated request");
            let _ = conn.write_all(UNAUTHORIZED).await;
            let _ = conn.shutdown().await;
        }
    }
}

fn error_response(status: &str, content: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 {status}\r\nContent-Length: {}\r\n\r\n{content}",
        content.len()
    )
    .into_bytes()
}

/// Consume a muxer's error stream, answering each failed connection with a
/// minimal HTTP response. Ends when the muxer is gone.
pub(crate) fn spawn_error_loop(mut errors: mpsc::Receiver<MuxError>) {
    tokio::spawn(async move {
        while let Some(MuxError { conn, error }) = errors.recv().await {
            let body = match &error {
                VhostError::NotFound(host) => {
                    error_response("404 Not Found", &format!("Tunnel {host} not found"))
                }
                VhostError::BadRequest(msg) => {
                    error_response("400 Bad Request", &format!("Bad request: {msg}"))
                }
                other => error_response(
                    "500 Internal Server Error",
                    &format!("Internal Server Error: {other}"),
                ),
            };
            if let Some(mut conn) = conn {
                let _ = conn.write_all(&body).await;
                let _ = conn.shutdown().await;
            }
        }
    });
}
