//! Virtual-host demultiplexer.
//!
//! A single low-level listener serves many logical endpoints: each accepted
//! connection is peeked just enough to identify its virtual host (the HTTP
//! `Host` header, or the SNI of a TLS ClientHello) and routed to the
//! per-hostname sub-listener registered for it. The peeked bytes are
//! replayed to whoever consumes the connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use passage_core::conn::StreamConn;

/// Cap on the bytes peeked while hunting for the request head terminator.
const MAX_HTTP_HEAD: usize = 8192;
/// Cap on a TLS record carrying a ClientHello.
const MAX_TLS_RECORD: usize = 16384 + 2048;
/// Per-hostname backlog of routed but not yet accepted connections.
const ROUTE_BACKLOG: usize = 8;

/// Lowercase and trim a hostname; applied to every name entering the
/// routing table, on both the listen and the peek side.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Failures in virtual-host routing.
#[derive(Debug, Error)]
pub enum VhostError {
    #[error("no tunnel found for {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("timed out reading initial bytes")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Returned from [`VhostMux::listen`], never routed to the error stream.
    #[error("hostname {0} is already bound")]
    HostInUse(String),
}

/// A routing failure, paired with the connection it happened on when the
/// connection is still worth answering.
pub struct MuxError {
    pub conn: Option<HttpConn>,
    pub error: VhostError,
}

enum VhostKind {
    /// Route by the HTTP `Host` header.
    Http,
    /// Route by TLS SNI, without terminating TLS.
    Tls,
    /// Route by `<scheme>://<host>`, scheme taken from `X-Forwarded-Proto`.
    /// For servers behind an external TLS-terminating proxy.
    ReverseProxy,
}

/// A connection identified by the muxer: the underlying stream plus the
/// peeked bytes (replayed on read), the virtual host, and, for HTTP kinds,
/// the request headers.
pub struct HttpConn {
    stream: Box<dyn StreamConn>,
    replay: Vec<u8>,
    pos: usize,
    host: String,
    headers: Vec<(String, String)>,
    peer: String,
}

impl HttpConn {
    /// The virtual host this connection addressed.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The remote address of the connecting party.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Case-insensitive request header lookup. Empty for TLS connections.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl AsyncRead for HttpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.replay.len() {
            let n = (self.replay.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.replay[pos..pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for HttpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A per-hostname sub-listener handed out by [`VhostMux::listen`].
pub struct VhostListener {
    host: String,
    rx: mpsc::Receiver<HttpConn>,
}

impl VhostListener {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The next connection routed to this hostname; `None` once the muxer
    /// is gone.
    pub async fn accept(&mut self) -> Option<HttpConn> {
        self.rx.recv().await
    }
}

/// The demultiplexer. Owns the routing table; the low-level accept loop
/// runs as a background task.
pub struct VhostMux {
    routes: DashMap<String, mpsc::Sender<HttpConn>>,
    errors: mpsc::Sender<MuxError>,
    timeout: Duration,
    kind: VhostKind,
    tls: Option<TlsAcceptor>,
}

impl VhostMux {
    /// Route plaintext HTTP connections by their `Host` header.
    pub fn http(listener: TcpListener, timeout: Duration) -> (Arc<Self>, mpsc::Receiver<MuxError>) {
        Self::start(listener, None, VhostKind::Http, timeout)
    }

    /// Terminate TLS with `acceptor`, then route by the `Host` header.
    pub fn https(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<MuxError>) {
        Self::start(listener, Some(acceptor), VhostKind::Http, timeout)
    }

    /// Route TLS connections by SNI without terminating them.
    pub fn tls(listener: TcpListener, timeout: Duration) -> (Arc<Self>, mpsc::Receiver<MuxError>) {
        Self::start(listener, None, VhostKind::Tls, timeout)
    }

    /// Route by `<scheme>://<host>` with the scheme taken from
    /// `X-Forwarded-Proto`, for deployments behind an HTTPS-terminating
    /// proxy.
    pub fn reverse_proxy(
        listener: TcpListener,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<MuxError>) {
        Self::start(listener, None, VhostKind::ReverseProxy, timeout)
    }

    fn start(
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        kind: VhostKind,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<MuxError>) {
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let mux = Arc::new(VhostMux {
            routes: DashMap::new(),
            errors: errors_tx,
            timeout,
            kind,
            tls,
        });
        tokio::spawn(intake(mux.clone(), listener));
        (mux, errors_rx)
    }

    /// Register a sub-listener for `name`. A name is free if it was never
    /// bound or its previous listener is gone.
    pub fn listen(&self, name: &str) -> Result<VhostListener, VhostError> {
        use dashmap::mapref::entry::Entry;

        let name = normalize(name);
        let (tx, rx) = mpsc::channel(ROUTE_BACKLOG);
        match self.routes.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return Err(VhostError::HostInUse(name));
                }
                occupied.insert(tx);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        debug!(host = %name, "vhost registered");
        Ok(VhostListener { host: name, rx })
    }

    async fn route(self: Arc<Self>, stream: Box<dyn StreamConn>, peer: String) {
        let identified = tokio::time::timeout(self.timeout, identify(&self.kind, stream, peer));
        match identified.await {
            Err(_) => self.report(None, VhostError::Timeout).await,
            Ok(Err((conn, error))) => self.report(conn, error).await,
            Ok(Ok((key, conn))) => {
                let key = normalize(&key);
                let tx = self.routes.get(&key).map(|e| e.value().clone());
                match tx {
                    Some(tx) => {
                        if let Err(rejected) = tx.send(conn).await {
                            // the sub-listener is gone; drop the stale route
                            self.routes.remove_if(&key, |_, v| v.is_closed());
                            self.report(Some(rejected.0), VhostError::NotFound(key)).await;
                        }
                    }
                    None => self.report(Some(conn), VhostError::NotFound(key)).await,
                }
            }
        }
    }

    async fn report(&self, conn: Option<HttpConn>, error: VhostError) {
        debug!(%error, "vhost routing failed");
        let _ = self.errors.send(MuxError { conn, error }).await;
    }
}

async fn intake(mux: Arc<VhostMux>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let mux = mux.clone();
                tokio::spawn(async move {
                    let stream: Box<dyn StreamConn> = match mux.tls.clone() {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => Box::new(tls),
                            Err(err) => {
                                debug!(%err, "tls handshake failed");
                                return;
                            }
                        },
                        None => Box::new(stream),
                    };
                    mux.route(stream, peer.to_string()).await;
                });
            }
            Err(err) => warn!(%err, "vhost listener accept failed"),
        }
    }
}

type Identified = (String, HttpConn);
type Unidentified = (Option<HttpConn>, VhostError);

async fn identify(
    kind: &VhostKind,
    stream: Box<dyn StreamConn>,
    peer: String,
) -> Result<Identified, Unidentified> {
    match kind {
        VhostKind::Http | VhostKind::ReverseProxy => {
            let mut conn = read_http_head(stream, peer).await?;
            let host = match conn.header("host") {
                Some(host) => host.to_owned(),
                None => {
                    return Err((
                        Some(conn),
                        VhostError::BadRequest("missing Host header".into()),
                    ))
                }
            };
            conn.host = normalize(&host);
            let key = match kind {
                VhostKind::ReverseProxy => {
                    let scheme = match conn.header("x-forwarded-proto") {
                        Some("https") => "https",
                        _ => "http",
                    };
                    format!("{scheme}://{}", conn.host)
                }
                _ => conn.host.clone(),
            };
            Ok((key, conn))
        }
        VhostKind::Tls => {
            let conn = read_client_hello(stream, peer).await?;
            Ok((conn.host.clone(), conn))
        }
    }
}

/// Read an HTTP request head (through the blank line) and parse its headers.
async fn read_http_head(
    mut stream: Box<dyn StreamConn>,
    peer: String,
) -> Result<HttpConn, Unidentified> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos;
        }
        if buf.len() > MAX_HTTP_HEAD {
            return Err((
                Some(partial(stream, buf, peer)),
                VhostError::BadRequest("request head too large".into()),
            ));
        }
        match stream.read(&mut chunk).await {
            Ok(0) => {
                return Err((
                    Some(partial(stream, buf, peer)),
                    VhostError::BadRequest("connection closed before end of request head".into()),
                ))
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) => return Err((Some(partial(stream, buf, peer)), VhostError::Io(err))),
        }
    };

    let headers = match parse_head(&buf[..head_end]) {
        Ok(headers) => headers,
        Err(msg) => {
            return Err((
                Some(partial(stream, buf, peer)),
                VhostError::BadRequest(msg),
            ))
        }
    };

    Ok(HttpConn {
        stream,
        replay: buf,
        pos: 0,
        host: String::new(),
        headers,
        peer,
    })
}

fn partial(stream: Box<dyn StreamConn>, replay: Vec<u8>, peer: String) -> HttpConn {
    HttpConn {
        stream,
        replay,
        pos: 0,
        host: String::new(),
        headers: Vec::new(),
        peer,
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse request line and headers from a head slice (terminator excluded).
fn parse_head(head: &[u8]) -> Result<Vec<(String, String)>, String> {
    let text = std::str::from_utf8(head).map_err(|_| "request head is not utf-8".to_owned())?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    if request_line.split(' ').filter(|p| !p.is_empty()).count() != 3 {
        return Err(format!("malformed request line: {request_line:?}"));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line: {line:?}"))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(headers)
}

/// Read one TLS record, require it to carry a ClientHello, and extract the
/// SNI. The record bytes are replayed so the client's handshake proceeds
/// untouched.
async fn read_client_hello(
    mut stream: Box<dyn StreamConn>,
    peer: String,
) -> Result<HttpConn, Unidentified> {
    let bad = |stream, replay: Vec<u8>, peer, msg: &str| {
        Err((
            Some(partial(stream, replay, peer)),
            VhostError::BadRequest(msg.to_owned()),
        ))
    };

    let mut header = [0u8; 5];
    if let Err(err) = stream.read_exact(&mut header).await {
        return Err((Some(partial(stream, Vec::new(), peer)), VhostError::Io(err)));
    }
    if header[0] != 0x16 {
        return bad(stream, header.to_vec(), peer, "not a TLS handshake");
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len == 0 || len > MAX_TLS_RECORD {
        return bad(stream, header.to_vec(), peer, "invalid TLS record length");
    }

    let mut body = vec![0u8; len];
    if let Err(err) = stream.read_exact(&mut body).await {
        return Err((
            Some(partial(stream, header.to_vec(), peer)),
            VhostError::Io(err),
        ));
    }

    let mut replay = header.to_vec();
    replay.extend_from_slice(&body);

    match parse_sni(&body) {
        Some(sni) => Ok(HttpConn {
            stream,
            replay,
            pos: 0,
            host: normalize(&sni),
            headers: Vec::new(),
            peer,
        }),
        None => bad(stream, replay, peer, "no server name in ClientHello"),
    }
}

/// Walk a ClientHello handshake message and pull out the server_name
/// extension.
fn parse_sni(mut b: &[u8]) -> Option<String> {
    fn take<'a>(b: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
        if b.len() < n {
            return None;
        }
        let (head, rest) = b.split_at(n);
        *b = rest;
        Some(head)
    }
    fn u8_at(b: &mut &[u8]) -> Option<usize> {
        take(b, 1).map(|s| s[0] as usize)
    }
    fn u16_at(b: &mut &[u8]) -> Option<usize> {
        take(b, 2).map(|s| ((s[0] as usize) << 8) | s[1] as usize)
    }

    if u8_at(&mut b)? != 0x01 {
        return None; // not a ClientHello
    }
    take(&mut b, 3)?; // handshake length
    take(&mut b, 2)?; // client version
    take(&mut b, 32)?; // random
    let session_id = u8_at(&mut b)?;
    take(&mut b, session_id)?;
    let cipher_suites = u16_at(&mut b)?;
    take(&mut b, cipher_suites)?;
    let compression = u8_at(&mut b)?;
    take(&mut b, compression)?;

    let ext_total = u16_at(&mut b)?;
    let mut exts = take(&mut b, ext_total)?;
    while !exts.is_empty() {
        let ext_type = u16_at(&mut exts)?;
        let ext_len = u16_at(&mut exts)?;
        let mut data = take(&mut exts, ext_len)?;
        if ext_type == 0 {
            let list_len = u16_at(&mut data)?;
            let mut list = take(&mut data, list_len)?;
            while !list.is_empty() {
                let name_type = u8_at(&mut list)?;
                let name_len = u16_at(&mut list)?;
                let name = take(&mut list, name_len)?;
                if name_type == 0 {
                    return String::from_utf8(name.to_vec()).ok();
                }
            }
        }
    }
    None
}
