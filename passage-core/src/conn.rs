//! Logged connection wrapper and byte-stream joining.
//!
//! Every connection the tunnel system touches is wrapped in [`Logged`], which
//! attaches a short random id and a display name so log lines from both ends
//! of a proxied connection can be correlated.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

/// Alphabet for short random identifiers (connection tags, hostnames).
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A short random identifier of `n` characters drawn from `[a-z0-9]`.
pub fn rand_id(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// A cryptographically random identifier of `nbytes` bytes, hex-encoded.
/// Used for client ids, which double as reconnect credentials.
pub fn secure_rand_id(nbytes: usize) -> String {
    let mut buf = vec![0u8; nbytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Object-safe bound for the byte streams the tunnel system moves around.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for T {}

/// A byte stream carrying an identity for logging and an optional peer
/// address.
///
/// Mux streams have no network-level peer; proxied connections get their
/// peer injected from the `StartProxy` message or the public listener.
pub struct Logged {
    stream: Box<dyn StreamConn>,
    id: String,
    name: String,
    peer: Option<String>,
}

impl Logged {
    /// Wrap a stream, tagging it with a fresh 4-char id and the given label.
    pub fn wrap<S>(stream: S, label: &str) -> Self
    where
        S: StreamConn + 'static,
    {
        let id = rand_id(4);
        let name = format!("{label}:{id}");
        debug!(conn = %name, "new connection");
        Logged {
            stream: Box::new(stream),
            id,
            name,
            peer: None,
        }
    }

    /// Append a tag to the connection's display name.
    pub fn add_tag(&mut self, tag: &str) {
        self.name = format!("{}:{}", self.name, tag);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The remote party's address, when one is known.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn set_peer(&mut self, peer: impl Into<String>) {
        self.peer = Some(peer.into());
    }
}

impl fmt::Debug for Logged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logged")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for Logged {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Logged {
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

/// Copy bytes between `a` and `b` in both directions until both sides have
/// terminated, then close both endpoints.
///
/// Returns `(bytes copied into a, bytes copied out of a)`. A mid-copy I/O
/// error is logged and reported as zero counts; the endpoints are dropped
/// (and therefore closed) on every path.
pub async fn join(mut a: Logged, mut b: Logged) -> (u64, u64) {
    debug!(a = %a.name, b = %b.name, "joining connections");
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((a_to_b, b_to_a)) => {
            debug!(a = %a.name, b = %b.name, a_to_b, b_to_a, "joined connections closed");
            (b_to_a, a_to_b)
        }
        Err(err) => {
            warn!(a = %a.name, b = %b.name, %err, "join failed");
            (0, 0)
        }
    }
}
