//! Contract for the stream-multiplexed transport.
//!
//! The byte-level multiplexer is an external collaborator: anything that can
//! open streams, accept streams, and close the whole session will do. The
//! [`memory`] module provides an in-process implementation over
//! [`tokio::io::duplex`] pairs, used by the test suites and by embedders'
//! smoke tests.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::conn::Logged;

/// One multiplexed transport session between a client and a server.
///
/// Streams are reliable, ordered byte pipes. Either side may open streams;
/// `accept` yields streams the peer opened. Closing the session fails all
/// subsequent operations on both ends.
#[async_trait]
pub trait MuxSession: Send + Sync {
    /// Open a new stream to the peer.
    async fn open(&self) -> io::Result<Logged>;

    /// Accept the next stream initiated by the peer.
    async fn accept(&self) -> io::Result<Logged>;

    /// Close the session and all of its streams.
    async fn close(&self) -> io::Result<()>;
}

/// Server-side source of new transport sessions.
#[async_trait]
pub trait MuxAcceptor: Send + Sync {
    async fn accept(&self) -> io::Result<Arc<dyn MuxSession>>;
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed")
}

pub mod memory {
    //! In-process mux: both ends live in the same process and exchange
    //! streams over channels.

    use super::*;

    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, watch, Mutex};

    const STREAM_BUF: usize = 64 * 1024;
    const BACKLOG: usize = 32;

    /// One end of an in-process mux session.
    pub struct MemorySession {
        to_peer: mpsc::Sender<DuplexStream>,
        from_peer: Mutex<mpsc::Receiver<DuplexStream>>,
        closed_tx: watch::Sender<bool>,
        closed_rx: watch::Receiver<bool>,
    }

    /// Create a connected pair of mux session ends.
    pub fn pair() -> (MemorySession, MemorySession) {
        let (a_tx, a_rx) = mpsc::channel(BACKLOG);
        let (b_tx, b_rx) = mpsc::channel(BACKLOG);
        // one shared close state: closing either end fails both
        let (closed_tx, closed_rx) = watch::channel(false);

        let a = MemorySession {
            to_peer: b_tx,
            from_peer: Mutex::new(a_rx),
            closed_tx: closed_tx.clone(),
            closed_rx: closed_rx.clone(),
        };
        let b = MemorySession {
            to_peer: a_tx,
            from_peer: Mutex::new(b_rx),
            closed_tx,
            closed_rx,
        };
        (a, b)
    }

    #[async_trait]
    impl MuxSession for MemorySession {
        async fn open(&self) -> io::Result<Logged> {
            if *self.closed_rx.borrow() {
                return Err(closed());
            }
            let (near, far) = tokio::io::duplex(STREAM_BUF);
            self.to_peer.send(far).await.map_err(|_| closed())?;
            Ok(Logged::wrap(near, "stream"))
        }

        async fn accept(&self) -> io::Result<Logged> {
            let mut from_peer = self.from_peer.lock().await;
            let mut closed_rx = self.closed_rx.clone();
            tokio::select! {
                _ = closed_rx.wait_for(|c| *c) => Err(closed()),
                stream = from_peer.recv() => match stream {
                    Some(stream) => Ok(Logged::wrap(stream, "stream")),
                    None => Err(closed()),
                },
            }
        }

        async fn close(&self) -> io::Result<()> {
            self.closed_tx.send_replace(true);
            Ok(())
        }
    }

    /// Client-side handle that manufactures new sessions toward an
    /// [`Acceptor`].
    #[derive(Clone)]
    pub struct Connector {
        tx: mpsc::Sender<MemorySession>,
    }

    impl Connector {
        pub async fn connect(&self) -> io::Result<Arc<dyn MuxSession>> {
            let (client_end, server_end) = pair();
            self.tx
                .send(server_end)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "acceptor gone"))?;
            Ok(Arc::new(client_end))
        }
    }

    /// Server-side queue of incoming in-process sessions.
    pub struct Acceptor {
        rx: Mutex<mpsc::Receiver<MemorySession>>,
    }

    /// An in-process transport endpoint: connect from as many clients as you
    /// like, accept on the server side.
    pub fn endpoint() -> (Connector, Acceptor) {
        let (tx, rx) = mpsc::channel(BACKLOG);
        (Connector { tx }, Acceptor { rx: Mutex::new(rx) })
    }

    #[async_trait]
    impl MuxAcceptor for Acceptor {
        async fn accept(&self) -> io::Result<Arc<dyn MuxSession>> {
            let session = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"))?;
            Ok(Arc::new(session))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn open_and_accept_carry_bytes() {
        let (a, b) = memory::pair();

        let mut opened = a.open().await.unwrap();
        let mut accepted = b.accept().await.unwrap();

        opened.write_all(b"hello").await.unwrap();
        opened.shutdown().await.unwrap();

        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn close_fails_both_ends() {
        let (a, b) = memory::pair();
        a.close().await.unwrap();

        assert!(a.open().await.is_err());
        assert!(b.open().await.is_err());
        assert!(b.accept().await.is_err());
    }

    #[tokio::test]
    async fn close_unblocks_a_parked_accept() {
        let (a, b) = memory::pair();
        let parked = tokio::spawn(async move { b.accept().await.map(|_| ()) });
        tokio::task::yield_now().await;
        a.close().await.unwrap();
        assert!(parked.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn endpoint_hands_sessions_to_the_acceptor() {
        let (connector, acceptor) = memory::endpoint();

        let client = connector.connect().await.unwrap();
        let server = acceptor.accept().await.unwrap();

        let mut opened = client.open().await.unwrap();
        let mut accepted = server.accept().await.unwrap();
        opened.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
