//! Raw TCP port binder.

use std::net::IpAddr;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::warn;

use passage_core::proto::TcpOptions;
use passage_core::Logged;

use super::{unpack_options, BindError, Binder, Bound, PublicListener};

/// Binds TCP ports on a single interface.
///
/// `hostname` is only used to build the URLs reported back to clients; it
/// should be the public name the interface is reachable at.
pub struct TcpBinder {
    iface: IpAddr,
    hostname: String,
}

impl TcpBinder {
    pub fn new(iface: IpAddr, hostname: &str) -> TcpBinder {
        TcpBinder {
            iface,
            hostname: hostname.to_lowercase(),
        }
    }
}

#[async_trait]
impl Binder for TcpBinder {
    async fn bind(&self, opts: &Value) -> Result<Bound, BindError> {
        let opts: TcpOptions = unpack_options(opts)?;
        self.bind_opts(&opts).await
    }
}

impl TcpBinder {
    pub async fn bind_opts(&self, opts: &TcpOptions) -> Result<Bound, BindError> {
        let listener = TcpListener::bind((self.iface, opts.remote_port)).await?;

        // ask the listener which port it bound in case the client supplied
        // port 0 and the OS picked one
        let port = listener.local_addr()?.port();
        let url = format!("tcp://{}:{}", self.hostname, port);

        Ok(Bound {
            listener: Box::new(TcpPublic { listener }),
            url,
        })
    }
}

struct TcpPublic {
    listener: TcpListener,
}

#[async_trait]
impl PublicListener for TcpPublic {
    async fn accept(&mut self) -> Option<Logged> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let mut conn = Logged::wrap(stream, "pub");
                    conn.set_peer(peer.to_string());
                    return Some(conn);
                }
                Err(err) => {
                    warn!(%err, "failed to accept public tcp connection");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_binder() -> TcpBinder {
        TcpBinder::new(IpAddr::V4(Ipv4Addr::LOCALHOST), "Pub.Example.Com")
    }

    #[tokio::test]
    async fn os_assigned_port_is_read_back() {
        let bound = local_binder()
            .bind(&serde_json::json!({"RemotePort": 0}))
            .await
            .unwrap();
        let port: u16 = bound.url.rsplit(':').next().unwrap().parse().unwrap();
        assert!(port > 0);
        assert!(bound.url.starts_with("tcp://pub.example.com:"));
    }

    #[tokio::test]
    async fn specific_port_collision_fails_without_side_effects() {
        let binder = local_binder();
        let first = binder.bind_opts(&TcpOptions { remote_port: 0 }).await.unwrap();
        let port: u16 = first.url.rsplit(':').next().unwrap().parse().unwrap();

        // second bind of the same port fails
        let err = binder
            .bind_opts(&TcpOptions { remote_port: port })
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::Io(_)));

        // the original listener still accepts
        let mut first = first;
        let accepted = tokio::spawn(async move { first.listener.accept().await });
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ok").await.unwrap();
        let mut conn = accepted.await.unwrap().unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
