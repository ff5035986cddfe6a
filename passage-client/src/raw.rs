//! Low-level client session: one request/response exchange per stream.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use passage_core::codec::{read_msg_as, write_msg};
use passage_core::proto::{Auth, AuthResp, Bind, BindResp, Body, Message, Unbind, UnbindResp, VERSION};
use passage_core::{Logged, MuxSession};

use crate::error::Error;

/// A client session that handles authentication with the tunnel server and
/// the listen/unlisten RPCs. Most applications want [`crate::Session`]
/// instead.
///
/// The underlying mux is swappable so a reconnecting wrapper can replace it
/// after a transport failure: every operation holds the read half of the
/// lock for its duration, the swap takes the write half, and no operation
/// ever observes a partially installed mux.
pub struct RawSession {
    mux: RwLock<Option<Arc<dyn MuxSession>>>,
    id: StdMutex<String>,
}

impl RawSession {
    pub fn new(mux: Option<Arc<dyn MuxSession>>) -> Self {
        RawSession {
            mux: RwLock::new(mux),
            id: StdMutex::new(String::new()),
        }
    }

    /// The session id assigned by the server, empty before the first
    /// successful auth.
    pub fn id(&self) -> String {
        self.id.lock().unwrap().clone()
    }

    /// Swap in a fresh mux, blocking until in-flight operations drain.
    pub async fn install_mux(&self, mux: Arc<dyn MuxSession>) {
        *self.mux.write().await = Some(mux);
    }

    /// Close the current mux, failing all in-flight and future operations.
    pub async fn close(&self) {
        let guard = self.mux.read().await;
        if let Some(mux) = guard.as_ref() {
            let _ = mux.close().await;
        }
    }

    /// Authenticate with the server. `id` is empty unless resuming an
    /// existing session. On success the server-assigned id is adopted.
    ///
    /// A non-empty `resp.error` is an application-level rejection, not a
    /// transport error: the response is returned as-is.
    pub async fn auth(&self, id: &str, extra: Value) -> Result<AuthResp, Error> {
        let req = Auth {
            version: vec![VERSION.to_owned()],
            client_id: id.to_owned(),
            extra,
        };
        let resp: AuthResp = self.request("auth", req).await?;
        if resp.error.is_empty() {
            let mut current = self.id.lock().unwrap();
            if *current != resp.client_id {
                debug!(client_id = %resp.client_id, "adopting session id");
                *current = resp.client_id.clone();
            }
        }
        Ok(resp)
    }

    /// Ask the server to bind a public endpoint for `protocol` with the
    /// given protocol-specific options.
    pub async fn listen(
        &self,
        protocol: &str,
        opts: Value,
        extra: Value,
    ) -> Result<BindResp, Error> {
        let req = Bind {
            protocol: protocol.to_owned(),
            options: opts,
            extra,
        };
        self.request("listen", req).await
    }

    /// Ask the server to release the tunnel bound at `url`.
    pub async fn unlisten(&self, url: &str) -> Result<UnbindResp, Error> {
        let req = Unbind {
            url: url.to_owned(),
            extra: Value::Null,
        };
        self.request("unlisten", req).await
    }

    /// Accept the next stream the server opened toward us. These are proxy
    /// streams carrying public connections.
    pub async fn accept(&self) -> Result<Logged, Error> {
        let guard = self.mux.read().await;
        let mux = guard.as_ref().ok_or(Error::NotConnected)?.clone();
        let mut stream = mux.accept().await?;
        stream.add_tag("proxy");
        Ok(stream)
    }

    /// One round trip over a fresh stream; the stream is closed afterwards.
    async fn request<Resp>(&self, tag: &str, req: impl Into<Message>) -> Result<Resp, Error>
    where
        Resp: Body,
    {
        let guard = self.mux.read().await;
        let mux = guard.as_ref().ok_or(Error::NotConnected)?.clone();

        let mut stream = mux.open().await?;
        stream.add_tag(tag);
        write_msg(&mut stream, req).await?;
        let resp = read_msg_as::<_, Resp>(&mut stream).await?;
        Ok(resp)
    }
}
