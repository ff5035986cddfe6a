//! Binders turn a bind request into a public listener and its URL.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use passage_core::{rand_id, Logged};

use crate::vhost::{normalize, VhostError};

mod http;
mod reverse;
mod tcp;
mod tls;

pub use http::HttpBinder;
pub use reverse::reverse_proxy;
pub use tcp::TcpBinder;
pub use tls::TlsBinder;

/// How many times a random hostname is drawn before giving up.
pub(crate) const MAX_RANDOM_ATTEMPTS: usize = 10;

/// Protocol name → binder, consulted on every bind request.
pub type Binders = HashMap<String, Arc<dyn Binder>>;

/// Failures turning a bind request into a listener. The message is what the
/// client sees in `BindResp.Error`.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Can't bind for {0} connections")]
    UnknownProtocol(String),

    #[error("invalid bind options: {0}")]
    Options(#[from] serde_json::Error),

    #[error(transparent)]
    Vhost(#[from] VhostError),

    #[error("Failed to assign random hostname")]
    RandomExhausted,

    #[error("failed to bind: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Hook(anyhow::Error),
}

/// A successfully bound public endpoint.
pub struct Bound {
    pub listener: Box<dyn PublicListener>,
    pub url: String,
}

impl std::fmt::Debug for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bound").field("url", &self.url).finish()
    }
}

/// A protocol-specific factory for public endpoints.
#[async_trait]
pub trait Binder: Send + Sync {
    /// Bind with generically deserialized options; each binder re-decodes
    /// them into its own option shape.
    async fn bind(&self, opts: &Value) -> Result<Bound, BindError>;
}

/// Source of public connections for one tunnel. `None` means the listener
/// is dead; dropping it releases the port or hostname.
#[async_trait]
pub trait PublicListener: Send {
    async fn accept(&mut self) -> Option<Logged>;
}

/// Second stage of the options decode, once the protocol is known.
pub(crate) fn unpack_options<T>(raw: &Value) -> Result<T, BindError>
where
    T: DeserializeOwned + Default,
{
    Ok(passage_core::proto::unpack_field(raw)?)
}

/// Hostname selection shared by the vhost binders.
///
/// An explicit hostname wins; otherwise a subdomain is attached to the
/// public base address; otherwise a random 4-char one is drawn.
pub(crate) fn pick_name(hostname: &str, subdomain: &str, public_base_addr: &str) -> (String, bool) {
    let hostname = normalize(hostname);
    let subdomain = normalize(subdomain);

    if !hostname.is_empty() {
        (hostname, false)
    } else if !subdomain.is_empty() {
        (format!("{subdomain}.{public_base_addr}"), false)
    } else {
        (format!("{}.{public_base_addr}", rand_id(4)), true)
    }
}
