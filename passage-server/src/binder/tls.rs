//! TLS passthrough binder: routes by SNI without terminating TLS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use passage_core::proto::TlsOptions;
use passage_core::Logged;

use super::http::spawn_error_loop;
use super::{pick_name, unpack_options, BindError, Binder, Bound, PublicListener, MAX_RANDOM_ATTEMPTS};
use crate::vhost::{normalize, VhostError, VhostListener, VhostMux};

/// Binds TLS endpoints demultiplexed by SNI. The tunneled bytes stay
/// encrypted end to end; only the ClientHello is peeked.
pub struct TlsBinder {
    mux: Arc<VhostMux>,
    public_base_addr: String,
}

impl TlsBinder {
    pub fn new(listener: TcpListener, public_base_addr: &str, mux_timeout: Duration) -> TlsBinder {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "tls binder listening");
        }
        let (mux, errors) = VhostMux::tls(listener, mux_timeout);
        spawn_error_loop(errors);
        TlsBinder {
            mux,
            public_base_addr: normalize(public_base_addr),
        }
    }

    pub fn bind_opts(&self, opts: &TlsOptions) -> Result<Bound, BindError> {
        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let (hostname, is_random) =
                pick_name(&opts.hostname, &opts.subdomain, &self.public_base_addr);

            let inner = match self.mux.listen(&hostname) {
                Ok(inner) => inner,
                Err(VhostError::HostInUse(_)) if is_random => continue,
                Err(err) => return Err(err.into()),
            };

            let url = format!("tls://{hostname}");
            return Ok(Bound {
                listener: Box::new(TlsPublic { inner }),
                url,
            });
        }
        Err(BindError::RandomExhausted)
    }
}

#[async_trait]
impl Binder for TlsBinder {
    async fn bind(&self, opts: &Value) -> Result<Bound, BindError> {
        let opts: TlsOptions = unpack_options(opts)?;
        self.bind_opts(&opts)
    }
}

struct TlsPublic {
    inner: VhostListener,
}

#[async_trait]
impl PublicListener for TlsPublic {
    async fn accept(&mut self) -> Option<Logged> {
        let conn = self.inner.accept().await?;
        let peer = conn.peer().to_owned();
        let host = conn.host().to_owned();
        let mut logged = Logged::wrap(conn, "pub");
        logged.add_tag(&host);
        logged.set_peer(peer);
        Some(logged)
    }
}
