//! Binder pair for servers behind an external HTTPS-terminating proxy.
//!
//! The outer proxy terminates TLS and forwards everything over plain HTTP,
//! announcing the original scheme in `X-Forwarded-Proto`. One listener can
//! therefore serve both logical schemes: the vhost routing key carries the
//! scheme (`http://host` or `https://host`), and each binder of the pair
//! registers names under its own prefix.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use super::http::{spawn_error_loop, HostMuxer, HttpBinder};
use crate::vhost::{VhostError, VhostListener, VhostMux};

struct SchemePrefixed {
    inner: Arc<VhostMux>,
    scheme: &'static str,
}

impl HostMuxer for SchemePrefixed {
    fn listen(&self, name: &str) -> Result<VhostListener, VhostError> {
        self.inner.listen(&format!("{}://{}", self.scheme, name))
    }
}

/// Serve one listener and return an `(http, https)` binder pair sharing the
/// scheme-aware muxer.
pub fn reverse_proxy(
    listener: TcpListener,
    public_base_addr: &str,
    mux_timeout: Duration,
) -> (HttpBinder, HttpBinder) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "reverse-proxy binder listening");
    }
    let (mux, errors) = VhostMux::reverse_proxy(listener, mux_timeout);
    spawn_error_loop(errors);

    let http = HttpBinder::with_muxer(
        Arc::new(SchemePrefixed {
            inner: mux.clone(),
            scheme: "http",
        }),
        "http",
        public_base_addr,
    );
    let https = HttpBinder::with_muxer(
        Arc::new(SchemePrefixed {
            inner: mux,
            scheme: "https",
        }),
        "https",
        public_base_addr,
    );
    (http, https)
}
