//! Server configuration.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::binder::{Binders, HttpBinder, TcpBinder, TlsBinder};

/// Passage server - accept tunnel sessions and expose client services on
/// public endpoints.
#[derive(Parser, Debug, Clone)]
#[command(name = "passage-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Public base address used to form tunnel hostnames
    /// (e.g. tunnel.example.com)
    #[arg(long, env = "PASSAGE_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Address for public HTTP traffic
    #[arg(long, env = "PASSAGE_HTTP_ADDR", default_value = "0.0.0.0:80")]
    pub http_addr: String,

    /// Address for public HTTPS traffic; requires a TLS acceptor
    #[arg(long, env = "PASSAGE_HTTPS_ADDR")]
    pub https_addr: Option<String>,

    /// Address for public TLS (SNI passthrough) traffic
    #[arg(long, env = "PASSAGE_TLS_ADDR")]
    pub tls_addr: Option<String>,

    /// Interface TCP tunnel ports are bound on
    #[arg(long, env = "PASSAGE_TCP_IFACE", default_value = "0.0.0.0")]
    pub tcp_iface: IpAddr,

    /// Hostname reported in tcp:// tunnel URLs; defaults to the domain
    #[arg(long, env = "PASSAGE_TCP_HOSTNAME")]
    pub tcp_hostname: Option<String>,

    /// Virtual-host peek timeout in milliseconds
    #[arg(long, env = "PASSAGE_MUX_TIMEOUT_MS", default_value = "10000")]
    pub mux_timeout_ms: u64,

    /// Enable debug logging
    #[arg(long, env = "PASSAGE_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    /// Peek timeout for the vhost muxers.
    pub fn mux_timeout(&self) -> Duration {
        Duration::from_millis(self.mux_timeout_ms)
    }

    /// Assemble the standard binder set from this configuration. The HTTPS
    /// binder is only created when both an address and a TLS acceptor are
    /// supplied.
    pub async fn build_binders(&self, tls: Option<TlsAcceptor>) -> io::Result<Binders> {
        let timeout = self.mux_timeout();
        let mut binders: Binders = HashMap::new();

        let listener = TcpListener::bind(&self.http_addr).await?;
        let http = HttpBinder::http(listener, &self.domain, timeout);
        binders.insert("http".to_owned(), Arc::new(http));

        if let (Some(addr), Some(acceptor)) = (&self.https_addr, tls) {
            let listener = TcpListener::bind(addr).await?;
            let https = HttpBinder::https(listener, &self.domain, timeout, acceptor);
            binders.insert("https".to_owned(), Arc::new(https));
        }

        if let Some(addr) = &self.tls_addr {
            let listener = TcpListener::bind(addr).await?;
            let tls = TlsBinder::new(listener, &self.domain, timeout);
            binders.insert("tls".to_owned(), Arc::new(tls));
        }

        let tcp_hostname = self.tcp_hostname.as_deref().unwrap_or(&self.domain);
        binders.insert(
            "tcp".to_owned(),
            Arc::new(TcpBinder::new(self.tcp_iface, tcp_hostname)),
        );

        Ok(binders)
    }
}
