//! Server side of the passage tunneling service.
//!
//! A [`Server`] accepts multiplexed transport sessions from clients and
//! serves their requests to listen on the server's ports and hostnames.
//! Custom behavior is injected through [`SessionHooks`] and [`TunnelHooks`];
//! public endpoints are created by the protocol [`binder`]s.

pub mod binder;
pub mod config;
mod guard;
mod hooks;
mod registry;
mod session;
mod tunnel;
pub mod vhost;

use std::sync::Arc;

use tracing::{error, info};

use passage_core::MuxAcceptor;

pub use binder::{
    reverse_proxy, BindError, Binder, Binders, Bound, HttpBinder, PublicListener, TcpBinder,
    TlsBinder,
};
pub use config::ServerConfig;
pub use guard::{Permit, ShutdownGuard, ShuttingDown};
pub use hooks::{NoopSessionHooks, NoopTunnelHooks, SessionHooks, TunnelHooks};
pub use registry::SessionRegistry;
pub use session::Session;
pub use tunnel::Tunnel;

/// Accepts tunnel sessions and binds tunnels on them.
pub struct Server {
    registry: Arc<SessionRegistry>,
    binders: Arc<Binders>,
    session_hooks: Arc<dyn SessionHooks>,
    tunnel_hooks: Arc<dyn TunnelHooks>,
}

impl Server {
    /// A server binding tunnels with `binders`; hooks default to no-ops.
    pub fn new(binders: Binders) -> Server {
        Server {
            registry: Arc::new(SessionRegistry::new()),
            binders: Arc::new(binders),
            session_hooks: Arc::new(NoopSessionHooks),
            tunnel_hooks: Arc::new(NoopTunnelHooks),
        }
    }

    pub fn with_session_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Server {
        self.session_hooks = hooks;
        self
    }

    pub fn with_tunnel_hooks(mut self, hooks: Arc<dyn TunnelHooks>) -> Server {
        self.tunnel_hooks = hooks;
        self
    }

    /// The registry of authenticated sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept transport sessions forever, one task per session. An
    /// individual session failing never stops the accept loop; an acceptor
    /// failure ends it.
    pub async fn run(&self, acceptor: impl MuxAcceptor) -> std::io::Result<()> {
        info!("listening for tunnel sessions");
        loop {
            match acceptor.accept().await {
                Ok(mux) => {
                    let session = Session::new(
                        mux,
                        self.registry.clone(),
                        self.session_hooks.clone(),
                        self.tunnel_hooks.clone(),
                        self.binders.clone(),
                    );
                    tokio::spawn(session.run());
                }
                Err(err) => {
                    error!(%err, "failed to accept tunnel session");
                    return Err(err);
                }
            }
        }
    }
}
