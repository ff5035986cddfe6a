//! User-supplied callbacks customizing session and tunnel behavior.
//!
//! Every hook defaults to a no-op. A hook error is folded into the
//! corresponding protocol response's `Error` field, except for the close
//! hooks, whose failures abort the teardown in progress.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use passage_core::proto::{Auth, Bind};
use passage_core::Logged;

use crate::session::Session;
use crate::tunnel::Tunnel;

/// Callbacks around the lifecycle of a client session.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Runs after version negotiation, before the auth response is sent.
    /// An error rejects the session.
    async fn on_auth(&self, _session: &Session, _auth: &Auth) -> Result<()> {
        Ok(())
    }

    /// Runs before a bind is handed to its binder. An error rejects the
    /// bind.
    async fn on_bind(&self, _session: &Session, _bind: &Bind) -> Result<()> {
        Ok(())
    }

    /// Runs first during session shutdown. An error aborts the teardown.
    async fn on_close(&self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

/// Callbacks around the lifecycle of a tunnel and its public connections.
#[async_trait]
pub trait TunnelHooks: Send + Sync {
    async fn on_tunnel_open(&self, _tunnel: &Tunnel) -> Result<()> {
        Ok(())
    }

    async fn on_tunnel_close(&self, _tunnel: &Tunnel) -> Result<()> {
        Ok(())
    }

    /// Runs for each accepted public connection before a proxy stream is
    /// opened. An error drops the connection.
    async fn on_connection_open(&self, _tunnel: &Tunnel, _conn: &Logged) -> Result<()> {
        Ok(())
    }

    /// Runs after the proxied connection terminates, with its duration and
    /// the byte counts moved in each direction.
    async fn on_connection_close(
        &self,
        _tunnel: &Tunnel,
        _duration: Duration,
        _bytes_in: u64,
        _bytes_out: u64,
    ) -> Result<()> {
        Ok(())
    }
}

/// The default session hooks: allow everything.
pub struct NoopSessionHooks;

#[async_trait]
impl SessionHooks for NoopSessionHooks {}

/// The default tunnel hooks: observe nothing.
pub struct NoopTunnelHooks;

#[async_trait]
impl TunnelHooks for NoopTunnelHooks {}
