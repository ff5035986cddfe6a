//! Client side of the passage tunneling service.
//!
//! A [`Session`] authenticates with a tunnel server over a multiplexed
//! transport and listens tunnels: public endpoints whose traffic the server
//! forwards back over the same transport. [`ReconnectingSession`] adds
//! transparent reconnection, re-authentication and re-binding.
//!
//! The transport itself is injected: anything implementing
//! [`passage_core::MuxSession`] (via a [`Dialer`] for reconnecting sessions)
//! will do.

mod error;
mod raw;
mod reconnect;
mod session;
mod tunnel;

pub use error::Error;
pub use raw::RawSession;
pub use reconnect::{Dialer, ReconnectingSession};
pub use session::Session;
pub use tunnel::Tunnel;
