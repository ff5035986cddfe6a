//! Core types and protocols for the passage tunneling service.
//!
//! This crate provides shared functionality between the tunnel server and
//! client: the wire protocol, the length-prefixed framing codec, the logged
//! connection wrapper, and the stream-multiplexer contract both sides run
//! over.

pub mod codec;
pub mod conn;
pub mod mux;
pub mod proto;

pub use codec::{pack, read_msg, read_msg_as, unpack, write_msg, CodecError};
pub use conn::{join, rand_id, secure_rand_id, Logged};
pub use mux::{MuxAcceptor, MuxSession};
pub use proto::{
    Auth, AuthResp, Bind, BindResp, Body, HttpOptions, Message, StartProxy, TcpOptions,
    TlsOptions, Unbind, UnbindResp, VERSION,
};
