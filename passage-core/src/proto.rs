//! Wire protocol for tunnel control channels.
//!
//! Defines the message kinds exchanged between tunnel client and server over
//! multiplexed streams. Field names are fixed by the wire format and therefore
//! serialized in PascalCase.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single protocol version this implementation speaks.
pub const VERSION: &str = "2";

/// A control message, wire-encoded as `{"Type": <kind>, "Payload": {...}}`.
///
/// Unknown kinds fail to decode, which surfaces as a framing error at the
/// codec layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Payload")]
pub enum Message {
    Auth(Auth),
    AuthResp(AuthResp),
    Bind(Bind),
    BindResp(BindResp),
    Unbind(Unbind),
    UnbindResp(UnbindResp),
    StartProxy(StartProxy),
}

impl Message {
    /// The kind name carried in the envelope's `Type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth(_) => Auth::KIND,
            Message::AuthResp(_) => AuthResp::KIND,
            Message::Bind(_) => Bind::KIND,
            Message::BindResp(_) => BindResp::KIND,
            Message::Unbind(_) => Unbind::KIND,
            Message::UnbindResp(_) => UnbindResp::KIND,
            Message::StartProxy(_) => StartProxy::KIND,
        }
    }
}

/// A payload that knows which envelope kind it travels as.
pub trait Body: Sized {
    const KIND: &'static str;

    fn wrap(self) -> Message;

    /// Recover the payload from a decoded message, or hand the message back
    /// if it is of a different kind.
    fn unwrap(msg: Message) -> Result<Self, Message>;
}

macro_rules! body {
    ($ty:ident) => {
        impl Body for $ty {
            const KIND: &'static str = stringify!($ty);

            fn wrap(self) -> Message {
                Message::$ty(self)
            }

            fn unwrap(msg: Message) -> Result<Self, Message> {
                match msg {
                    Message::$ty(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for Message {
            fn from(inner: $ty) -> Message {
                Message::$ty(inner)
            }
        }
    };
}

body!(Auth);
body!(AuthResp);
body!(Bind);
body!(BindResp);
body!(Unbind);
body!(UnbindResp);
body!(StartProxy);

/// First message a client sends over a new control session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Auth {
    /// Protocol versions the client speaks, ordered by preference.
    pub version: Vec<String>,
    /// Empty for new sessions; set when resuming an existing one.
    pub client_id: String,
    /// Application-specific data, opaque to the protocol.
    #[serde(default)]
    pub extra: Value,
}

/// The server's reply to an [`Auth`] message.
///
/// A non-empty `error` means the server rejected the session and will close
/// the connection. The assigned `client_id` authenticates reconnects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResp {
    pub version: String,
    pub client_id: String,
    pub error: String,
    #[serde(default)]
    pub extra: Value,
}

/// Request to bind a public port or hostname on the client's behalf.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bind {
    /// The protocol to bind: "http", "https", "tcp" or "tls".
    pub protocol: String,
    /// Protocol-dependent bind options; decoded in two stages once the
    /// protocol is known.
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub extra: Value,
}

/// The server's reply to a [`Bind`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindResp {
    pub url: String,
    pub protocol: String,
    pub error: String,
    #[serde(default)]
    pub extra: Value,
}

/// Request to release a previously bound tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Unbind {
    pub url: String,
    #[serde(default)]
    pub extra: Value,
}

/// The server's reply to an [`Unbind`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnbindResp {
    pub error: String,
    #[serde(default)]
    pub extra: Value,
}

/// Sent first on every server-initiated stream to identify which tunnel the
/// proxied connection belongs to. After this message the stream carries raw
/// bytes bridged to the public connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartProxy {
    /// URL of the tunnel this connection is being proxied for.
    pub url: String,
    /// Network address of the remote party that dialed the tunnel.
    pub client_addr: String,
}

/// Bind options for HTTP and HTTPS tunnels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HttpOptions {
    pub hostname: String,
    pub subdomain: String,
    /// `"user:pass"` to gate the endpoint behind HTTP basic auth.
    pub auth: String,
}

/// Bind options for raw TCP tunnels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TcpOptions {
    /// 0 asks the server's OS to assign a port.
    pub remote_port: u16,
}

/// Bind options for TLS tunnels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TlsOptions {
    pub hostname: String,
    pub subdomain: String,
}

/// Decode a schema-less protocol field (`Extra`, `Bind.Options`) into its
/// concrete shape.
///
/// These fields travel as untyped JSON because their schema depends on
/// context the codec does not have (the bind's protocol name, the
/// application's auth payload). Callers re-decode the generic value once the
/// concrete type is known; `Null` decodes to the shape's default.
pub fn unpack_field<T>(field: &Value) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned + Default,
{
    if field.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(field.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_on_the_wire() {
        let msg = Message::Auth(Auth {
            version: vec![VERSION.into()],
            client_id: "".into(),
            extra: Value::Null,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["Type"], "Auth");
        assert_eq!(json["Payload"]["Version"][0], VERSION);
        assert_eq!(json["Payload"]["ClientId"], "");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"Type":"Bogus","Payload":{}}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn body_round_trip() {
        let resp = BindResp {
            url: "tcp://example.com:7000".into(),
            protocol: "tcp".into(),
            ..Default::default()
        };
        let msg = resp.clone().wrap();
        assert_eq!(msg.kind(), "BindResp");
        let back = BindResp::unwrap(msg).unwrap();
        assert_eq!(back.url, resp.url);
        assert!(BindResp::unwrap(Message::Unbind(Unbind::default())).is_err());
    }

    #[test]
    fn options_decode_in_two_stages() {
        // Options arrive as a generic value and are re-decoded once the
        // protocol name tells us the concrete shape.
        let bind = Bind {
            protocol: "http".into(),
            options: serde_json::json!({"Hostname": "a.example.com", "Auth": "u:p"}),
            extra: Value::Null,
        };
        let wire = serde_json::to_string(&bind.wrap()).unwrap();
        let decoded: Message = serde_json::from_str(&wire).unwrap();
        let bind = Bind::unwrap(decoded).unwrap();
        let opts: HttpOptions = unpack_field(&bind.options).unwrap();
        assert_eq!(opts.hostname, "a.example.com");
        assert_eq!(opts.subdomain, "");
        assert_eq!(opts.auth, "u:p");
    }

    #[test]
    fn null_options_decode_to_default() {
        let opts: TcpOptions = unpack_field(&Value::Null).unwrap();
        assert_eq!(opts.remote_port, 0);
    }
}
