//! Length-prefixed framing for control messages.
//!
//! Every frame is an `i64` little-endian length followed by that many bytes
//! of JSON envelope. Within a single stream, writes and reads are strictly
//! ordered.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::proto::{Body, Message};

/// Upper bound on a single control frame. Control messages are small; a
/// larger prefix means a corrupt or hostile peer.
pub const MAX_FRAME_LEN: i64 = 1 << 20;

/// Errors raised while framing or parsing control messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {0} outside valid range")]
    Oversized(i64),

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected {expected} message, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

/// Serialize a message into its envelope bytes (without the length prefix).
pub fn pack(msg: &Message) -> Result<Bytes, CodecError> {
    let buf = serde_json::to_vec(msg)?;
    Ok(Bytes::from(buf))
}

/// Parse envelope bytes into a message.
pub fn unpack(buf: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(buf)?)
}

/// Write one framed message to `stream`.
pub async fn write_msg<S>(stream: &mut S, msg: impl Into<Message>) -> Result<(), CodecError>
where
    S: AsyncWrite + Unpin,
{
    let msg = msg.into();
    let buf = pack(&msg)?;
    trace!(kind = msg.kind(), len = buf.len(), "writing message");
    stream.write_all(&(buf.len() as i64).to_le_bytes()).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message from `stream`.
pub async fn read_msg<S>(stream: &mut S) -> Result<Message, CodecError>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 8];
    stream.read_exact(&mut prefix).await?;
    let len = i64::from_le_bytes(prefix);
    if !(0..=MAX_FRAME_LEN).contains(&len) {
        return Err(CodecError::Oversized(len));
    }

    let mut buf = BytesMut::zeroed(len as usize);
    stream.read_exact(&mut buf).await?;
    let msg = unpack(&buf)?;
    trace!(kind = msg.kind(), len, "read message");
    Ok(msg)
}

/// Read one framed message and require it to be of kind `T`.
pub async fn read_msg_as<S, T>(stream: &mut S) -> Result<T, CodecError>
where
    S: AsyncRead + Unpin,
    T: Body,
{
    let msg = read_msg(stream).await?;
    T::unwrap(msg).map_err(|other| CodecError::Unexpected {
        expected: T::KIND,
        got: other.kind(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Auth, AuthResp, Bind, BindResp, StartProxy, Unbind, UnbindResp, VERSION};

    fn all_kinds() -> Vec<Message> {
        vec![
            Auth {
                version: vec![VERSION.into()],
                client_id: "c0ffee".into(),
                extra: serde_json::json!({"Token": "t"}),
            }
            .wrap(),
            AuthResp {
                version: VERSION.into(),
                client_id: "c0ffee".into(),
                ..Default::default()
            }
            .wrap(),
            Bind {
                protocol: "tcp".into(),
                options: serde_json::json!({"RemotePort": 7000}),
                ..Default::default()
            }
            .wrap(),
            BindResp {
                url: "tcp://pub.example.com:7000".into(),
                protocol: "tcp".into(),
                ..Default::default()
            }
            .wrap(),
            Unbind {
                url: "tcp://pub.example.com:7000".into(),
                ..Default::default()
            }
            .wrap(),
            UnbindResp::default().wrap(),
            StartProxy {
                url: "http://abcd.example.com".into(),
                client_addr: "203.0.113.9:4312".into(),
            }
            .wrap(),
        ]
    }

    #[test]
    fn pack_unpack_round_trips_every_kind() {
        for msg in all_kinds() {
            let buf = pack(&msg).unwrap();
            let back = unpack(&buf).unwrap();
            assert_eq!(back.kind(), msg.kind());
            assert_eq!(
                serde_json::to_value(&back).unwrap(),
                serde_json::to_value(&msg).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn framed_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for msg in all_kinds() {
            write_msg(&mut a, msg.clone()).await.unwrap();
            let back = read_msg(&mut b).await.unwrap();
            assert_eq!(back.kind(), msg.kind());
        }
    }

    #[tokio::test]
    async fn typed_read_rejects_other_kinds() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_msg(&mut a, Unbind::default()).await.unwrap();
        let err = read_msg_as::<_, AuthResp>(&mut b).await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Unexpected { expected: "AuthResp", got: "Unbind" }
        ));
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        // a length prefix promising more bytes than will ever arrive
        a.write_all(&100i64.to_le_bytes()).await.unwrap();
        a.write_all(b"{\"Type\"").await.unwrap();
        drop(a);
        assert!(matches!(read_msg(&mut b).await, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn negative_and_oversized_lengths_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&(-1i64).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_msg(&mut b).await,
            Err(CodecError::Oversized(-1))
        ));

        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_msg(&mut b).await,
            Err(CodecError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_framing_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let body = br#"{"Type":"RegProxy","Payload":{}}"#;
        a.write_all(&(body.len() as i64).to_le_bytes()).await.unwrap();
        a.write_all(body).await.unwrap();
        assert!(matches!(
            read_msg(&mut b).await,
            Err(CodecError::Malformed(_))
        ));
    }
}
