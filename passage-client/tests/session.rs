//! Client session behavior against a scripted in-process server.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use passage_client::{Dialer, Error, ReconnectingSession, Session};
use passage_core::codec::{read_msg, read_msg_as, write_msg};
use passage_core::mux::memory;
use passage_core::proto::{
    unpack_field, Auth, AuthResp, Bind, BindResp, HttpOptions, Message, StartProxy, TcpOptions,
    UnbindResp, VERSION,
};
use passage_core::{Logged, MuxSession};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Accept one stream on the server end and answer its auth request.
async fn answer_auth(mux: &dyn MuxSession, client_id: &str) -> Auth {
    let mut stream = mux.accept().await.unwrap();
    let auth: Auth = read_msg_as(&mut stream).await.unwrap();
    write_msg(
        &mut stream,
        AuthResp {
            version: VERSION.into(),
            client_id: client_id.into(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    auth
}

/// Accept one stream on the server end and answer its bind with `url`.
async fn answer_bind(mux: &dyn MuxSession, url: &str) -> Bind {
    let mut stream = mux.accept().await.unwrap();
    let bind: Bind = read_msg_as(&mut stream).await.unwrap();
    write_msg(
        &mut stream,
        BindResp {
            url: url.into(),
            protocol: bind.protocol.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    bind
}

/// Open a proxy stream toward the client and write `payload` after the
/// preamble.
async fn open_proxy(mux: &dyn MuxSession, url: &str, client_addr: &str, payload: &[u8]) -> Logged {
    let mut stream = mux.open().await.unwrap();
    write_msg(
        &mut stream,
        StartProxy {
            url: url.into(),
            client_addr: client_addr.into(),
        },
    )
    .await
    .unwrap();
    stream.write_all(payload).await.unwrap();
    stream
}

#[tokio::test]
async fn auth_adopts_the_server_assigned_id() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    let server = tokio::spawn(async move {
        let auth = answer_auth(&server_end, "assigned-id").await;
        assert_eq!(auth.version, vec![VERSION.to_owned()]);
        assert_eq!(auth.client_id, "");
    });

    let session = Session::new(Arc::new(client_end));
    session.auth("", Value::Null).await.unwrap();
    assert_eq!(session.id(), "assigned-id");
    server.await.unwrap();
}

#[tokio::test]
async fn auth_rejection_is_surfaced() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    tokio::spawn(async move {
        let mut stream = server_end.accept().await.unwrap();
        let _: Auth = read_msg_as(&mut stream).await.unwrap();
        write_msg(
            &mut stream,
            AuthResp {
                error: "invalid token".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    });

    let session = Session::new(Arc::new(client_end));
    let err = session.auth("", Value::Null).await.unwrap_err();
    assert!(matches!(err, Error::Rejected(msg) if msg == "invalid token"));
}

#[tokio::test]
async fn listen_rewrites_random_options_and_registers_the_tunnel() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    let server = tokio::spawn(async move {
        let bind = answer_bind(&server_end, "http://ab12.tunnel.example.com").await;
        let opts: HttpOptions = unpack_field(&bind.options).unwrap();
        assert_eq!(opts.hostname, "");
        server_end
    });

    let session = Session::new(Arc::new(client_end));
    let tunnel = session
        .listen_http(HttpOptions::default(), Value::Null)
        .await
        .unwrap();
    assert_eq!(tunnel.url(), "http://ab12.tunnel.example.com");
    assert_eq!(tunnel.protocol(), "http");

    // a follow-up https bind reuses the pinned hostname
    let server_end = server.await.unwrap();
    let server = tokio::spawn(async move {
        let bind = answer_bind(&server_end, "https://ab12.tunnel.example.com").await;
        let opts: HttpOptions = unpack_field(&bind.options).unwrap();
        assert_eq!(opts.hostname, "ab12.tunnel.example.com");
    });
    // drive the second bind through the rewritten options path
    let https = session
        .listen(
            "https",
            serde_json::to_value(HttpOptions {
                hostname: "ab12.tunnel.example.com".into(),
                ..Default::default()
            })
            .unwrap(),
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(https.url(), "https://ab12.tunnel.example.com");
    server.await.unwrap();
}

#[tokio::test]
async fn bind_rejection_is_a_logical_failure() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    tokio::spawn(async move {
        let mut stream = server_end.accept().await.unwrap();
        let _ = read_msg(&mut stream).await.unwrap();
        write_msg(
            &mut stream,
            BindResp {
                error: "hostname already bound".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    });

    let session = Session::new(Arc::new(client_end));
    let err = session
        .listen_tcp(TcpOptions { remote_port: 7000 }, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(msg) if msg == "hostname already bound"));
}

#[tokio::test]
async fn proxy_streams_are_dispatched_by_url() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    let server_end = Arc::new(server_end);

    let session = Session::new(Arc::new(client_end));

    let peer = server_end.clone();
    let binds = tokio::spawn(async move {
        answer_bind(&*peer, "http://a.example.com").await;
        answer_bind(&*peer, "http://b.example.com").await;
    });
    let tunnel_a = session
        .listen_http(HttpOptions::default(), Value::Null)
        .await
        .unwrap();
    let tunnel_b = session
        .listen_http(HttpOptions::default(), Value::Null)
        .await
        .unwrap();
    binds.await.unwrap();

    // two proxy streams, one per URL, delivered to the matching tunnel
    let mut far_b = open_proxy(&*server_end, "http://b.example.com", "203.0.113.7:1", b"to-b").await;
    let mut conn_b = tunnel_b.accept().await.unwrap();
    assert_eq!(conn_b.peer(), Some("203.0.113.7:1"));
    let mut buf = [0u8; 4];
    conn_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to-b");

    let _far_a = open_proxy(&*server_end, "http://a.example.com", "203.0.113.7:2", b"to-a").await;
    let mut conn_a = tunnel_a.accept().await.unwrap();
    let mut buf = [0u8; 4];
    conn_a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to-a");

    // bytes also flow back from the tunnel to the proxy stream
    conn_b.write_all(b"resp").await.unwrap();
    let mut buf = [0u8; 4];
    far_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"resp");
}

#[tokio::test]
async fn proxy_for_an_unknown_url_is_discarded() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    let server_end = Arc::new(server_end);
    let session = Session::new(Arc::new(client_end));

    let peer = server_end.clone();
    let bind = tokio::spawn(async move { answer_bind(&*peer, "http://known.example.com").await });
    let tunnel = session
        .listen_http(HttpOptions::default(), Value::Null)
        .await
        .unwrap();
    bind.await.unwrap();

    // a stream for a URL that was never bound is dropped...
    let mut unknown =
        open_proxy(&*server_end, "http://gone.example.com", "203.0.113.9:9", b"").await;
    let mut buf = Vec::new();
    unknown.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    // ...and the session keeps serving streams for live tunnels
    let _far = open_proxy(&*server_end, "http://known.example.com", "203.0.113.9:8", b"ok").await;
    let mut conn = tunnel.accept().await.unwrap();
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn tunnel_close_unbinds_and_is_idempotent() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    let server_end = Arc::new(server_end);
    let session = Session::new(Arc::new(client_end));

    let peer = server_end.clone();
    let bind = tokio::spawn(async move { answer_bind(&*peer, "tcp://pub.example.com:7000").await });
    let tunnel = session
        .listen_tcp(TcpOptions { remote_port: 7000 }, Value::Null)
        .await
        .unwrap();
    bind.await.unwrap();

    let peer = server_end.clone();
    let unbind = tokio::spawn(async move {
        let mut stream = peer.accept().await.unwrap();
        match read_msg(&mut stream).await.unwrap() {
            Message::Unbind(unbind) => assert_eq!(unbind.url, "tcp://pub.example.com:7000"),
            other => panic!("expected Unbind, got {}", other.kind()),
        }
        write_msg(&mut stream, UnbindResp::default()).await.unwrap();
    });

    tunnel.close().await.unwrap();
    unbind.await.unwrap();

    // the second close reports the tunnel as already closed
    assert!(matches!(tunnel.close().await, Err(Error::AlreadyClosed)));
    // and accepts fail now that the channel is gone
    assert!(matches!(tunnel.accept().await, Err(Error::TunnelClosed)));
}

#[tokio::test]
async fn transport_death_tears_down_tunnels() {
    init_logging();
    let (client_end, server_end) = memory::pair();
    let server_end = Arc::new(server_end);
    let session = Session::new(Arc::new(client_end));

    let peer = server_end.clone();
    let bind = tokio::spawn(async move { answer_bind(&*peer, "http://x.example.com").await });
    let tunnel = session
        .listen_http(HttpOptions::default(), Value::Null)
        .await
        .unwrap();
    bind.await.unwrap();

    server_end.close().await.unwrap();

    // the receive loop notices and closes every tunnel
    assert!(matches!(tunnel.accept().await, Err(Error::TunnelClosed)));
}

/// Dialer handing out sessions from an in-process endpoint.
struct MemoryDialer(memory::Connector);

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> io::Result<Arc<dyn MuxSession>> {
        self.0.connect().await
    }
}

#[tokio::test]
async fn permanent_auth_failure_surfaces_at_connect() {
    init_logging();
    let (connector, acceptor) = memory::endpoint();
    tokio::spawn(async move {
        let mux = passage_core::MuxAcceptor::accept(&acceptor).await.unwrap();
        let mut stream = mux.accept().await.unwrap();
        let _: Auth = read_msg_as(&mut stream).await.unwrap();
        write_msg(
            &mut stream,
            AuthResp {
                error: "No acceptable protocol version. Requested: [\"0\"], capable: 2".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    });

    let err = ReconnectingSession::connect(Arc::new(MemoryDialer(connector)), Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Rejected(msg) if msg.starts_with("No acceptable protocol version")
    ));
}

#[tokio::test]
async fn reconnect_reauthenticates_and_rebinds_every_tunnel() {
    init_logging();
    let (connector, acceptor) = memory::endpoint();

    let script = tokio::spawn(async move {
        // first connection: assign an id, then grant the two binds
        let mux1 = passage_core::MuxAcceptor::accept(&acceptor).await.unwrap();
        let auth = answer_auth(&*mux1, "client-9").await;
        assert_eq!(auth.client_id, "");
        let bind = answer_bind(&*mux1, "http://ab12.base.io").await;
        assert_eq!(bind.protocol, "http");
        let bind = answer_bind(&*mux1, "tcp://base.io:40412").await;
        assert_eq!(bind.protocol, "tcp");

        // kill the transport out from under the client
        mux1.close().await.unwrap();

        // the client dials again: same id, and both binds re-issued with
        // the options pinned at first listen
        let mux2 = passage_core::MuxAcceptor::accept(&acceptor).await.unwrap();
        let auth = answer_auth(&*mux2, "client-9").await;
        assert_eq!(auth.client_id, "client-9");

        let mut rebinds = Vec::new();
        for _ in 0..2 {
            let mut stream = mux2.accept().await.unwrap();
            let bind: Bind = read_msg_as(&mut stream).await.unwrap();
            let url = match bind.protocol.as_str() {
                "http" => {
                    let opts: HttpOptions = unpack_field(&bind.options).unwrap();
                    assert_eq!(opts.hostname, "ab12.base.io");
                    "http://ab12.base.io"
                }
                "tcp" => {
                    let opts: TcpOptions = unpack_field(&bind.options).unwrap();
                    assert_eq!(opts.remote_port, 40412);
                    "tcp://base.io:40412"
                }
                other => panic!("unexpected re-bind protocol {other}"),
            };
            write_msg(
                &mut stream,
                BindResp {
                    url: url.into(),
                    protocol: bind.protocol.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            rebinds.push(bind.protocol);
        }

        // the original tunnel objects must still deliver connections
        let _far = open_proxy(&*mux2, "http://ab12.base.io", "198.51.100.4:99", b"after").await;
        rebinds
    });

    let session = ReconnectingSession::connect(Arc::new(MemoryDialer(connector)), Value::Null)
        .await
        .unwrap();
    assert_eq!(session.id(), "client-9");

    let http_tunnel = session
        .listen_http(HttpOptions::default(), Value::Null)
        .await
        .unwrap();
    let _tcp_tunnel = session
        .listen_tcp(TcpOptions { remote_port: 0 }, Value::Null)
        .await
        .unwrap();

    // survives the transport swap without the caller doing anything
    let mut conn = http_tunnel.accept().await.unwrap();
    assert_eq!(conn.peer(), Some("198.51.100.4:99"));
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after");

    let mut rebinds = script.await.unwrap();
    rebinds.sort();
    assert_eq!(rebinds, vec!["http".to_owned(), "tcp".to_owned()]);
}
