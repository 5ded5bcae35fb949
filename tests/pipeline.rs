//! End-to-end outbound pipeline tests against in-process servers.

use mandala_core::{
    config::NodeConfig,
    dialer::{Connector, Dialer},
    ech::EchResolver,
    protocol,
};
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

fn dialer_for(json: String) -> Dialer {
    let node = Arc::new(NodeConfig::from_json(&json).unwrap());
    let ech = Arc::new(EchResolver::new(node.tls.ech_doh_url.clone()));
    Dialer::new(node, ech)
}

async fn read_exactly(stream: &mut tokio::net::TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// SOCKS5 with username/password: the server demands auth, replies to
/// CONNECT and immediately pipelines payload behind the reply. The
/// first byte the caller sees must be payload, not reply remnants.
#[tokio::test]
async fn socks5_auth_handshake_consumes_whole_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let greeting = read_exactly(&mut stream, 2).await;
        assert_eq!(greeting[0], 0x05);
        let methods = read_exactly(&mut stream, greeting[1] as usize).await;
        assert!(methods.contains(&0x02));
        stream.write_all(&[0x05, 0x02]).await.unwrap();

        let ver_ulen = read_exactly(&mut stream, 2).await;
        assert_eq!(ver_ulen[0], 0x01);
        let username = read_exactly(&mut stream, ver_ulen[1] as usize).await;
        assert_eq!(username, b"alice");
        let plen = read_exactly(&mut stream, 1).await;
        let password = read_exactly(&mut stream, plen[0] as usize).await;
        assert_eq!(password, b"pw");
        stream.write_all(&[0x01, 0x00]).await.unwrap();

        let head = read_exactly(&mut stream, 4).await;
        assert_eq!(&head[..3], &[0x05, 0x01, 0x00]);
        assert_eq!(head[3], 0x01); // IPv4 target
        let _bnd = read_exactly(&mut stream, 6).await;

        // Reply and payload in one burst.
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        stream.write_all(b"DATA").await.unwrap();
    });

    let dialer = dialer_for(format!(
        r#"{{"type":"socks5","server":"127.0.0.1","server_port":{port},"uuid":"alice","password":"pw"}}"#
    ));
    let mut outbound = dialer.connect("9.9.9.9", 80).await.unwrap();

    let mut payload = [0u8; 4];
    outbound.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"DATA");
    server.await.unwrap();
}

/// A server that rejects every offered method fails the dial with an
/// auth error, not a protocol error.
#[tokio::test]
async fn socks5_method_rejection_is_auth_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let greeting = read_exactly(&mut stream, 2).await;
        let _ = read_exactly(&mut stream, greeting[1] as usize).await;
        stream.write_all(&[0x05, 0xFF]).await.unwrap();
    });

    let dialer = dialer_for(format!(
        r#"{{"type":"socks5","server":"127.0.0.1","server_port":{port}}}"#
    ));
    let err = dialer.connect("9.9.9.9", 80).await.unwrap_err();
    assert!(matches!(err, mandala_core::Error::Auth(_)));
}

/// Trojan over a bare TCP transport: the prologue must arrive before
/// any payload, and the stream stays usable both ways afterwards.
#[tokio::test]
async fn trojan_prologue_then_bidirectional_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let expected =
        protocol::trojan_prologue("secret", &protocol::socks_addr("example.com", 80).unwrap());
    let prologue_len = expected.len();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let prologue = read_exactly(&mut stream, prologue_len).await;
        assert_eq!(prologue, expected);
        stream.write_all(b"PONG").await.unwrap();
        let echo = read_exactly(&mut stream, 5).await;
        assert_eq!(echo, b"HELLO");
    });

    let dialer = dialer_for(format!(
        r#"{{"type":"trojan","server":"127.0.0.1","server_port":{port},"password":"secret"}}"#
    ));
    let mut outbound = dialer.connect("example.com", 80).await.unwrap();

    let mut pong = [0u8; 4];
    outbound.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"PONG");
    outbound.write_all(b"HELLO").await.unwrap();
    server.await.unwrap();
}

/// VLESS: the two-byte server response (plus addons) disappears before
/// the first payload byte reaches the caller.
#[tokio::test]
async fn vless_response_is_stripped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // version + uuid + addons + cmd + port + atyp + ipv4
        let request = read_exactly(&mut stream, 1 + 16 + 1 + 1 + 2 + 1 + 4).await;
        assert_eq!(request[0], 0x00);
        stream.write_all(&[0x00, 0x01, 0xEE]).await.unwrap();
        stream.write_all(b"DATA").await.unwrap();
    });

    let dialer = dialer_for(format!(
        r#"{{"type":"vless","server":"127.0.0.1","server_port":{port},"uuid":"11111111-2222-3333-4444-555555555555"}}"#
    ));
    let mut outbound = dialer.connect("1.2.3.4", 443).await.unwrap();

    let mut payload = [0u8; 4];
    outbound.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"DATA");
    server.await.unwrap();
}

/// Shadowsocks over WebSocket transport (no TLS): the upgrade completes
/// against a real server and the prologue arrives as binary frames.
#[tokio::test]
async fn shadowsocks_over_websocket_transport() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 16 + 1 + 4 + 2 {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => received.extend_from_slice(&data),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        // Random salt, then the SocksAddr for 1.2.3.4:80.
        assert_eq!(&received[16..], &[0x01, 0x01, 0x02, 0x03, 0x04, 0x00, 0x50]);
        ws.send(Message::Binary(b"WELCOME".to_vec())).await.unwrap();
    });

    let dialer = dialer_for(format!(
        r#"{{"type":"shadowsocks","server":"127.0.0.1","server_port":{port},"password":"p",
             "transport":{{"type":"ws","path":"/tunnel"}}}}"#
    ));
    let mut outbound = dialer.connect("1.2.3.4", 80).await.unwrap();

    let mut hello = [0u8; 7];
    outbound.read_exact(&mut hello).await.unwrap();
    assert_eq!(&hello, b"WELCOME");
    server.await.unwrap();
}

/// Dead proxy endpoint surfaces as a dial error.
#[tokio::test]
async fn refused_connection_is_dial_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dialer = dialer_for(format!(
        r#"{{"type":"trojan","server":"127.0.0.1","server_port":{port},"password":"p"}}"#
    ));
    let err = dialer.connect("example.com", 80).await.unwrap_err();
    assert!(matches!(err, mandala_core::Error::Dial(_)));
}
