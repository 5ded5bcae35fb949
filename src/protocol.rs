use crate::{
    config::{NodeConfig, ProtocolKind},
    dialer::ProxyStream,
    Error, Result,
};
use rand::RngCore;
use sha2::{Digest, Sha224};
use socks5_impl::protocol::{
    handshake, password_method, Address, AsyncStreamOperation, AuthMethod, Command, Reply, Request,
    Response, StreamOperation,
};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const CRLF: [u8; 2] = [0x0D, 0x0A];
const CMD_CONNECT: u8 = 0x01;

/// Target address in the SOCKS form shared by all five protocols:
/// `ATYP(1) || ADDR || PORT(2, be)`. Numeric hosts become IPv4/IPv6,
/// anything else a domain name (≤ 255 bytes).
pub fn socks_addr(host: &str, port: u16) -> Result<Address> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Address::from(SocketAddr::new(ip, port)));
    }
    if host.len() > 255 {
        return Err(Error::Protocol(format!("domain too long: {host}")));
    }
    Ok(Address::DomainAddress(host.to_string(), port))
}

fn addr_bytes(addr: &Address) -> Vec<u8> {
    let mut buf = Vec::with_capacity(addr.len());
    addr.write_to_buf(&mut buf);
    buf
}

fn sha224_hex(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// Mandala prologue: `sha224_hex(password) CRLF 0x01 SocksAddr CRLF`
/// followed by `noise` random bytes. The noise rides inside the
/// handshake plaintext with no length header; the server's prologue
/// parser is length-free, so the suffix is absorbed.
pub fn mandala_prologue(password: &str, addr: &Address, noise: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(56 + 2 + 1 + addr.len() + 2 + noise);
    buf.extend_from_slice(sha224_hex(password).as_bytes());
    buf.extend_from_slice(&CRLF);
    buf.push(CMD_CONNECT);
    buf.extend_from_slice(&addr_bytes(addr));
    buf.extend_from_slice(&CRLF);
    if noise > 0 {
        let mut padding = vec![0u8; noise];
        rand::thread_rng().fill_bytes(&mut padding);
        buf.extend_from_slice(&padding);
    }
    buf
}

/// Trojan prologue: Mandala without the noise suffix.
pub fn trojan_prologue(password: &str, addr: &Address) -> Vec<u8> {
    mandala_prologue(password, addr, 0)
}

/// VLESS request: `version(0) uuid(16) addons_len(0) cmd(1) port(2,be)
/// ATYP ADDR`. Unlike the SOCKS form, the port precedes the address
/// type.
pub fn vless_prologue(uuid: &uuid::Uuid, addr: &Address) -> Vec<u8> {
    let mut buf = Vec::with_capacity(21 + addr.len());
    buf.push(0x00);
    buf.extend_from_slice(uuid.as_bytes());
    buf.push(0x00);
    buf.push(CMD_CONNECT);
    match addr {
        Address::SocketAddress(SocketAddr::V4(sa)) => {
            buf.extend_from_slice(&sa.port().to_be_bytes());
            buf.push(0x01);
            buf.extend_from_slice(&sa.ip().octets());
        }
        Address::SocketAddress(SocketAddr::V6(sa)) => {
            buf.extend_from_slice(&sa.port().to_be_bytes());
            buf.push(0x04);
            buf.extend_from_slice(&sa.ip().octets());
        }
        Address::DomainAddress(domain, port) => {
            buf.extend_from_slice(&port.to_be_bytes());
            buf.push(0x03);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    buf
}

/// Shadowsocks prologue: a 16-byte random salt placeholder followed by
/// the SocksAddr. The outer TLS layer is the actual encryption.
pub fn shadowsocks_prologue(addr: &Address) -> Vec<u8> {
    let mut buf = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.extend_from_slice(&addr_bytes(addr));
    buf
}

/// Emit the per-flow request for `node` on a freshly dialed stream and
/// return the stream to carry payload, wrapped where the protocol
/// requires it (VLESS).
pub async fn client_handshake(
    node: &NodeConfig,
    mut stream: ProxyStream,
    host: &str,
    port: u16,
) -> Result<ProxyStream> {
    let addr = socks_addr(host, port)?;
    match node.kind {
        ProtocolKind::Mandala => {
            let noise = node.settings.noise.byte_count();
            stream
                .write_all(&mandala_prologue(&node.password, &addr, noise))
                .await?;
            Ok(stream)
        }
        ProtocolKind::Trojan => {
            stream.write_all(&trojan_prologue(&node.password, &addr)).await?;
            Ok(stream)
        }
        ProtocolKind::Vless => {
            let uuid = uuid::Uuid::parse_str(&node.uuid)?;
            stream.write_all(&vless_prologue(&uuid, &addr)).await?;
            Ok(Box::new(VlessStream::new(stream)))
        }
        ProtocolKind::Shadowsocks => {
            stream.write_all(&shadowsocks_prologue(&addr)).await?;
            Ok(stream)
        }
        ProtocolKind::Socks5 => {
            socks5_connect(&mut stream, &node.username, &node.password, addr).await?;
            Ok(stream)
        }
    }
}

/// Full RFC 1928/1929 client handshake. The CONNECT reply, including
/// BND.ADDR and BND.PORT, is consumed in its entirety before this
/// returns; anything left behind would surface as payload.
async fn socks5_connect(
    stream: &mut ProxyStream,
    username: &str,
    password: &str,
    addr: Address,
) -> Result<()> {
    let mut methods = vec![AuthMethod::NoAuth];
    if !username.is_empty() {
        methods.push(AuthMethod::UserPass);
    }
    handshake::Request::new(methods)
        .write_to_async_stream(stream)
        .await?;

    let selection = handshake::Response::retrieve_from_async_stream(stream).await?;
    match selection.method {
        AuthMethod::NoAuth => {}
        AuthMethod::UserPass if !username.is_empty() => {
            password_method::Request::new(username, password)
                .write_to_async_stream(stream)
                .await?;
            let status = password_method::Response::retrieve_from_async_stream(stream).await?;
            if status.status != password_method::Status::Succeeded {
                return Err(Error::Auth(format!(
                    "socks5 authentication rejected: {:?}",
                    status.status
                )));
            }
        }
        AuthMethod::NoAcceptableMethods => {
            return Err(Error::Auth("socks5 server rejected offered methods".into()))
        }
        method => {
            return Err(Error::Auth(format!(
                "socks5 server demanded unoffered method {method:?}"
            )))
        }
    }

    Request::new(Command::Connect, addr)
        .write_to_async_stream(stream)
        .await?;
    let response = Response::retrieve_from_async_stream(stream).await?;
    if response.reply != Reply::Succeeded {
        return Err(Error::Protocol(format!(
            "socks5 connect failed: {}",
            response.reply
        )));
    }
    Ok(())
}

enum VlessState {
    /// Collecting the two-byte `version, addons_len` reply.
    Header { filled: usize, header: [u8; 2] },
    /// Discarding `addons_len` trailing bytes.
    Addons { remaining: usize },
    Ready,
}

/// Strips the server's VLESS response before the first payload byte and
/// passes bytes through verbatim afterwards.
pub struct VlessStream<S> {
    inner: S,
    state: VlessState,
}

impl<S> VlessStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: VlessState::Header {
                filled: 0,
                header: [0u8; 2],
            },
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VlessStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                VlessState::Header { filled, header } => {
                    let mut scratch = [0u8; 2];
                    let mut tmp = ReadBuf::new(&mut scratch[..2 - *filled]);
                    std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp))?;
                    let n = tmp.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "vless response truncated",
                        )));
                    }
                    header[*filled..*filled + n].copy_from_slice(tmp.filled());
                    *filled += n;
                    if *filled == 2 {
                        let addons = header[1] as usize;
                        this.state = VlessState::Addons { remaining: addons };
                    }
                }
                VlessState::Addons { remaining } => {
                    if *remaining == 0 {
                        this.state = VlessState::Ready;
                        continue;
                    }
                    let mut scratch = [0u8; 64];
                    let take = (*remaining).min(scratch.len());
                    let mut tmp = ReadBuf::new(&mut scratch[..take]);
                    std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp))?;
                    let n = tmp.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "vless addons truncated",
                        )));
                    }
                    *remaining -= n;
                }
                VlessState::Ready => return Pin::new(&mut this.inner).poll_read(cx, buf),
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VlessStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const SECRET_SHA224: &str = "95c7fbca92ac5083afda62a564a3d014fc3b72c9140e3cb99ea6bf12";

    #[test]
    fn trojan_prologue_bytes() {
        let addr = socks_addr("example.com", 80).unwrap();
        let prologue = trojan_prologue("secret", &addr);

        let mut expected = Vec::new();
        expected.extend_from_slice(SECRET_SHA224.as_bytes());
        expected.extend_from_slice(&[0x0D, 0x0A, 0x01, 0x03, 0x0b]);
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x00, 0x50, 0x0D, 0x0A]);
        assert_eq!(prologue, expected);
    }

    #[test]
    fn mandala_noise_arithmetic() {
        let addr = socks_addr("example.com", 80).unwrap();
        for noise in [0usize, 1, 16, 200] {
            let prologue = mandala_prologue("secret", &addr, noise);
            assert_eq!(prologue.len(), 56 + 2 + 1 + addr.len() + 2 + noise);
        }
        // Zero noise degenerates to the Trojan prologue.
        assert_eq!(
            mandala_prologue("secret", &addr, 0),
            trojan_prologue("secret", &addr)
        );
    }

    #[test]
    fn vless_prologue_bytes() {
        let uuid = uuid::Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap();
        let addr = socks_addr("93.184.216.34", 443).unwrap();
        let prologue = vless_prologue(&uuid, &addr);
        assert_eq!(
            hex::encode(prologue),
            "0011111111222233334444555555555555000101bb015db8d822"
        );
    }

    #[test]
    fn vless_domain_puts_port_before_atyp() {
        let uuid = uuid::Uuid::nil();
        let addr = socks_addr("example.com", 443).unwrap();
        let prologue = vless_prologue(&uuid, &addr);
        assert_eq!(prologue[17], 0x00); // addons length
        assert_eq!(prologue[18], 0x01); // connect
        assert_eq!(&prologue[19..21], &[0x01, 0xbb]);
        assert_eq!(prologue[21], 0x03);
        assert_eq!(prologue[22] as usize, "example.com".len());
    }

    #[test]
    fn shadowsocks_prologue_shape() {
        let addr = socks_addr("1.2.3.4", 80).unwrap();
        let prologue = shadowsocks_prologue(&addr);
        assert_eq!(prologue.len(), 16 + 1 + 4 + 2);
        assert_eq!(&prologue[16..], &[0x01, 0x01, 0x02, 0x03, 0x04, 0x00, 0x50]);
    }

    #[test]
    fn socks_addr_variants() {
        assert!(matches!(
            socks_addr("10.0.0.1", 53).unwrap(),
            Address::SocketAddress(SocketAddr::V4(_))
        ));
        assert!(matches!(
            socks_addr("2001:db8::1", 53).unwrap(),
            Address::SocketAddress(SocketAddr::V6(_))
        ));
        assert!(matches!(
            socks_addr("example.com", 53).unwrap(),
            Address::DomainAddress(_, _)
        ));
        assert!(socks_addr(&"x".repeat(256), 53).is_err());
    }

    #[tokio::test]
    async fn vless_stream_strips_response_with_addons() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // version 0, two addon bytes, then payload split across writes
            server.write_all(&[0x00, 0x02]).await.unwrap();
            server.write_all(&[0xAA, 0xBB]).await.unwrap();
            server.write_all(b"PAYLOAD").await.unwrap();
        });

        let mut stream = VlessStream::new(client);
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PAYLOAD");
    }

    #[tokio::test]
    async fn vless_stream_eof_during_header_is_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut stream = VlessStream::new(client);
        let mut buf = [0u8; 1];
        let err = stream.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
