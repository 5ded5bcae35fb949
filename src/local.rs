use crate::{
    config::NodeConfig,
    dialer::{Connector, Dialer},
    ech::EchResolver,
    session, Error, Result,
};
use socks5_impl::protocol::{
    handshake, Address, AsyncStreamOperation, AuthMethod, Command, Reply, Request, Response,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// Probe deadline for the first bytes of an accepted connection.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEADER: usize = 8 * 1024;

/// Accept loop of the local inbound. Each connection is probed on its
/// first byte: 0x05 speaks SOCKS5, anything else is treated as HTTP.
pub async fn run(listener: TcpListener, node: Arc<NodeConfig>, token: CancellationToken) -> Result<()> {
    let ech = Arc::new(EchResolver::new(node.tls.ech_doh_url.clone()));
    let dialer: Arc<dyn Connector> = Arc::new(Dialer::new(node.clone(), ech));

    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("[LOCAL] accept failed: {e}");
                    continue;
                }
            },
        };
        let dialer = dialer.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, dialer, token).await {
                log::debug!("[LOCAL] {peer}: {e}");
            }
        });
    }
    log::info!("[LOCAL] stopped");
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    dialer: Arc<dyn Connector>,
    token: CancellationToken,
) -> Result<()> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(PROBE_TIMEOUT, stream.peek(&mut first))
        .await
        .map_err(|_| Error::Transport("inbound probe timeout".into()))??;
    if n == 0 {
        return Ok(());
    }

    if first[0] == 0x05 {
        handle_socks5(stream, dialer, token).await
    } else {
        handle_http(stream, dialer, token).await
    }
}

/// Server side of the SOCKS5 dialogue: no-auth greeting, CONNECT only,
/// success reply carries the unspecified bind address.
async fn handle_socks5(
    mut stream: TcpStream,
    dialer: Arc<dyn Connector>,
    token: CancellationToken,
) -> Result<()> {
    let _greeting = handshake::Request::retrieve_from_async_stream(&mut stream).await?;
    handshake::Response::new(AuthMethod::NoAuth)
        .write_to_async_stream(&mut stream)
        .await?;

    let request = Request::retrieve_from_async_stream(&mut stream).await?;
    if request.command != Command::Connect {
        Response::new(Reply::CommandNotSupported, Address::unspecified())
            .write_to_async_stream(&mut stream)
            .await?;
        return Err(Error::Protocol(format!(
            "unsupported socks5 command {:?}",
            request.command
        )));
    }

    let (host, port) = match request.address {
        Address::SocketAddress(sa) => (sa.ip().to_string(), sa.port()),
        Address::DomainAddress(domain, port) => (domain, port),
    };

    let outbound = match dialer.connect(&host, port).await {
        Ok(outbound) => outbound,
        Err(e) => {
            Response::new(Reply::HostUnreachable, Address::unspecified())
                .write_to_async_stream(&mut stream)
                .await?;
            return Err(e);
        }
    };
    Response::new(Reply::Succeeded, Address::unspecified())
        .write_to_async_stream(&mut stream)
        .await?;

    log::info!("[LOCAL] socks5 {host}:{port}");
    let _ = session::relay(stream, outbound, token).await;
    Ok(())
}

/// HTTP proxy: CONNECT gets a 200 tunnel, plain requests are replayed
/// to the origin verbatim (absolute-form request targets are required
/// to be accepted by servers).
async fn handle_http(
    mut stream: TcpStream,
    dialer: Arc<dyn Connector>,
    token: CancellationToken,
) -> Result<()> {
    let head = read_header(&mut stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let parsed = request
        .parse(&head)
        .map_err(|e| Error::Transport(format!("http parse: {e}")))?;
    let header_len = match parsed {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(Error::Transport("http header truncated".into())),
    };

    let method = request.method.unwrap_or_default().to_string();
    let path = request.path.unwrap_or_default().to_string();
    let host_header = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    let (host, port) = target_of(&path, host_header.as_deref(), is_connect)?;

    let mut outbound = dialer.connect(&host, port).await?;
    log::info!("[LOCAL] http {method} {host}:{port}");

    if is_connect {
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        // Bytes the client pipelined behind its CONNECT belong upstream.
        if head.len() > header_len {
            outbound.write_all(&head[header_len..]).await?;
        }
    } else {
        outbound.write_all(&head).await?;
    }

    let _ = session::relay(stream, outbound, token).await;
    Ok(())
}

async fn read_header(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(PROBE_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::Transport("http header timeout".into()))??;
        if n == 0 {
            return Err(Error::Transport("connection closed before header".into()));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEADER {
            return Err(Error::Transport("http header too large".into()));
        }
    }
}

/// Resolve the origin `(host, port)` from the request target, falling
/// back to the Host header for origin-form requests.
fn target_of(path: &str, host_header: Option<&str>, is_connect: bool) -> Result<(String, u16)> {
    let default_port = if is_connect { 443 } else { 80 };

    let authority = if is_connect {
        path.to_string()
    } else if let Some(rest) = path.strip_prefix("http://") {
        rest.split('/').next().unwrap_or_default().to_string()
    } else if let Some(host) = host_header {
        host.to_string()
    } else {
        return Err(Error::Transport(format!("no target in request: {path}")));
    };

    if authority.is_empty() {
        return Err(Error::Transport("empty request target".into()));
    }

    // IPv6 literals carry brackets: [::1]:8080
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Transport(format!("bad authority: {authority}")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Transport(format!("bad port in {authority}")))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse()
                .map_err(|_| Error::Transport(format!("bad port in {authority}")))?,
        )),
        None => Ok((authority, default_port)),
    }
}
