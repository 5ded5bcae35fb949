use crate::{
    config::{NodeConfig, TransportKind},
    ech::EchResolver,
    fragment::FragmentStream,
    protocol, tls, ws, Error, Result,
};
use socket2::{SockRef, TcpKeepalive};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;

/// Marker for the boxed byte streams the transport layers stack onto
/// each other. Every combination of {TCP, fragment, TLS, WebSocket}
/// ends up behind the same alias.
pub trait AsyncReadWrite: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

impl std::fmt::Debug for dyn AsyncReadWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProxyStream")
    }
}

pub type ProxyStream = Box<dyn AsyncReadWrite>;

/// Seam between the flow handlers and the outbound pipeline; the UDP
/// NAT and DNS tunnel only ever see this trait.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Dial the node and complete the per-flow protocol handshake for
    /// `(host, port)`.
    async fn connect(&self, host: &str, port: u16) -> Result<ProxyStream>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Dial(format!("connect timeout to {host}:{port}")))?
        .map_err(|e| Error::Dial(format!("connect to {host}:{port}: {e}")))?;

    let _ = stream.set_nodelay(true);
    // Liveness comes from keepalive; sessions carry no idle timer.
    let sref = SockRef::from(&stream);
    let _ = sref.set_keepalive(true);
    let ka = TcpKeepalive::new()
        .with_time(KEEPALIVE_PERIOD)
        .with_interval(KEEPALIVE_PERIOD);
    let _ = sref.set_tcp_keepalive(&ka);
    Ok(stream)
}

/// Builds outbound streams for the configured node. One instance is
/// shared by every flow of a core instance.
pub struct Dialer {
    node: Arc<NodeConfig>,
    ech: Arc<EchResolver>,
}

impl Dialer {
    pub fn new(node: Arc<NodeConfig>, ech: Arc<EchResolver>) -> Self {
        Self { node, ech }
    }

    /// Establish the transport pipeline decided by the node config:
    /// TCP, then the one-shot fragment shim, then fingerprinted TLS
    /// (with ECH when resolvable), then the WebSocket upgrade. Failure
    /// at any layer drops everything dialed so far.
    pub async fn dial(&self) -> Result<ProxyStream> {
        let node = &*self.node;
        let tcp = connect_tcp(&node.server, node.server_port).await?;

        let mut stream: ProxyStream = if node.settings.fragment {
            Box::new(FragmentStream::new(tcp))
        } else {
            Box::new(tcp)
        };

        if node.tls.enabled {
            let ech_config_list = if node.tls.enable_ech {
                let domain = node.ech_query_domain();
                match self.ech.resolve(domain).await {
                    Ok(list) => Some(list),
                    Err(e) => {
                        log::warn!("[ECH] lookup for {domain} failed: {e}, continuing without ECH");
                        None
                    }
                }
            } else {
                None
            };
            stream = Box::new(tls::handshake(node, stream, ech_config_list).await?);
        }

        if node.transport.kind == TransportKind::Ws {
            stream = Box::new(ws::upgrade(node, stream).await?);
        }

        Ok(stream)
    }
}

#[async_trait::async_trait]
impl Connector for Dialer {
    async fn connect(&self, host: &str, port: u16) -> Result<ProxyStream> {
        let stream = self.dial().await?;
        protocol::client_handshake(&self.node, stream, host, port).await
    }
}
