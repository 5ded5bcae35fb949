#![cfg(unix)]

use crate::{
    config::NodeConfig,
    dialer::{Connector, Dialer, ProxyStream},
    dns::{self, DnsTunnel},
    ech::EchResolver,
    nat::UdpNatManager,
    session,
};
use ipstack::stream::{IpStackStream, IpStackTcpStream, IpStackUdpStream};
use ipstack::{IpStack, IpStackConfig};
use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Stack-level TCP housekeeping GC; liveness is TCP keepalive, sessions
/// carry no application idle timer.
const TCP_TIMEOUT: Duration = Duration::from_secs(600);
/// Matches the NAT idle window.
const UDP_TIMEOUT: Duration = Duration::from_secs(60);
const DNS_PORT: u16 = 53;

static FLOW_TAG: AtomicU64 = AtomicU64::new(0);

/// Terminate every flow arriving on the TUN device and re-originate it
/// through the proxy until cancellation.
pub async fn run(
    device: tun::AsyncDevice,
    mtu: u16,
    node: Arc<NodeConfig>,
    token: CancellationToken,
) -> crate::Result<()> {
    let ech = Arc::new(EchResolver::new(node.tls.ech_doh_url.clone()));
    let dialer: Arc<dyn Connector> = Arc::new(Dialer::new(node.clone(), ech));
    let nat = Arc::new(UdpNatManager::new(dialer.clone(), token.clone()));
    let dns_tunnel = Arc::new(DnsTunnel::new(dialer.clone()));

    let mut config = IpStackConfig::default();
    config.mtu(mtu);
    config.tcp_timeout(TCP_TIMEOUT);
    config.udp_timeout(UDP_TIMEOUT);
    let mut ip_stack = IpStack::new(config, device);

    log::info!("[STACK] accepting flows for node \"{}\" ({})", node.tag, node.kind);

    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            accepted = ip_stack.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("[STACK] accept failed: {e}");
                    break;
                }
            },
        };

        match stream {
            IpStackStream::Tcp(tcp) => {
                let dialer = dialer.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    handle_tcp(tcp, dialer, token).await;
                });
            }
            IpStackStream::Udp(udp) => {
                if udp.peer_addr().port() == DNS_PORT {
                    let tunnel = dns_tunnel.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        dns::serve_flow(udp, tunnel, token).await;
                    });
                } else {
                    let nat = nat.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        handle_udp(udp, nat, token).await;
                    });
                }
            }
            IpStackStream::UnknownTransport(u) => {
                log::debug!("[STACK] unsupported transport to {}", u.dst_addr());
            }
            IpStackStream::UnknownNetwork(packet) => {
                log::debug!("[STACK] unknown network packet, {} bytes", packet.len());
            }
        }
    }

    // Grace period: flow tasks observe the cancellation at their next
    // suspension point before the stack and device are torn down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    log::info!("[STACK] stopped");
    Ok(())
}

async fn handle_tcp(tcp: IpStackTcpStream, dialer: Arc<dyn Connector>, token: CancellationToken) {
    let src = tcp.local_addr();
    let dst = tcp.peer_addr();
    log::info!("[TCP] {src} -> {dst}");

    let outbound = match dialer.connect(&dst.ip().to_string(), dst.port()).await {
        Ok(outbound) => outbound,
        Err(e) => {
            log::warn!("[TCP] {src} -> {dst} outbound failed: {e}");
            return;
        }
    };

    match session::relay(tcp, outbound, token).await {
        Ok((sent, received)) => {
            log::info!("[TCP] {src} -> {dst} closed, {sent} up / {received} down")
        }
        Err(e) => log::debug!("[TCP] {src} -> {dst} aborted: {e}"),
    }
}

async fn handle_udp(udp: IpStackUdpStream, nat: Arc<UdpNatManager>, token: CancellationToken) {
    let src = udp.local_addr();
    let dst = udp.peer_addr();
    let key = format!("udp|{src}->{dst}");
    let flow_tag = FLOW_TAG.fetch_add(1, Relaxed);

    let boxed: ProxyStream = Box::new(udp);
    let (mut inbound_rd, inbound_wr) = tokio::io::split(boxed);

    let session = match nat
        .get_or_create(&key, flow_tag, inbound_wr, &dst.ip().to_string(), dst.port())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            log::warn!("[UDP] {src} -> {dst}: {e}");
            return;
        }
    };

    // Fan-in: each read is one datagram, relayed verbatim.
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return,
            read = inbound_rd.read(&mut buf) => match read {
                Ok(n) if n > 0 => n,
                _ => return,
            },
        };
        if let Err(e) = session.send(&buf[..n]).await {
            log::debug!("[UDP] {src} -> {dst} upstream write failed: {e}");
            return;
        }
    }
}
