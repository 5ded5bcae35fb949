use crate::{
    dialer::{Connector, ProxyStream},
    Error, Result,
};
use std::{io, str::FromStr, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use trust_dns_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{rdata::svcb::SvcParamValue, Name, RData, RecordType},
};

/// Upstream resolver reached through the proxy.
pub const DNS_REMOTE: (&str, u16) = ("8.8.8.8", 53);
/// First-read deadline per UDP/53 flow; an idle flow is destroyed.
const FLOW_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// One retry after clearing a broken cached connection.
const TUNNEL_ATTEMPTS: usize = 2;

/// Build the wire-format HTTPS (type 65) query the DoH resolver sends.
pub fn build_https_query(domain: &str) -> Result<Vec<u8>> {
    let name = Name::from_str(domain).map_err(|e| Error::Dns(format!("bad domain {domain}: {e}")))?;
    let mut message = Message::new();
    message
        .add_query(Query::query(name, RecordType::HTTPS))
        .set_id(rand::random())
        .set_op_code(OpCode::Query)
        .set_message_type(MessageType::Query)
        .set_recursion_desired(true);
    Ok(message.to_vec()?)
}

/// Scan a DNS answer for the first HTTPS record carrying an ech
/// SvcParam (key 5) and return its value untouched.
pub fn extract_ech_config(data: &[u8]) -> Result<Vec<u8>> {
    let message = Message::from_vec(data)?;
    if message.response_code() != ResponseCode::NoError {
        return Err(Error::Dns(format!("doh answer: {:?}", message.response_code())));
    }
    for answer in message.answers() {
        if let Some(RData::HTTPS(https)) = answer.data() {
            for (_key, value) in https.0.svc_params() {
                if let SvcParamValue::EchConfig(ech) = value {
                    return Ok(ech.0.clone());
                }
            }
        }
    }
    Err(Error::Dns("no ECH config in answer".into()))
}

/// Carries raw DNS queries over one shared proxy stream, framed with a
/// 16-bit big-endian length prefix. The mutex both caches the stream
/// and serializes the framing so prefixes cannot interleave.
pub struct DnsTunnel {
    connector: Arc<dyn Connector>,
    stream: tokio::sync::Mutex<Option<ProxyStream>>,
}

impl DnsTunnel {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            stream: tokio::sync::Mutex::new(None),
        }
    }

    /// Send one query and read its answer. A broken cached connection
    /// is dropped and redialed once.
    pub async fn query(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() > u16::MAX as usize {
            return Err(Error::Dns("query exceeds 16-bit frame".into()));
        }
        let mut cached = self.stream.lock().await;
        let mut last_err = None;
        for _ in 0..TUNNEL_ATTEMPTS {
            if cached.is_none() {
                *cached = Some(self.connector.connect(DNS_REMOTE.0, DNS_REMOTE.1).await?);
                log::debug!("[DNS] tunnel connection established");
            }
            let stream = cached.as_mut().unwrap();
            match exchange(stream, packet).await {
                Ok(answer) => return Ok(answer),
                Err(e) => {
                    log::debug!("[DNS] tunnel exchange failed: {e}, reconnecting");
                    *cached = None;
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Error::from).unwrap_or_else(|| Error::Dns("tunnel exhausted".into())))
    }
}

async fn exchange<S>(stream: &mut S, packet: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&(packet.len() as u16).to_be_bytes()).await?;
    stream.write_all(packet).await?;
    stream.flush().await?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut answer = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut answer).await?;
    Ok(answer)
}

/// Serve one UDP/53 flow: every datagram is a query carried through the
/// shared tunnel; answers go back as raw datagrams. Queries that cannot
/// be satisfied are dropped and the client retries.
pub async fn serve_flow<S>(mut udp: S, tunnel: Arc<DnsTunnel>, token: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 2048];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return,
            read = tokio::time::timeout(FLOW_READ_TIMEOUT, udp.read(&mut buf)) => match read {
                Ok(Ok(n)) if n > 0 => n,
                // EOF, read error or idle deadline all destroy the flow.
                _ => return,
            },
        };
        match tunnel.query(&buf[..n]).await {
            Ok(answer) => {
                if udp.write_all(&answer).await.is_err() {
                    return;
                }
            }
            Err(e) => log::debug!("[DNS] dropped query: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn https_query_round_trips() {
        let wire = build_https_query("public.example").unwrap();
        let message = Message::from_vec(&wire).unwrap();
        let query = message.queries().first().unwrap();
        assert_eq!(query.query_type(), RecordType::HTTPS);
        assert!(message.recursion_desired());
    }

    #[test]
    fn extracts_ech_param_from_https_answer() {
        use trust_dns_proto::rr::{
            rdata::svcb::{EchConfig, SvcParamKey, SVCB},
            rdata::HTTPS,
            Record,
        };

        let mut query = build_https_query("public.example").unwrap();
        let mut message = Message::from_vec(&query).unwrap();
        message.set_message_type(MessageType::Response);
        let ech_bytes = vec![0xfe; 76];
        let svcb = SVCB::new(
            1,
            Name::from_str("public.example").unwrap(),
            vec![(
                SvcParamKey::EchConfig,
                SvcParamValue::EchConfig(EchConfig(ech_bytes.clone())),
            )],
        );
        message.add_answer(Record::from_rdata(
            Name::from_str("public.example").unwrap(),
            60,
            RData::HTTPS(HTTPS(svcb)),
        ));
        query = message.to_vec().unwrap();

        assert_eq!(extract_ech_config(&query).unwrap(), ech_bytes);
    }

    #[test]
    fn answer_without_ech_is_dns_error() {
        let mut message = Message::from_vec(&build_https_query("x.example").unwrap()).unwrap();
        message.set_message_type(MessageType::Response);
        let wire = message.to_vec().unwrap();
        assert!(matches!(extract_ech_config(&wire), Err(Error::Dns(_))));
    }

    /// Hands out scripted streams and counts how many were dialed.
    struct ScriptedConnector {
        streams: std::sync::Mutex<Vec<ProxyStream>>,
        dialed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<ProxyStream> {
            self.dialed.fetch_add(1, Ordering::SeqCst);
            self.streams
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::Dial("script exhausted".into()))
        }
    }

    /// DNS-over-TCP style server on the far side of a duplex pipe.
    fn framed_echo_server(answer: &'static [u8]) -> ProxyStream {
        let (near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            loop {
                let mut len = [0u8; 2];
                if far.read_exact(&mut len).await.is_err() {
                    return;
                }
                let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
                if far.read_exact(&mut query).await.is_err() {
                    return;
                }
                let mut frame = (answer.len() as u16).to_be_bytes().to_vec();
                frame.extend_from_slice(answer);
                if far.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });
        Box::new(near)
    }

    #[tokio::test]
    async fn query_reuses_one_connection() {
        let connector = Arc::new(ScriptedConnector {
            streams: std::sync::Mutex::new(vec![framed_echo_server(b"answer")]),
            dialed: AtomicUsize::new(0),
        });
        let tunnel = DnsTunnel::new(connector.clone());

        for _ in 0..3 {
            assert_eq!(tunnel.query(b"query").await.unwrap(), b"answer");
        }
        assert_eq!(connector.dialed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_connection_is_redialed_once() {
        let (dead, far) = tokio::io::duplex(64);
        drop(far); // immediate EOF on first use
        let connector = Arc::new(ScriptedConnector {
            // Popped back to front: dead stream first, then a live one.
            streams: std::sync::Mutex::new(vec![framed_echo_server(b"ok"), Box::new(dead)]),
            dialed: AtomicUsize::new(0),
        });
        let tunnel = DnsTunnel::new(connector.clone());

        assert_eq!(tunnel.query(b"query").await.unwrap(), b"ok");
        assert_eq!(connector.dialed.load(Ordering::SeqCst), 2);
    }
}
