use crate::{config::NodeConfig, Error, Result};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    tungstenite::{handshake::client::Request, protocol::WebSocketConfig, Message},
    WebSocketStream as TungsteniteStream,
};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

/// Upgrade `stream` to WebSocket per the node's transport settings and
/// return it wrapped as a plain byte stream. tungstenite rejects any
/// response other than 101 during the handshake.
pub async fn upgrade<S>(node: &NodeConfig, stream: S) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = node.effective_server_name();
    let path = &node.transport.path;
    let uri = format!("ws://{host}{path}");

    let key = {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64::engine::general_purpose::STANDARD.encode(bytes)
    };

    let mut builder = Request::get(uri.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", key)
        .header("Sec-WebSocket-Version", "13")
        .header("User-Agent", USER_AGENT);
    for (name, value) in &node.transport.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let request = builder
        .body(())
        .map_err(|e| Error::Transport(format!("upgrade request: {e}")))?;

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(64 * 1024 * 1024);
    config.max_frame_size = Some(16 * 1024 * 1024);

    let (inner, response) = tokio_tungstenite::client_async_with_config(request, stream, Some(config))
        .await
        .map_err(|e| Error::Transport(format!("upgrade: {e}")))?;
    log::debug!("[WS] upgraded {host}{path}, status {}", response.status());

    Ok(WsStream::new(inner))
}

/// Byte-stream view of a WebSocket connection.
///
/// Writes become masked binary frames (tungstenite masks every
/// client-side frame). Reads concatenate Text/Binary/Continuation
/// payloads, silently consume Ping/Pong, and report EOF on Close.
pub struct WsStream<S> {
    inner: TungsteniteStream<S>,
    read_buffer: Vec<u8>,
    read_offset: usize,
}

impl<S> WsStream<S> {
    pub(crate) fn new(inner: TungsteniteStream<S>) -> Self {
        Self {
            inner,
            read_buffer: Vec::new(),
            read_offset: 0,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.read_offset < self.read_buffer.len() {
                let remaining = &self.read_buffer[self.read_offset..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                self.read_offset += to_copy;
                if self.read_offset >= self.read_buffer.len() {
                    self.read_buffer.clear();
                    self.read_offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Close(_) => return Poll::Ready(Ok(())),
                        // Pong replies are queued by tungstenite itself.
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Frame(_) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "unexpected raw frame",
                            )))
                        }
                    };
                    if data.is_empty() {
                        continue;
                    }
                    let to_copy = data.len().min(buf.remaining());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        self.read_buffer = data[to_copy..].to_vec();
                        self.read_offset = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(format!("websocket read: {e}"))))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => match self.inner.start_send_unpin(Message::Binary(buf.to_vec())) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(io::Error::other(format!("websocket send: {e}")))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(format!("websocket: {e}")))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner
            .poll_flush_unpin(cx)
            .map_err(|e| io::Error::other(format!("websocket flush: {e}")))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner
            .poll_close_unpin(cx)
            .map_err(|e| io::Error::other(format!("websocket close: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echo server that also interleaves a Ping before every echo.
    async fn echo_with_pings(stream: tokio::io::DuplexStream) {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Binary(data) => {
                    ws.send(Message::Ping(b"keepalive".to_vec())).await.unwrap();
                    ws.send(Message::Binary(data)).await.unwrap();
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    }

    async fn client(stream: tokio::io::DuplexStream) -> WsStream<tokio::io::DuplexStream> {
        let request = Request::get("ws://echo.test/")
            .header("Host", "echo.test")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .body(())
            .unwrap();
        let (inner, _) = tokio_tungstenite::client_async(request, stream).await.unwrap();
        WsStream::new(inner)
    }

    #[tokio::test]
    async fn echo_round_trip_with_interleaved_ping() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(echo_with_pings(b));
        let ws = client(a).await;

        let mut payload = vec![0u8; 300 * 1024];
        rand::thread_rng().fill(payload.as_mut_slice());

        let (mut rd, mut wr) = tokio::io::split(ws);
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            wr.write_all(&sent).await.unwrap();
            wr.flush().await.unwrap();
        });

        let mut echoed = vec![0u8; payload.len()];
        rd.read_exact(&mut echoed).await.unwrap();
        writer.await.unwrap();
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn close_frame_reads_as_eof() {
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(b).await.unwrap();
            ws.send(Message::Binary(b"tail".to_vec())).await.unwrap();
            ws.close(None).await.unwrap();
        });
        let mut ws = client(a).await;

        let mut buf = Vec::new();
        ws.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"tail");
    }
}
