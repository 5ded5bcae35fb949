use rand::Rng;
use std::{
    future::Future,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Minimum payload size that triggers the split. Shorter records are not
/// ClientHellos worth hiding and some middleboxes choke on tiny segments.
const MIN_SPLIT_LEN: usize = 50;
/// TLS Handshake record content type.
const TLS_HANDSHAKE: u8 = 0x16;

enum FragmentState {
    /// Waiting for the first long handshake record.
    Armed,
    /// First half written; pause before releasing the remainder.
    Pausing(Pin<Box<tokio::time::Sleep>>),
    /// Shim spent; all writes pass through untouched.
    Passthrough,
}

/// One-shot TLS-record fragmenter.
///
/// The first write longer than 50 bytes that starts a TLS Handshake
/// record is emitted as two TCP writes cut at a random offset in `[5,15)`
/// with a `[0,5)` ms pause in between. Everything else, and every write
/// after the first split, passes straight through.
pub struct FragmentStream<S> {
    inner: S,
    state: FragmentState,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: FragmentState::Armed,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match &mut this.state {
            FragmentState::Armed => {
                if buf.len() > MIN_SPLIT_LEN && buf[0] == TLS_HANDSHAKE {
                    let cut = rand::thread_rng().gen_range(5..15).min(buf.len());
                    match Pin::new(&mut this.inner).poll_write(cx, &buf[..cut]) {
                        Poll::Ready(Ok(n)) => {
                            let pause = Duration::from_millis(rand::thread_rng().gen_range(0..5));
                            this.state = FragmentState::Pausing(Box::pin(tokio::time::sleep(pause)));
                            // The caller re-enters with the remainder,
                            // which Pausing releases as the second write.
                            Poll::Ready(Ok(n))
                        }
                        other => other,
                    }
                } else {
                    this.state = FragmentState::Passthrough;
                    Pin::new(&mut this.inner).poll_write(cx, buf)
                }
            }
            FragmentState::Pausing(sleep) => {
                ready!(sleep.as_mut().poll(cx));
                this.state = FragmentState::Passthrough;
                Pin::new(&mut this.inner).poll_write(cx, buf)
            }
            FragmentState::Passthrough => Pin::new(&mut this.inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
