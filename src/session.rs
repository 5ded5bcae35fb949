use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Per-direction copy buffer.
const RELAY_BUFFER: usize = 16 * 1024;

/// Couple a TUN-side stream with its outbound counterpart.
///
/// Each direction gets its own copier; when one side reaches EOF only
/// the peer's write half is shut down, so the opposite direction keeps
/// flowing until the peer is done answering. A full close on first EOF
/// would cut off responses still in flight. Both copiers finish before
/// either stream is released; a copier error tears the whole session
/// down (dropping both streams hard-closes them).
pub async fn relay<A, B>(inbound: A, outbound: B, token: CancellationToken) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (in_rd, mut in_wr) = tokio::io::split(inbound);
    let (out_rd, mut out_wr) = tokio::io::split(outbound);

    let upload = async {
        let mut rd = BufReader::with_capacity(RELAY_BUFFER, in_rd);
        let sent = tokio::io::copy_buf(&mut rd, &mut out_wr).await?;
        out_wr.shutdown().await?;
        Ok::<u64, io::Error>(sent)
    };
    let download = async {
        let mut rd = BufReader::with_capacity(RELAY_BUFFER, out_rd);
        let received = tokio::io::copy_buf(&mut rd, &mut in_wr).await?;
        in_wr.shutdown().await?;
        Ok::<u64, io::Error>(received)
    };

    tokio::select! {
        result = async { tokio::try_join!(upload, download) } => result,
        _ = token.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "session cancelled")),
    }
}
