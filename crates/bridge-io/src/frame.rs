//! Adapts a message-oriented `Sink`/`Stream` pair of byte frames into `AsyncRead`/`AsyncWrite`.
//!
//! Generalizes the WebSocket-to-stream compatibility shim used elsewhere in this lineage: instead
//! of being specific to `tungstenite::Message`, this works over any `Bytes` frame, so the same
//! adapter backs both a real WebSocket (browser client) and a length-delimited codec running over
//! a raw libp2p stream (the "web-stream envelope" variant, for clients that cannot frame HTTP/2
//! directly on a p2p stream).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, pin_mut, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps a frame `Sink`/`Stream` and implements `AsyncRead`/`AsyncWrite` over it.
///
/// One inbound frame may be split across several `poll_read` calls if the caller's buffer is
/// smaller than the frame; outbound writes are always sent as exactly one frame per `poll_write`
/// call (never split or coalesced), since each frame boundary is meaningful to the counterpart on
/// the other application protocol.
pub struct FrameStream<S> {
    inner: S,
    read_buf: Option<Bytes>,
}

impl<S> FrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, read_buf: None }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for FrameStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut data = if let Some(data) = self.read_buf.take() {
            data
        } else {
            let inner = &mut self.inner;
            pin_mut!(inner);
            match ready!(inner.poll_next(cx)) {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => return Poll::Ready(Err(error)),
                None => return Poll::Ready(Ok(())),
            }
        };

        let n = std::cmp::min(buf.remaining(), data.len());
        buf.initialize_unfilled_to(n).copy_from_slice(&data[..n]);
        buf.advance(n);

        if data.len() > n {
            self.read_buf = Some(data.split_off(n));
        }

        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for FrameStream<S>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let inner = &mut self.inner;
        pin_mut!(inner);
        ready!(inner.as_mut().poll_ready(cx))?;
        inner.start_send(Bytes::copy_from_slice(buf))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let inner = &mut self.inner;
        pin_mut!(inner);
        inner.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let inner = &mut self.inner;
        pin_mut!(inner);
        inner.poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn read_splits_single_frame_across_small_buffers() {
        let frames = stream::iter(vec![Ok(Bytes::from_static(b"hello world"))]);
        let mut fs = FrameStream::new(frames);

        let mut out = [0_u8; 4];
        let n = fs.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"hell");

        let mut rest = Vec::new();
        fs.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"o world");
    }

    #[tokio::test]
    async fn read_returns_eof_on_stream_end() {
        let frames = stream::iter(Vec::<io::Result<Bytes>>::new());
        let mut fs = FrameStream::new(frames);
        let mut out = [0_u8; 16];
        let n = fs.read(&mut out).await.unwrap();
        assert_eq!(n, 0);
    }
}
