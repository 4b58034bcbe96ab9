//! Length-delimited framing (u32-BE prefix) over a raw byte stream, for the "web-stream envelope"
//! application protocol: a second negotiated protocol id used by browser clients that can open a
//! libp2p stream but cannot frame HTTP/2 on it directly, so they send explicit frame boundaries
//! instead and rely on the far end to reassemble a continuous byte stream from them.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{ready, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const LENGTH_PREFIX_BYTES: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

/// Decodes/encodes `u32`-BE length-prefixed frames over any `T: AsyncRead + AsyncWrite`. Pair with
/// [`crate::FrameStream`] to get back an `AsyncRead`/`AsyncWrite` view once framing is applied.
pub struct EnvelopeFrames<T> {
    inner: T,
    read_buf: BytesMut,
    pending_len: Option<usize>,
    write_buf: BytesMut,
}

impl<T> EnvelopeFrames<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
            pending_len: None,
            write_buf: BytesMut::new(),
        }
    }
}

impl<T> Stream for EnvelopeFrames<T>
where
    T: AsyncRead + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.pending_len.is_none() && this.read_buf.len() >= LENGTH_PREFIX_BYTES {
                let len = u32::from_be_bytes(this.read_buf[..LENGTH_PREFIX_BYTES].try_into().unwrap());
                this.read_buf.advance(LENGTH_PREFIX_BYTES);
                this.pending_len = Some(len as usize);
            }

            if let Some(len) = this.pending_len {
                if this.read_buf.len() >= len {
                    let frame = this.read_buf.split_to(len).freeze();
                    this.pending_len = None;
                    return Poll::Ready(Some(Ok(frame)));
                }
            }

            let mut chunk = [0_u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            if let Err(error) = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf)) {
                return Poll::Ready(Some(Err(error)));
            }
            let filled = read_buf.filled();

            if filled.is_empty() {
                return if this.read_buf.is_empty() && this.pending_len.is_none() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "envelope stream closed mid-frame"))))
                };
            }

            this.read_buf.extend_from_slice(filled);
        }
    }
}

impl<T> Sink<Bytes> for EnvelopeFrames<T>
where
    T: AsyncWrite + Unpin,
{
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let this = self.get_mut();
        this.write_buf.extend_from_slice(&(item.len() as u32).to_be_bytes());
        this.write_buf.extend_from_slice(&item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();

        while !this.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.write_buf))?;
            this.write_buf.advance(n);
        }

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt as _, StreamExt as _};
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_frame_through_a_duplex_pipe() {
        let (client, server) = duplex(256);

        let mut writer = EnvelopeFrames::new(client);
        let mut reader = EnvelopeFrames::new(server);

        writer.send(Bytes::from_static(b"hello")).await.unwrap();

        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame, Bytes::from_static(b"hello"));
    }
}
