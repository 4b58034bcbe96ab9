//! Adapts a browser WebSocket into the same byte-oriented connection interface as a raw p2p
//! stream, for clients that cannot negotiate HTTP/2 framing directly on a libp2p stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{self, WebSocket};
use bridge_io::FrameStream;
use bytes::Bytes;
use futures::{ready, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};

fn to_io_error(error: axum::Error) -> io::Error {
    io::Error::other(error)
}

struct WebSocketFrames {
    inner: WebSocket,
}

impl Stream for WebSocketFrames {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(ws::Message::Binary(data))) => Poll::Ready(Some(Ok(data))),
                Some(Ok(ws::Message::Text(text))) => Poll::Ready(Some(Ok(text.into_bytes().into()))),
                Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => continue,
                Some(Ok(ws::Message::Close(_))) | None => Poll::Ready(None),
                Some(Err(error)) => Poll::Ready(Some(Err(to_io_error(error)))),
            };
        }
    }
}

impl Sink<Bytes> for WebSocketFrames {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(to_io_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(ws::Message::Binary(item))
            .map_err(to_io_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(to_io_error)
    }
}

pub fn websocket_compat(ws: WebSocket) -> impl AsyncRead + AsyncWrite + Unpin + Send + 'static {
    FrameStream::new(WebSocketFrames { inner: ws })
}
