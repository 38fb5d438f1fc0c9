//! Byte-stream view over a WebSocket connection.
//!
//! The pipe speaks binary WebSocket frames on the TLS side. [`WsReader`] and
//! [`WsWriter`] expose the frame sequence as a plain byte stream so the
//! framed codec and the tunnel copier can stay transport-agnostic: partial
//! frames are joined transparently on read, and every write goes out as one
//! binary frame.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Any bidirectional transport the pipe can run WebSocket over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A WebSocket connection over an erased transport.
pub type WsStream = WebSocketStream<Box<dyn Transport>>;

/// Splits an upgraded connection into byte-stream halves.
pub fn split_ws(ws: WsStream) -> (WsReader, WsWriter) {
    let (sink, stream) = ws.split();
    (
        WsReader {
            inner: stream,
            remainder: Vec::new(),
        },
        WsWriter { inner: sink },
    )
}

fn ws_err(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Reads binary frame payloads as a contiguous byte stream.
pub struct WsReader {
    inner: SplitStream<WsStream>,
    remainder: Vec<u8>,
}

impl WsReader {
    fn drain_remainder(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let n = self.remainder.len().min(buf.remaining());
        buf.put_slice(&self.remainder[..n]);
        self.remainder.drain(..n);
        n
    }
}

impl AsyncRead for WsReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.remainder.is_empty() {
            self.drain_remainder(buf);
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    debug!("received WebSocket frame len={}", data.len());
                    self.remainder = data;
                    self.drain_remainder(buf);
                    return Poll::Ready(Ok(()));
                }
                // Control and text frames carry no tunnel payload.
                Poll::Ready(Some(Ok(Message::Ping(_))))
                | Poll::Ready(Some(Ok(Message::Pong(_))))
                | Poll::Ready(Some(Ok(Message::Text(_))))
                | Poll::Ready(Some(Ok(Message::Frame(_)))) => continue,
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(ws_err(err))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Writes each buffer as a single binary frame.
pub struct WsWriter {
    inner: SplitSink<WsStream, Message>,
}

impl AsyncWrite for WsWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(ws_err(err))),
            Poll::Pending => return Poll::Pending,
        }

        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_err)?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_err)
    }
}

/// A transport that replays already-consumed bytes before the live stream.
///
/// The server-side upgrade reads the first HTTP request off the TLS
/// connection to authenticate it. Whatever happens next (WebSocket handshake
/// or probe response) needs those bytes back, so the original stream is
/// recomposed from the captured prefix plus the live connection.
pub struct RewindStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> RewindStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let n = (self.prefix.len() - self.offset).min(buf.remaining());
            let offset = self.offset;
            buf.put_slice(&self.prefix[offset..offset + n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_stream_replays_prefix() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b" world").await.unwrap();

        let mut rewound = RewindStream::new(b"hello".to_vec(), client);
        let mut buf = [0u8; 11];
        rewound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_rewind_stream_partial_prefix_reads() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut rewound = RewindStream::new(b"abcdef".to_vec(), client);

        let mut buf = [0u8; 2];
        for expected in [b"ab", b"cd", b"ef"] {
            rewound.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, expected);
        }
    }

    #[tokio::test]
    async fn test_ws_roundtrip_joins_partial_reads() {
        let (a, b) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(Box::new(a) as Box<dyn Transport>)
                .await
                .unwrap();
            let (mut reader, mut writer) = split_ws(ws);

            let mut buf = [0u8; 300];
            reader.read_exact(&mut buf).await.unwrap();
            writer.write_all(&buf).await.unwrap();
            writer.flush().await.unwrap();
        });

        let (ws, _) = tokio_tungstenite::client_async(
            "ws://localhost/",
            Box::new(b) as Box<dyn Transport>,
        )
        .await
        .unwrap();
        let (mut reader, mut writer) = split_ws(ws);

        let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        writer.write_all(&payload).await.unwrap();
        writer.flush().await.unwrap();

        // Read the echo back in small chunks to exercise the remainder path.
        let mut echoed = vec![0u8; 300];
        let mut read = 0;
        while read < echoed.len() {
            let n = reader.read(&mut echoed[read..(read + 7).min(300)]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(echoed, payload);

        server.await.unwrap();
    }
}
