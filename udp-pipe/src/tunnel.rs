//! Bidirectional copying between the two ends of a pipe connection.
//!
//! Exactly one side of every tunnel speaks the framed message format; which
//! side depends on the pipe mode. In server mode the accepted TLS/WebSocket
//! connection is framed and the UDP destination is raw; in client mode the
//! accepted UDP connection is raw and the dialed TLS/WebSocket destination is
//! framed.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{MsgReader, MsgWriter};

const COPY_BUF_SIZE: usize = 65536;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reading end of one tunnel side.
pub enum ReadEnd {
    Raw(BoxedReader),
    Framed(MsgReader<BoxedReader>),
}

impl ReadEnd {
    pub fn raw<R: AsyncRead + Send + Unpin + 'static>(inner: R) -> Self {
        Self::Raw(Box::new(inner))
    }

    pub fn framed<R: AsyncRead + Send + Unpin + 'static>(inner: R) -> Self {
        Self::Framed(MsgReader::new(Box::new(inner)))
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(r) => r.read(buf).await,
            Self::Framed(r) => r.read_msg(buf).await,
        }
    }
}

/// Writing end of one tunnel side.
pub enum WriteEnd {
    Raw(BoxedWriter),
    Framed(MsgWriter<BoxedWriter>),
}

impl WriteEnd {
    pub fn raw<W: AsyncWrite + Send + Unpin + 'static>(inner: W) -> Self {
        Self::Raw(Box::new(inner))
    }

    pub fn framed<W: AsyncWrite + Send + Unpin + 'static>(inner: W) -> Self {
        Self::Framed(MsgWriter::new(Box::new(inner)))
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Raw(w) => {
                w.write_all(buf).await?;
                w.flush().await
            }
            Self::Framed(w) => w.write_msg(buf).await,
        }
    }
}

/// Copies data between both sides until EOF, error, or cancellation.
///
/// Both halves run concurrently; when either one stops, the other is
/// cancelled so the call returns with the whole pipe torn down.
pub async fn tunnel(
    name: String,
    src: (ReadEnd, WriteEnd),
    dst: (ReadEnd, WriteEnd),
    cancel: CancellationToken,
) {
    let halves_done = cancel.child_token();
    let (src_r, src_w) = src;
    let (dst_r, dst_w) = dst;

    let up = tokio::spawn(half(
        format!("{name} left->right"),
        src_r,
        dst_w,
        halves_done.clone(),
    ));
    let down = tokio::spawn(half(
        format!("{name} left<-right"),
        dst_r,
        src_w,
        halves_done.clone(),
    ));

    let _ = tokio::join!(up, down);
}

/// Copies one direction until it stops, then cancels the sibling half.
async fn half(name: String, mut r: ReadEnd, mut w: WriteEnd, done: CancellationToken) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    loop {
        let n = tokio::select! {
            res = r.read(&mut buf) => match res {
                Ok(0) => {
                    debug!("{name}: end of stream");
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    debug!("{name}: failed to read: {err}");
                    break;
                }
            },
            _ = done.cancelled() => break,
        };

        debug!("{name}: copying {n} bytes");

        if let Err(err) = w.write(&buf[..n]).await {
            debug!("{name}: failed to write: {err}");
            break;
        }
    }

    done.cancel();
}
