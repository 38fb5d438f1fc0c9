//! Length-prefixed message framing with random padding.
//!
//! Every datagram carried over the pipe is packed as
//! `u16 body_len | body | u16 pad_len | padding` (big-endian lengths).
//! Padding hides the real datagram sizes from a passive observer: short
//! bodies get heavier padding, and no message ever goes out unpadded.

use std::io;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Maximum body length that is safe to carry in a single message.
pub const MAX_MESSAGE_LENGTH: usize = 1320;

/// Messages shorter than this are padded up to roughly this size.
pub const MIN_MESSAGE_LENGTH: usize = 100;

/// Upper bound for the random padding appended to every message.
pub const MAX_PADDING_LENGTH: usize = 256;

/// Picks a padding length for a body of `body_len` bytes.
///
/// The result is uniform in `[max(1, MIN_MESSAGE_LENGTH - body_len),
/// MAX_PADDING_LENGTH]`, so padding is never empty.
fn padding_len(body_len: usize) -> usize {
    let min = MIN_MESSAGE_LENGTH.saturating_sub(body_len).max(1);
    let max = if MAX_PADDING_LENGTH <= min {
        min + 1
    } else {
        MAX_PADDING_LENGTH
    };

    OsRng.gen_range(min..=max)
}

/// Packs `body` into its wire form with fresh random padding.
pub fn encode(body: &[u8]) -> Vec<u8> {
    let pad_len = padding_len(body.len());
    let mut padding = vec![0u8; pad_len];
    OsRng.fill_bytes(&mut padding);

    let mut msg = Vec::with_capacity(body.len() + pad_len + 4);
    msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
    msg.extend_from_slice(body);
    msg.extend_from_slice(&(pad_len as u16).to_be_bytes());
    msg.extend_from_slice(&padding);

    msg
}

/// Reads framed messages from a byte stream and yields body bytes only.
pub struct MsgReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> MsgReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one 2-byte prefixed chunk from the stream.
    async fn read_prefixed(&mut self) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_LENGTH {
            // Keep draining the stream anyway, otherwise it desynchronizes.
            warn!(
                "received message of length {} larger than {}, consider reducing the MTU",
                len, MAX_MESSAGE_LENGTH
            );
        }

        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;

        Ok(buf)
    }

    /// Reads the next message and copies its body into `buf`.
    ///
    /// One message maps to exactly one read: if `buf` cannot hold the whole
    /// body, the call fails. Padding is consumed and discarded either way.
    pub async fn read_msg(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let body = self.read_prefixed().await?;

        // The padding always follows the body and must be drained even when
        // the caller's buffer is already full.
        let _ = self.read_prefixed().await?;

        if buf.len() < body.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "message length {} is greater than the buffer size {}",
                    body.len(),
                    buf.len()
                ),
            ));
        }

        buf[..body.len()].copy_from_slice(&body);

        Ok(body.len())
    }
}

/// Writes framed messages to a byte stream, one wire message per call.
pub struct MsgWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MsgWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_msg(&mut self, body: &[u8]) -> io::Result<()> {
        let msg = encode(body);
        self.inner.write_all(&msg).await?;
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_all_body_sizes() {
        for size in [0usize, 1, 50, 99, 100, 101, 500, 1319, 1320] {
            let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

            let mut wire = Vec::new();
            MsgWriter::new(&mut wire).write_msg(&body).await.unwrap();

            let mut buf = vec![0u8; MAX_MESSAGE_LENGTH];
            let n = MsgReader::new(wire.as_slice())
                .read_msg(&mut buf)
                .await
                .unwrap();

            assert_eq!(n, size);
            assert_eq!(&buf[..n], &body[..]);
        }
    }

    #[tokio::test]
    async fn test_padding_bounds() {
        for size in [0usize, 1, 42, 99, 100, 200, 1320] {
            let body = vec![0xAB; size];
            let wire = encode(&body);

            let body_len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
            assert_eq!(body_len, size);

            let pad_off = 2 + body_len;
            let pad_len =
                u16::from_be_bytes([wire[pad_off], wire[pad_off + 1]]) as usize;

            let expected_min = MIN_MESSAGE_LENGTH.saturating_sub(size).max(1);
            assert!(pad_len >= expected_min, "padding {pad_len} below {expected_min}");
            assert!(pad_len <= MAX_PADDING_LENGTH);

            assert_eq!(wire.len(), body_len + pad_len + 4);
        }
    }

    #[tokio::test]
    async fn test_padding_never_zero() {
        // Bodies at or above the minimum size still get at least one byte.
        for _ in 0..100 {
            let body = vec![0u8; MIN_MESSAGE_LENGTH + 10];
            let wire = encode(&body);
            let pad_off = 2 + body.len();
            let pad_len =
                u16::from_be_bytes([wire[pad_off], wire[pad_off + 1]]) as usize;
            assert!(pad_len >= 1);
        }
    }

    #[tokio::test]
    async fn test_sequential_messages_stay_aligned() {
        let mut wire = Vec::new();
        {
            let mut w = MsgWriter::new(&mut wire);
            for i in 0..10u8 {
                w.write_msg(&[i; 32]).await.unwrap();
            }
        }

        // Padding of each message must be fully consumed before the next one.
        let mut r = MsgReader::new(wire.as_slice());
        for i in 0..10u8 {
            let mut buf = [0u8; 64];
            let n = r.read_msg(&mut buf).await.unwrap();
            assert_eq!(n, 32);
            assert!(buf[..n].iter().all(|&b| b == i));
        }
    }

    #[tokio::test]
    async fn test_short_buffer_fails() {
        let mut wire = Vec::new();
        MsgWriter::new(&mut wire).write_msg(&[7u8; 64]).await.unwrap();

        let mut buf = [0u8; 16];
        let err = MsgReader::new(wire.as_slice())
            .read_msg(&mut buf)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_stream_fails() {
        let mut wire = Vec::new();
        MsgWriter::new(&mut wire).write_msg(b"hello").await.unwrap();
        wire.truncate(wire.len() - 3);

        let mut buf = [0u8; 64];
        let err = MsgReader::new(wire.as_slice())
            .read_msg(&mut buf)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
