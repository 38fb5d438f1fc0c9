//! Connection-oriented view over a single UDP socket.
//!
//! A [`UdpListener`] keeps a nat-like table mapping peer addresses to
//! [`UdpConn`] objects. Whenever a datagram arrives from an unknown peer, a
//! new connection is created and handed out through `accept`, so the rest of
//! the pipe can treat UDP and TLS listeners uniformly.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

/// Bound for both the accept queue and each connection's inbound queue.
const QUEUE_SIZE: usize = 256;

/// Peer state tracked by the listener read loop.
struct ConnHandle {
    inbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

/// Accept-based listener over one shared UDP socket.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    accept_rx: mpsc::Receiver<UdpConn>,
    closed: CancellationToken,
}

impl UdpListener {
    /// Binds the socket and starts the read loop.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind UDP listener on {addr}"))?,
        );

        let closed = CancellationToken::new();
        let (accept_tx, accept_rx) = mpsc::channel(QUEUE_SIZE);

        tokio::spawn(read_loop(
            Arc::clone(&socket),
            accept_tx,
            closed.clone(),
        ));

        Ok(Self {
            socket,
            accept_rx,
            closed,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next virtual connection.
    pub async fn accept(&mut self) -> io::Result<UdpConn> {
        if self.closed.is_cancelled() {
            return Err(closed_err());
        }

        tokio::select! {
            conn = self.accept_rx.recv() => conn.ok_or_else(closed_err),
            _ = self.closed.cancelled() => Err(closed_err()),
        }
    }

    /// Closes the listener and every connection it has handed out.
    pub fn close(&self) {
        // Connection tokens are children of this one, so a single cancel
        // unblocks every pending read and the accept loop.
        self.closed.cancel();
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Receives datagrams and routes them to per-peer connections.
///
/// The peer table is owned by this task alone, so no lock is needed; the
/// connections it creates are unblocked on shutdown through child tokens.
async fn read_loop(
    socket: Arc<UdpSocket>,
    accept_tx: mpsc::Sender<UdpConn>,
    closed: CancellationToken,
) {
    let mut table: HashMap<SocketAddr, ConnHandle> = HashMap::new();
    let mut buf = vec![0u8; 65536];

    loop {
        let (n, peer) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(recv) => recv,
                Err(err) => {
                    debug!("UDP listener read loop exiting: {err}");
                    return;
                }
            },
            _ = closed.cancelled() => return,
        };

        if n == 0 {
            continue;
        }

        let msg = buf[..n].to_vec();

        let needs_new = match table.get(&peer) {
            Some(handle) => handle.closed.is_cancelled(),
            None => true,
        };

        if needs_new {
            debug!("new UDP peer {peer}");

            let conn_closed = closed.child_token();
            let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_SIZE);

            let conn = UdpConn {
                peer,
                socket: Arc::clone(&socket),
                inbound: inbound_rx,
                remainder: Vec::new(),
                closed: conn_closed.clone(),
                closed_wait: None,
            };

            table.insert(
                peer,
                ConnHandle {
                    inbound: inbound_tx,
                    closed: conn_closed,
                },
            );

            if accept_tx.send(conn).await.is_err() {
                return;
            }
        }

        if let Some(handle) = table.get(&peer) {
            // A full queue applies backpressure to the whole read loop, the
            // same way a full accept queue does.
            if handle.inbound.send(msg).await.is_err() {
                table.remove(&peer);
            }
        }
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

/// One peer's view of the shared socket.
///
/// Reads are datagram-preserving: a read never returns bytes from more than
/// one datagram, and a datagram larger than the caller's buffer is handed out
/// across consecutive reads.
#[derive(Debug)]
pub struct UdpConn {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    inbound: mpsc::Receiver<Vec<u8>>,
    remainder: Vec<u8>,
    closed: CancellationToken,
    closed_wait: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl UdpConn {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Marks the connection closed and wakes any pending read.
    ///
    /// The shared socket stays open; it belongs to the listener.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn drain_remainder(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let n = self.remainder.len().min(buf.remaining());
        buf.put_slice(&self.remainder[..n]);
        self.remainder.drain(..n);
        n
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Leftovers from a previous oversized datagram go out first.
        if !self.remainder.is_empty() {
            self.drain_remainder(buf);
            return Poll::Ready(Ok(()));
        }

        if self.closed.is_cancelled() {
            return Poll::Ready(Err(closed_err()));
        }

        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(msg)) => {
                self.remainder = msg;
                self.drain_remainder(buf);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Err(closed_err())),
            Poll::Pending => {
                let closed = self.closed.clone();
                let wait = self
                    .closed_wait
                    .get_or_insert_with(|| Box::pin(closed.cancelled_owned()));

                match wait.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(closed_err())),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send_to(cx, buf, self.peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed.cancel();
        Poll::Ready(Ok(()))
    }
}

/// A UDP socket connected to one destination, with stream-style IO.
///
/// Used for the destination side of a server-mode pipe, where each tunnel
/// message maps to one datagram towards the real endpoint.
pub struct ConnectedUdp {
    socket: UdpSocket,
}

impl ConnectedUdp {
    pub async fn connect(dest: &str) -> Result<Self> {
        let resolved = tokio::net::lookup_host(dest)
            .await
            .with_context(|| format!("failed to resolve destination {dest}"))?
            .next()
            .with_context(|| format!("destination {dest} did not resolve"))?;

        let bind_addr = if resolved.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind an outbound UDP socket")?;
        socket
            .connect(resolved)
            .await
            .with_context(|| format!("failed to connect UDP socket to {dest}"))?;

        Ok(Self { socket })
    }
}

impl AsyncRead for ConnectedUdp {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for ConnectedUdp {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
