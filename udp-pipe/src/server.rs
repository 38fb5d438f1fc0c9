//! The pipe server: accepts on one side, dials the other, tunnels between.
//!
//! In server mode the listener is TLS: accepted connections must complete a
//! WebSocket upgrade carrying the right password, everything else goes to the
//! probe responder. In client mode the listener is the UDP pseudo-listener
//! and the destination is a pipe server reached over TLS + WebSocket.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use futures_util::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::dialer::Dialer;
use crate::probe::{self, ProbeProxy};
use crate::tls;
use crate::tunnel::{self, ReadEnd, WriteEnd};
use crate::udp::{ConnectedUdp, UdpConn, UdpListener};
use crate::ws::{split_ws, RewindStream, Transport, WsStream};

/// Time budget for the TLS handshake plus the WebSocket upgrade.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for the first HTTP request head read off a connection.
const MAX_REQUEST_HEAD: usize = 16384;

/// Pipe server configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Address (`ip:port`) the server listens on: TLS in server mode, UDP in
    /// client mode.
    pub listen_addr: String,
    /// Address (`host:port`) the server connects to: UDP in server mode, a
    /// pipe server over TLS in client mode.
    pub destination_addr: String,
    /// Shared secret; when set, it also arms active-probing protection.
    pub password: String,
    /// Server mode accepts TLS and dials UDP; client mode is the reverse.
    pub server_mode: bool,
    /// Optional upstream proxy for the destination dial.
    pub proxy_url: Option<String>,
    /// Verify the pipe server certificate in client mode.
    pub verify_certificate: bool,
    /// SNI for the ClientHello and the stub certificate subject.
    pub tls_server_name: Option<String>,
    /// Server-mode certificate override.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Decoy origin for unauthenticated requests and probes.
    pub probe_reverse_proxy_url: Option<String>,
}

/// State shared by the accept loop and all connection workers.
struct Shared {
    destination_addr: String,
    password: String,
    sni: String,
    dialer: Dialer,
    tls_client: Option<TlsConnector>,
    probe_proxy: Option<ProbeProxy>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// A pipe instance, either in server or in client mode.
pub struct Server {
    config: Config,
    sni: String,
    tls_server: Option<TlsAcceptor>,
    shared: Option<Arc<Shared>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.config.server_mode {
            write!(
                f,
                "tls://{} <-> udp://{}",
                self.config.listen_addr, self.config.destination_addr
            )
        } else {
            write!(
                f,
                "udp://{} <-> tls://{}",
                self.config.listen_addr, self.config.destination_addr
            )
        }
    }
}

impl Server {
    /// Prepares TLS material and the dialer; does not bind anything yet.
    pub fn new(config: Config) -> Result<Self> {
        let sni = match config.tls_server_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                info!(
                    "TLS server name is not configured, using {} by default",
                    tls::DEFAULT_SNI
                );
                tls::DEFAULT_SNI.to_string()
            }
        };

        let tls_server = if config.server_mode {
            let tls_config = tls::server_config(
                config.tls_cert_path.as_deref(),
                config.tls_key_path.as_deref(),
                &sni,
            )
            .context("failed to prepare TLS configuration")?;
            Some(TlsAcceptor::from(tls_config))
        } else {
            None
        };

        Ok(Self {
            config,
            sni,
            tls_server,
            shared: None,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
        })
    }

    /// Address the pipe listens on, available once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listener and starts serving connections.
    pub async fn start(&mut self) -> Result<()> {
        info!("starting the server {self}");

        if self.shared.is_some() {
            bail!("server is already started");
        }

        let probe_proxy = match self.config.probe_reverse_proxy_url.as_deref() {
            Some(url) if !url.is_empty() => Some(
                ProbeProxy::start(url, self.shutdown.clone())
                    .await
                    .context("failed to start probe reverse proxy")?,
            ),
            _ => None,
        };

        let tls_client = if self.config.server_mode {
            None
        } else {
            Some(TlsConnector::from(tls::client_config(
                self.config.verify_certificate,
            )?))
        };

        let shared = Arc::new(Shared {
            destination_addr: self.config.destination_addr.clone(),
            password: self.config.password.clone(),
            sni: self.sni.clone(),
            dialer: Dialer::from_proxy_url(self.config.proxy_url.as_deref())?,
            tls_client,
            probe_proxy,
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        });
        self.shared = Some(Arc::clone(&shared));

        if self.config.server_mode {
            let listener = TcpListener::bind(&self.config.listen_addr)
                .await
                .with_context(|| format!("failed to start pipe on {}", self.config.listen_addr))?;
            self.local_addr = Some(listener.local_addr()?);

            let acceptor = self
                .tls_server
                .clone()
                .expect("server mode always has a TLS acceptor");
            self.tracker
                .spawn(serve_tls(listener, acceptor, shared));
        } else {
            let listener = UdpListener::bind(&self.config.listen_addr)
                .await
                .with_context(|| format!("failed to start pipe on {}", self.config.listen_addr))?;
            self.local_addr = Some(listener.local_addr()?);

            self.tracker.spawn(serve_udp(listener, shared));
        }

        info!("server has been started");

        Ok(())
    }

    /// Stops the pipe and waits up to `wait` for workers to drain.
    ///
    /// A timeout is reported as an error, but the server is stopped either
    /// way.
    pub async fn shutdown(&self, wait: Duration) -> Result<()> {
        info!("stopping the server {self}");

        self.shutdown.cancel();
        self.tracker.close();

        let result = tokio::time::timeout(wait, self.tracker.wait())
            .await
            .map_err(|_| anyhow::anyhow!("shutdown wait expired after {wait:?}"));

        info!("server has been stopped");

        result.map(|_| ())
    }
}

/// Accept loop for server mode (TLS listener).
async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) if is_transient(&err) => continue,
                Err(err) => {
                    error!("exit serve loop due to: {err}");
                    return;
                }
            },
        };

        debug!("accepted new connection from {peer}");

        let shared_conn = Arc::clone(&shared);
        let acceptor = acceptor.clone();
        shared.tracker.spawn(async move {
            serve_tls_conn(shared_conn, acceptor, stream, peer).await;
        });
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

/// One accepted server-mode connection: upgrade, dial UDP, tunnel.
async fn serve_tls_conn(
    shared: Arc<Shared>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let upgrade = tokio::time::timeout(UPGRADE_TIMEOUT, async {
        let tls_stream = acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;
        upgrade_server_conn(&shared, tls_stream, peer).await
    })
    .await;

    let ws = match upgrade {
        Ok(Ok(Some(ws))) => ws,
        Ok(Ok(None)) => return, // handled by the probe responder
        Ok(Err(err)) => {
            error!("failed to accept server conn from {peer}: {err:#}");
            return;
        }
        Err(_) => {
            error!("upgrade from {peer} timed out");
            return;
        }
    };

    let dst = match ConnectedUdp::connect(&shared.destination_addr).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("failed to connect to {}: {err:#}", shared.destination_addr);
            return;
        }
    };

    // Server mode: the WebSocket side carries framed messages, the UDP side
    // carries the raw datagrams.
    let (ws_r, ws_w) = split_ws(ws);
    let (dst_r, dst_w) = tokio::io::split(dst);
    tunnel::tunnel(
        format!("tls {peer}"),
        (ReadEnd::framed(ws_r), WriteEnd::framed(ws_w)),
        (ReadEnd::raw(dst_r), WriteEnd::raw(dst_w)),
        shared.shutdown.child_token(),
    )
    .await;
}

/// Accept loop for client mode (UDP pseudo-listener).
async fn serve_udp(mut listener: UdpListener, shared: Arc<Shared>) {
    loop {
        let conn = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                listener.close();
                return;
            }
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    error!("exit serve loop due to: {err}");
                    return;
                }
            },
        };

        debug!("accepted new connection from {}", conn.peer_addr());

        let shared_conn = Arc::clone(&shared);
        shared.tracker.spawn(async move {
            serve_udp_conn(shared_conn, conn).await;
        });
    }
}

/// One accepted client-mode connection: dial TLS, upgrade, tunnel.
async fn serve_udp_conn(shared: Arc<Shared>, conn: UdpConn) {
    let peer = conn.peer_addr();

    let upgrade = tokio::time::timeout(UPGRADE_TIMEOUT, dial_and_upgrade(&shared)).await;
    let ws = match upgrade {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            error!("failed to upgrade for {peer}: {err:#}");
            return;
        }
        Err(_) => {
            error!("upgrade for {peer} timed out");
            return;
        }
    };

    // Client mode: the UDP side is raw, the dialed WebSocket side is framed.
    let (src_r, src_w) = tokio::io::split(conn);
    let (ws_r, ws_w) = split_ws(ws);
    tunnel::tunnel(
        format!("udp {peer}"),
        (ReadEnd::raw(src_r), WriteEnd::raw(src_w)),
        (ReadEnd::framed(ws_r), WriteEnd::framed(ws_w)),
        shared.shutdown.child_token(),
    )
    .await;
}

/// Dials the pipe server over TLS and performs the client-side upgrade.
async fn dial_and_upgrade(shared: &Shared) -> Result<WsStream> {
    let tcp = shared.dialer.dial(&shared.destination_addr).await?;

    let connector = shared
        .tls_client
        .as_ref()
        .expect("client mode always has a TLS connector");
    let tls_stream = connector
        .connect(tls::server_name(&shared.sni)?, tcp)
        .await
        .with_context(|| {
            format!("cannot establish connection to {}", shared.destination_addr)
        })?;

    let request = format!("wss://{}/?password={}", shared.sni, shared.password)
        .into_client_request()
        .context("failed to build the upgrade request")?;

    let (mut ws, _response) =
        tokio_tungstenite::client_async(request, Box::new(tls_stream) as Box<dyn Transport>)
            .await
            .context("failed to upgrade")?;

    // The server must not speak before the client's first message; anything
    // already queued here arrived with the handshake response.
    if let Some(early) = ws.next().now_or_never() {
        match early {
            Some(Ok(msg)) => bail!("received initial data len={} from the server", msg.len()),
            Some(Err(err)) => return Err(err).context("connection failed after upgrade"),
            None => bail!("server closed the connection during the upgrade"),
        }
    }

    Ok(ws)
}

/// First-request parse result for the server-side upgrade decision.
struct RequestHead {
    proto: String,
    is_websocket_upgrade: bool,
    password: Option<String>,
}

/// Performs the server-side upgrade with probe protection.
///
/// Returns `Ok(Some(ws))` on success and `Ok(None)` when the connection was
/// diverted to the probe responder.
async fn upgrade_server_conn<S>(
    shared: &Shared,
    mut stream: S,
    peer: SocketAddr,
) -> Result<Option<WsStream>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    debug!("upgrading connection from {peer}");

    // Everything consumed here is replayed afterwards so that either the
    // WebSocket handshake or the probe responder sees the original bytes.
    let consumed = read_request_head(&mut stream).await?;
    let head = parse_request_head(&consumed);

    let authorized = match &head {
        Some(head) => {
            head.is_websocket_upgrade
                && (shared.password.is_empty()
                    || head.password.as_deref() == Some(shared.password.as_str()))
        }
        None => false,
    };

    if !authorized {
        let proto = head
            .as_ref()
            .map(|h| h.proto.clone())
            .unwrap_or_else(|| "HTTP/1.1".to_string());
        debug!("unauthorized request from {peer}, diverting to the probe responder");

        let rewound = RewindStream::new(consumed, stream);
        probe::respond(
            rewound,
            &proto,
            shared.probe_proxy.as_ref(),
            shared.shutdown.child_token(),
        )
        .await;

        return Ok(None);
    }

    let rewound = RewindStream::new(consumed, stream);
    let ws = tokio_tungstenite::accept_async(Box::new(rewound) as Box<dyn Transport>)
        .await
        .context("failed to upgrade WebSocket")?;

    Ok(Some(ws))
}

/// Reads the first HTTP request head (through the blank line) off a stream.
///
/// Bytes past the head may be consumed too; the caller replays the whole
/// buffer, so nothing is lost.
async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut consumed = Vec::new();
    let mut chunk = [0u8; 2048];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("cannot read HTTP request")?;
        if n == 0 {
            bail!("connection closed before a full HTTP request");
        }
        consumed.extend_from_slice(&chunk[..n]);

        if find_head_end(&consumed).is_some() {
            return Ok(consumed);
        }
        if consumed.len() > MAX_REQUEST_HEAD {
            bail!("HTTP request head exceeds {MAX_REQUEST_HEAD} bytes");
        }
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parses the request line and headers of the buffered request.
fn parse_request_head(bytes: &[u8]) -> Option<RequestHead> {
    let head_end = find_head_end(bytes)?;
    let head = std::str::from_utf8(&bytes[..head_end]).ok()?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    let proto = parts.next()?.to_string();
    if !proto.starts_with("HTTP/") {
        return None;
    }

    let mut is_websocket_upgrade = false;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
            {
                is_websocket_upgrade = true;
            }
        }
    }

    Some(RequestHead {
        proto,
        is_websocket_upgrade,
        password: query_param(target, "password"),
    })
}

/// Extracts a query parameter from a request target.
fn query_param(target: &str, key: &str) -> Option<String> {
    let (_, query) = target.split_once('?')?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(bytes: &[u8]) -> Option<RequestHead> {
        parse_request_head(bytes)
    }

    #[test]
    fn test_parse_websocket_upgrade() {
        let req = b"GET /?password=123 HTTP/1.1\r\nHost: example.org\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let parsed = head(req).unwrap();
        assert!(parsed.is_websocket_upgrade);
        assert_eq!(parsed.password.as_deref(), Some("123"));
        assert_eq!(parsed.proto, "HTTP/1.1");
    }

    #[test]
    fn test_parse_upgrade_is_case_insensitive() {
        let req = b"GET / HTTP/1.1\r\nUPGRADE: WebSocket\r\n\r\n";
        assert!(head(req).unwrap().is_websocket_upgrade);
    }

    #[test]
    fn test_parse_plain_get_is_not_an_upgrade() {
        let req = b"GET /probe HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let parsed = head(req).unwrap();
        assert!(!parsed.is_websocket_upgrade);
        assert!(parsed.password.is_none());
    }

    #[test]
    fn test_parse_garbage_is_rejected() {
        assert!(head(b"\x16\x03\x01 not http\r\n\r\n").is_none());
        assert!(head(b"GET /incomplete HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn test_query_param_extraction() {
        assert_eq!(
            query_param("/?password=abc&x=1", "password").as_deref(),
            Some("abc")
        );
        assert_eq!(query_param("/?x=1", "password"), None);
        assert_eq!(query_param("/plain", "password"), None);
        assert_eq!(query_param("/?password=", "password").as_deref(), Some(""));
    }

    #[test]
    fn test_display_by_mode() {
        let mut config = Config {
            listen_addr: "127.0.0.1:1000".into(),
            destination_addr: "127.0.0.1:2000".into(),
            server_mode: true,
            ..Default::default()
        };
        let server = Server::new(config.clone()).unwrap();
        assert_eq!(
            server.to_string(),
            "tls://127.0.0.1:1000 <-> udp://127.0.0.1:2000"
        );

        config.server_mode = false;
        let client = Server::new(config).unwrap();
        assert_eq!(
            client.to_string(),
            "udp://127.0.0.1:1000 <-> tls://127.0.0.1:2000"
        );
    }
}
