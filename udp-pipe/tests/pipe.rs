//! End-to-end pipe tests: a client-mode and a server-mode instance wired
//! together against a UDP echo server, plus probe-resistance checks against
//! the raw TLS listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use udp_pipe::udp::UdpListener;
use udp_pipe::{tls, Config, Server};

/// UDP echo server that records everything it receives, in arrival order.
struct UdpEchoServer {
    addr: std::net::SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl UdpEchoServer {
    async fn start() -> Self {
        let mut listener = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok(mut conn) = listener.accept().await {
                let record = Arc::clone(&record);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 65536];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        record.lock().await.push(buf[..n].to_vec());
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { addr, received }
    }

    async fn received_msg(&self, num: usize) -> Option<Vec<u8>> {
        self.received.lock().await.get(num).cloned()
    }
}

async fn start_pipe(config: Config) -> Server {
    let mut server = Server::new(config).unwrap();
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn test_pipe_echo_end_to_end() {
    let echo = UdpEchoServer::start().await;

    let pipe_server = start_pipe(Config {
        listen_addr: "127.0.0.1:0".into(),
        destination_addr: echo.addr.to_string(),
        password: "123123".into(),
        server_mode: true,
        ..Default::default()
    })
    .await;
    let server_addr = pipe_server.local_addr().unwrap();

    let pipe_client = start_pipe(Config {
        listen_addr: "127.0.0.1:0".into(),
        destination_addr: server_addr.to_string(),
        password: "123123".into(),
        server_mode: false,
        ..Default::default()
    })
    .await;
    let client_addr = pipe_client.local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(client_addr).await.unwrap();

    let mut buf = vec![0u8; 65536];
    for i in 0..1000 {
        let msg = format!("test message {i}: {}", "a".repeat(i)).into_bytes();

        socket.send(&msg).await.unwrap();

        let n = timeout(Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for echo of message {i}"))
            .unwrap();
        assert_eq!(&buf[..n], &msg[..], "echo mismatch at message {i}");

        let recorded = echo.received_msg(i).await;
        assert_eq!(recorded.as_deref(), Some(&msg[..]), "echo server missed message {i}");
    }

    pipe_client.shutdown(Duration::from_secs(3)).await.ok();
    pipe_server.shutdown(Duration::from_secs(3)).await.ok();
}

/// Opens a TLS connection to the pipe and sends a bare HTTP probe request.
async fn send_probe(addr: std::net::SocketAddr) -> Vec<u8> {
    let connector = TlsConnector::from(tls::client_config(false).unwrap());
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = connector
        .connect(tls::server_name("example.com").unwrap(), tcp)
        .await
        .unwrap();

    stream
        .write_all(b"GET /probe HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);

        // Stop once a framed HTTP response with a body has arrived.
        if let Some(done) = response_complete(&response) {
            if done {
                break;
            }
        }
    }

    response
}

/// Returns Some(true) once the response head plus content-length body is in.
fn response_complete(bytes: &[u8]) -> Option<bool> {
    let head_end = bytes.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&bytes[..head_end]).ok()?;

    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len: usize = value.trim().parse().ok()?;
                return Some(bytes.len() >= head_end + len);
            }
        }
    }

    // No content-length: wait for the connection to close.
    Some(false)
}

#[tokio::test]
async fn test_probe_gets_forbidden_stub() {
    let echo = UdpEchoServer::start().await;

    let pipe_server = start_pipe(Config {
        listen_addr: "127.0.0.1:0".into(),
        destination_addr: echo.addr.to_string(),
        password: "123123".into(),
        server_mode: true,
        ..Default::default()
    })
    .await;

    let response = send_probe(pipe_server.local_addr().unwrap()).await;
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 403 Forbidden"), "got: {text}");
    assert!(text.contains("Server: nginx"));
    assert!(text.contains("<center><h1>403 Forbidden</h1></center>"));

    pipe_server.shutdown(Duration::from_secs(3)).await.ok();
}

#[tokio::test]
async fn test_probe_is_proxied_to_decoy() {
    let echo = UdpEchoServer::start().await;

    // Decoy origin: answers every request with its own request URI.
    let decoy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let decoy_addr = decoy_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = decoy_listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut request = Vec::new();
                loop {
                    let Ok(n) = stream.read(&mut buf).await else { return };
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let head = String::from_utf8_lossy(&request);
                let uri = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
                    uri.len(),
                    uri
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    let pipe_server = start_pipe(Config {
        listen_addr: "127.0.0.1:0".into(),
        destination_addr: echo.addr.to_string(),
        password: "123123".into(),
        server_mode: true,
        probe_reverse_proxy_url: Some(format!("http://{decoy_addr}")),
        ..Default::default()
    })
    .await;

    let response = send_probe(pipe_server.local_addr().unwrap()).await;
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with("/probe"), "decoy should have seen the URI, got: {text}");

    pipe_server.shutdown(Duration::from_secs(3)).await.ok();
}
