//! Responses for unauthenticated connections and active probes.
//!
//! A host running the pipe must be indistinguishable from an ordinary web
//! server. Requests that fail the upgrade are either answered with a static
//! nginx-style 403 page, or tunneled into a local reverse proxy that rewrites
//! them onto a configured decoy origin.

use std::net::SocketAddr;

use anyhow::{Context as _, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::tunnel::{self, ReadEnd, WriteEnd};

/// Renders the static 403 page sent when no decoy is configured.
pub fn forbidden_response(proto: &str) -> String {
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");

    format!(
        "{proto} 403 Forbidden\r\n\
         Server: nginx\r\n\
         Date: {date}\r\n\
         Content-Type: text/html\r\n\
         Connection: close\r\n\
         \r\n\
         <html>\r\n\
         <head><title>403 Forbidden</title></head>\r\n\
         <body>\r\n\
         <center><h1>403 Forbidden</h1></center>\r\n\
         <hr><center>nginx</center>\r\n\
         </body>\r\n\
         </html>\r\n"
    )
}

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    target: Url,
}

/// Localhost reverse proxy that retargets every request to the decoy origin.
pub struct ProbeProxy {
    addr: SocketAddr,
}

impl ProbeProxy {
    /// Binds a random local port and starts serving; runs until `cancel`.
    pub async fn start(decoy_url: &str, cancel: CancellationToken) -> Result<Self> {
        let target = Url::parse(decoy_url).context("reverse proxy URL must be a valid URL")?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to start probe reverse proxy")?;
        let addr = listener.local_addr()?;

        let state = ProxyState {
            client: reqwest::Client::new(),
            target,
        };
        let app = Router::new().fallback(rewrite_to_decoy).with_state(state);

        info!("starting probe reverse proxy on {addr}");
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(err) = serve.await {
                error!("probe reverse proxy stopped: {err}");
            }
        });

        Ok(Self { addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Forwards one request to the decoy origin, keeping its URI.
async fn rewrite_to_decoy(State(state): State<ProxyState>, req: Request) -> Response {
    match forward(&state, req).await {
        Ok(resp) => resp,
        Err(err) => {
            error!("decoy request failed: {err:#}");
            Response::builder()
                .status(502)
                .body(Body::empty())
                .unwrap_or_default()
        }
    }
}

async fn forward(state: &ProxyState, req: Request) -> Result<Response> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut target = state.target.clone();
    target.set_path("");
    target.set_query(None);
    let url = format!("{}{}", target.as_str().trim_end_matches('/'), path_and_query);

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .context("invalid request method")?;

    let mut outbound = state.client.request(method, &url);
    for (name, value) in req.headers() {
        // The Host header is rewritten to the decoy's by the HTTP client.
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }

    let body = axum::body::to_bytes(req.into_body(), 1 << 20)
        .await
        .context("failed to read request body")?;
    let upstream = outbound
        .body(body)
        .send()
        .await
        .context("failed to reach the decoy origin")?;

    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        let lowered = name.as_str().to_ascii_lowercase();
        if matches!(
            lowered.as_str(),
            "connection" | "transfer-encoding" | "content-length"
        ) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }

    let bytes = upstream
        .bytes()
        .await
        .context("failed to read the decoy response")?;

    builder
        .body(Body::from(bytes))
        .context("failed to build the proxied response")
}

/// Answers a failed upgrade, either with the stub page or through the decoy.
///
/// `stream` is the recomposed connection: the already-consumed request bytes
/// replay first, so the decoy proxy sees the original request untouched.
pub async fn respond<S>(
    stream: S,
    proto: &str,
    proxy: Option<&ProbeProxy>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Some(proxy) = proxy else {
        debug!("no probe reverse proxy configured, responding with a stub 403 page");
        let mut stream = stream;
        let _ = stream.write_all(forbidden_response(proto).as_bytes()).await;
        let _ = stream.shutdown().await;
        return;
    };

    debug!("probe reverse proxy is configured, tunneling data to it");

    let proxy_conn = match TcpStream::connect(proxy.addr()).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("failed to connect to the probe reverse proxy: {err}");
            return;
        }
    };

    let (src_r, src_w) = tokio::io::split(stream);
    let (dst_r, dst_w) = tokio::io::split(proxy_conn);
    tunnel::tunnel(
        "probe-reverse-proxy".to_string(),
        (ReadEnd::raw(src_r), WriteEnd::raw(src_w)),
        (ReadEnd::raw(dst_r), WriteEnd::raw(dst_w)),
        cancel,
    )
    .await;
}
