//! Command-line entry point for the UDP-over-TLS pipe.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use udp_pipe::{Config, Server};

#[derive(Parser, Debug)]
#[command(name = "udp-pipe")]
#[command(version)]
#[command(about = "Carries UDP over a TLS + WebSocket tunnel with probe resistance")]
struct Args {
    /// Enable server mode. By default the tool runs in client mode.
    #[arg(short = 's', long = "server")]
    server: bool,

    /// Address the tool will be listening to.
    #[arg(short = 'l', long = "listen", value_name = "IP:PORT")]
    listen: String,

    /// Address the tool will connect to.
    #[arg(short = 'd', long = "destination", value_name = "IP:PORT")]
    destination: String,

    /// Password used to detect if the client is allowed.
    #[arg(short = 'p', long = "password", default_value = "")]
    password: String,

    /// URL of a SOCKS5 proxy to use when connecting to the destination.
    #[arg(short = 'x', long = "proxy", value_name = "socks5://[user:pass@]host[:port]")]
    proxy: Option<String>,

    /// Enable server TLS certificate verification in client mode.
    #[arg(long = "secure")]
    secure: bool,

    /// TLS server name sent in the ClientHello in client mode and used for
    /// the stub certificate in server mode.
    #[arg(long = "tls-servername", value_name = "HOSTNAME")]
    tls_servername: Option<String>,

    /// Path to the TLS certificate file for server mode. If not set, a
    /// self-signed stub certificate is generated.
    #[arg(long = "tls-certfile", value_name = "PATH")]
    tls_certfile: Option<PathBuf>,

    /// Path to the private key for the certificate in --tls-certfile.
    #[arg(long = "tls-keyfile", value_name = "PATH")]
    tls_keyfile: Option<PathBuf>,

    /// Unauthorized requests and probes will be proxied to this URL.
    #[arg(long = "probe-reverseproxyurl", value_name = "URL")]
    probe_reverseproxyurl: Option<String>,

    /// Verbose output.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config {
        listen_addr: args.listen,
        destination_addr: args.destination,
        password: args.password,
        server_mode: args.server,
        proxy_url: args.proxy,
        verify_certificate: args.secure,
        tls_server_name: args.tls_servername,
        tls_cert_path: args.tls_certfile,
        tls_key_path: args.tls_keyfile,
        probe_reverse_proxy_url: args.probe_reverseproxyurl,
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to create the server: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.start().await {
        error!("failed to start the server: {err:#}");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await?;
    info!("received interrupt, shutting down");

    if let Err(err) = server.shutdown(Duration::from_secs(10)).await {
        error!("shutdown did not complete cleanly: {err:#}");
    }

    Ok(())
}
