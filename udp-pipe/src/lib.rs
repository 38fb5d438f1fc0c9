//! UDP-over-TLS pipe.
//!
//! Carries UDP datagrams as framed, padded messages over a WebSocket running
//! on TLS. One pipe instance runs in server mode (TLS in, UDP out) and one in
//! client mode (UDP in, TLS out); together they form a tunnel that looks like
//! ordinary HTTPS traffic to an observer and answers probes like a plain web
//! server.

pub mod codec;
pub mod dialer;
pub mod probe;
pub mod server;
pub mod tls;
pub mod tunnel;
pub mod udp;
pub mod ws;

pub use server::{Config, Server};
