//! Local HTTP tunnel into the development dyno.

use super::hookup::serve_listener;
use super::mux::{ChannelKind, Multiplexer};
use crate::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Listen on `local_port` and forward each connection to `remote_port`.
pub async fn start_http_tunnel(
    mux: Multiplexer,
    local_port: u16,
    remote_port: u16,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
    let addr = listener.local_addr()?;
    info!("Forwarding http://{} to remote port {}", addr, remote_port);

    let kind = ChannelKind::Tunnel { port: remote_port };
    Ok((addr, tokio::spawn(serve_listener(listener, mux, kind))))
}
