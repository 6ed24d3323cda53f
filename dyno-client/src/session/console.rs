//! Console access to a running development dyno.
//!
//! The session side listens on an ephemeral local port and turns each
//! connection into a remote shell; the `console` command finds that port in
//! the metadata record and attaches the local terminal to it.

use super::hookup::serve_listener;
use super::metadata::MetadataStore;
use super::mux::{ChannelKind, Multiplexer};
use super::terminal::RawModeGuard;
use crate::daemon::shutdown::ShutdownCoordinator;
use crate::{DynoError, Result};
use std::future::Future;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const CONSOLE_BUFFER: usize = 4096;

/// Start the console server and record its port. Each accepted connection
/// runs `command` remotely; closing the channel closes the connection.
pub async fn start_console_server(
    mux: Multiplexer,
    command: &str,
    store: &MetadataStore,
) -> Result<(u16, JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    store.set_console_port(port)?;
    info!("Console server listening on 127.0.0.1:{}", port);

    let kind = ChannelKind::Run {
        command: command.to_string(),
    };
    Ok((port, tokio::spawn(serve_listener(listener, mux, kind))))
}

/// Attach the local terminal to the console of the session running in the
/// directory `store` belongs to.
pub async fn reconnect(store: &MetadataStore) -> Result<()> {
    let port = store.console_port()?.ok_or_else(|| {
        DynoError::Config("no console port recorded; is a development dyno running here?".into())
    })?;

    let socket = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused => {
                DynoError::Connection("Unable to connect to development dyno".into())
            }
            _ => DynoError::Connection(e.to_string()),
        })?;
    debug!("Connected to console on port {}", port);

    let shutdown = ShutdownCoordinator::new();
    let _raw = RawModeGuard::enable()?;
    attach(socket, tokio::io::stdin(), tokio::io::stdout(), shutdown.wait_for_signal()).await
}

/// Pump `input` into `socket` and `socket` into `output` until either ends.
///
/// `interrupt` resolving ends the attachment with `UserInterrupt`.
pub async fn attach<S, I, O, F>(socket: S, mut input: I, mut output: O, interrupt: F) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let (mut from_console, mut to_console) = tokio::io::split(socket);
    let mut console_buf = vec![0u8; CONSOLE_BUFFER];
    let mut input_buf = vec![0u8; CONSOLE_BUFFER];
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                debug!("Console interrupted");
                return Err(DynoError::UserInterrupt);
            }
            read = from_console.read(&mut console_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Console closed");
                    break;
                }
                output.write_all(&console_buf[..n]).await?;
                output.flush().await?;
            }
            read = input.read(&mut input_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Local input closed");
                    break;
                }
                to_console.write_all(&input_buf[..n]).await?;
                to_console.flush().await?;
            }
        }
    }
    Ok(())
}
